use async_trait::async_trait;
use flowx_dag::{Node, NodeKind, NodeOutput, NodeSource};
use flowx_llm::Embedder;
use flowx_tools::MemoryVectorStore;
use flowx_types::{Chunk, FlowError, Result};
use serde_json::json;

use crate::events::FlowEvent;
use crate::executor::Prepared;
use crate::handler::{HandlerContext, KindHandler};
use crate::reference::render_value;

/// Ranks the chunks of an upstream document against the node's query.
///
/// Document embeddings are cached on the context under the mark of the
/// first chunk, so several retrieve nodes over one document embed it once.
/// Cached embeddings are reused only while the cached chunks equal the
/// current ones; documents split differently under one mark re-embed.
pub struct RetrieveHandler;

async fn document_embeddings(
    node: &Node,
    chunks: Vec<Chunk>,
    embedder: &dyn Embedder,
    cx: &HandlerContext<'_>,
) -> Result<(Vec<Chunk>, Vec<Vec<f32>>)> {
    let mark = chunks[0].mark.clone();
    if let Some(cached) = cx.context.cached_document(&mark).await {
        match cached.embeddings {
            Some(embeddings) if cached.chunks == chunks => {
                tracing::debug!(node = %node.name, mark = %mark, "embedding cache hit");
                cx.events.emit(FlowEvent::CacheHit {
                    node: node.name.clone(),
                    mark,
                });
                return Ok((chunks, embeddings));
            }
            Some(_) => tracing::debug!(node = %node.name, mark = %mark, "cached chunks differ, re-embedding"),
            None => {}
        }
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let embeddings = embedder.embed_batch(&texts).await?;
    cx.context
        .cache_embeddings(mark, chunks.clone(), embeddings.clone())
        .await;
    Ok((chunks, embeddings))
}

#[async_trait]
impl KindHandler for RetrieveHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Retrieve
    }

    async fn execute(
        &self,
        node: &mut Node,
        prepared: &Prepared,
        cx: &HandlerContext<'_>,
    ) -> Result<NodeOutput> {
        let NodeSource::Retrieve(source) = &node.source else {
            return Err(FlowError::config(format!(
                "{} is not a retrieve node",
                node.name
            )));
        };
        let top_k = source.top_k.unwrap_or(cx.config.default_top_k);
        let doc_ref = source.doc.clone();

        // Observability only; the reply is not used.
        cx.requester.request(node, &prepared.prompt).await?;

        let embedder = cx.embedder.ok_or_else(|| {
            FlowError::config(format!("retrieve node `{}` needs an embedder", node.name))
        })?;
        let chunks = prepared
            .fields
            .get("doc")
            .and_then(Chunk::list_from_value)
            .ok_or_else(|| {
                FlowError::reference(&node.name, format!("{doc_ref} is not a chunk list"))
            })?;
        if chunks.is_empty() {
            return Ok(NodeOutput::Chunks(Vec::new()));
        }

        let (chunks, embeddings) = document_embeddings(node, chunks, embedder, cx).await?;
        let mut store = MemoryVectorStore::new();
        store.add(chunks, embeddings)?;

        let query = prepared
            .fields
            .get("query")
            .map(render_value)
            .unwrap_or_default();
        let query_vector = embedder.embed(&query).await?;

        let hits: Vec<Chunk> = store
            .similarity_search(&query_vector, top_k)
            .into_iter()
            .map(|(mut chunk, score)| {
                chunk.metadata.insert("score".into(), json!(score));
                chunk
            })
            .collect();
        tracing::info!(node = %node.name, hits = hits.len(), top_k, "retrieved chunks");
        Ok(NodeOutput::Chunks(hits))
    }
}
