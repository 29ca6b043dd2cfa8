use async_trait::async_trait;
use flowx_dag::{Node, NodeKind, NodeOutput, NodeSource, SplitterConfig};
use flowx_tools::{splitter_for, TextSplitter};
use flowx_types::{Chunk, FlowError, Result};
use serde_json::Value;

use crate::events::FlowEvent;
use crate::executor::{library_text, Prepared};
use crate::handler::{HandlerContext, KindHandler};
use crate::reference::render_value;

/// Loads a document from a URL, the library, or an upstream chunk list and
/// splits it into marked chunks.
pub struct DocHandler;

/// Cache slot for the chunks of `url` split with `config`. Chunks keep the
/// bare URL as their mark.
fn url_cache_key(url: &str, config: &SplitterConfig) -> Result<String> {
    Ok(format!("{url}#{}", serde_json::to_string(config)?))
}

impl DocHandler {
    async fn from_url(
        &self,
        node: &Node,
        url: &str,
        config: &SplitterConfig,
        splitter: &dyn TextSplitter,
        cx: &HandlerContext<'_>,
    ) -> Result<Vec<Chunk>> {
        let key = url_cache_key(url, config)?;
        if let Some(cached) = cx.context.cached_document(&key).await {
            if !cached.chunks.is_empty() {
                tracing::debug!(node = %node.name, url, "document cache hit");
                cx.events.emit(FlowEvent::CacheHit {
                    node: node.name.clone(),
                    mark: url.to_string(),
                });
                return Ok(cached.chunks);
            }
        }

        let fetcher = cx.fetcher.ok_or_else(|| {
            FlowError::config(format!("doc node `{}` needs a document fetcher", node.name))
        })?;
        let text = fetcher.fetch(url).await?;
        let chunks = splitter.create_chunks(&text, url);
        cx.context.cache_chunks(key, chunks.clone()).await;
        Ok(chunks)
    }
}

fn split_reference(value: &Value, mark: &str, splitter: &dyn TextSplitter) -> Vec<Chunk> {
    match Chunk::list_from_value(value) {
        Some(chunks) => chunks
            .iter()
            .flat_map(|c| splitter.create_chunks(&c.content, mark))
            .collect(),
        None => splitter.create_chunks(&render_value(value), mark),
    }
}

#[async_trait]
impl KindHandler for DocHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Doc
    }

    async fn execute(
        &self,
        node: &mut Node,
        prepared: &Prepared,
        cx: &HandlerContext<'_>,
    ) -> Result<NodeOutput> {
        let NodeSource::Doc(source) = &node.source else {
            return Err(FlowError::config(format!("{} is not a doc node", node.name)));
        };
        let config = source.splitter.clone().unwrap_or_default();
        let raw_reference = source.reference.clone();

        // Observability only; the reply is not used.
        cx.requester.request(node, &prepared.prompt).await?;

        let splitter = splitter_for(&config)?;
        let field = |name: &str| prepared.fields.get(name).map(render_value);

        let (mark, chunks) = if let Some(url) = field("url") {
            let chunks = self.from_url(node, &url, &config, splitter.as_ref(), cx).await?;
            (url, chunks)
        } else if let Some(path) = field("path") {
            let text = library_text(cx.library, &path)?;
            let chunks = splitter.create_chunks(&text, &path);
            (path, chunks)
        } else if let (Some(value), Some(raw)) = (prepared.fields.get("reference"), raw_reference) {
            let chunks = split_reference(value, &raw, splitter.as_ref());
            (raw, chunks)
        } else {
            return Err(FlowError::config(format!(
                "doc node `{}` needs a url, path or reference",
                node.name
            )));
        };

        if chunks.is_empty() {
            return Err(FlowError::NoChunks {
                node: node.name.clone(),
                mark,
            });
        }
        tracing::info!(node = %node.name, mark = %mark, chunks = chunks.len(), "document split");
        Ok(NodeOutput::Chunks(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Fixture, ScriptedRequester};
    use super::*;
    use flowx_dag::{DocSource, SplitterKind};
    use flowx_tools::DocumentFetcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        body: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentFetcher for CountingFetcher {
        async fn fetch(&self, _url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.to_string())
        }
    }

    fn doc_node(source: DocSource) -> Node {
        let mut node = Node::prompt("load", "");
        node.source = NodeSource::Doc(source);
        node
    }

    fn empty_source() -> DocSource {
        DocSource {
            url: None,
            path: None,
            reference: None,
            splitter: None,
            code: None,
        }
    }

    fn with_field(name: &str, value: Value) -> Prepared {
        let mut prepared = Prepared::default();
        prepared.fields.insert(name.into(), value);
        prepared
    }

    #[tokio::test]
    async fn library_path_is_split_and_marked() {
        let mut fx = Fixture::new();
        fx.library.insert("guide.md", "# One\n\nfirst\n\n# Two\n\nsecond");
        let requester = ScriptedRequester::new(&["ignored"]);
        let mut node = doc_node(DocSource {
            path: Some("guide.md".into()),
            splitter: Some(SplitterConfig {
                chunk_size: 12,
                chunk_overlap: 0,
                ..Default::default()
            }),
            ..empty_source()
        });

        let out = DocHandler
            .execute(&mut node, &with_field("path", json!("guide.md")), &fx.cx(requester.clone(), None))
            .await
            .unwrap();
        let chunks = out.as_chunks().unwrap();
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.mark == "guide.md"));
        assert_eq!(requester.count(), 1);
    }

    #[tokio::test]
    async fn url_documents_are_cached_by_url() {
        let fx = Fixture::new();
        let fetcher = CountingFetcher {
            body: "some page text",
            calls: AtomicUsize::new(0),
        };
        let mut cx = fx.cx(ScriptedRequester::new(&[""]), None);
        cx.fetcher = Some(&fetcher);
        let mut rx = fx.events.subscribe();

        let url = "https://example.com/page.txt";
        let mut node = doc_node(DocSource {
            url: Some(url.into()),
            ..empty_source()
        });
        for _ in 0..2 {
            let out = DocHandler
                .execute(&mut node, &with_field("url", json!(url)), &cx)
                .await
                .unwrap();
            assert_eq!(out.as_chunks().unwrap()[0].mark, url);
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.try_recv(), Ok(FlowEvent::CacheHit { .. })));
    }

    #[tokio::test]
    async fn url_cache_is_separate_per_splitter_config() {
        let fx = Fixture::new();
        let fetcher = CountingFetcher {
            body: "alpha beta gamma delta epsilon zeta",
            calls: AtomicUsize::new(0),
        };
        let mut cx = fx.cx(ScriptedRequester::new(&[""]), None);
        cx.fetcher = Some(&fetcher);

        let url = "https://example.com/words.txt";
        let node_with = |chunk_size: usize| {
            doc_node(DocSource {
                url: Some(url.into()),
                splitter: Some(SplitterConfig {
                    name: SplitterKind::Character,
                    chunk_size,
                    chunk_overlap: 0,
                    separator: Some(" ".into()),
                    ..Default::default()
                }),
                ..empty_source()
            })
        };

        let mut fine = node_with(12);
        let fine_out = DocHandler
            .execute(&mut fine, &with_field("url", json!(url)), &cx)
            .await
            .unwrap();
        let mut coarse = node_with(400);
        let coarse_out = DocHandler
            .execute(&mut coarse, &with_field("url", json!(url)), &cx)
            .await
            .unwrap();

        assert!(fine_out.as_chunks().unwrap().len() > 1);
        assert_eq!(coarse_out.as_chunks().unwrap().len(), 1);
        assert!(coarse_out.as_chunks().unwrap().iter().all(|c| c.mark == url));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn url_without_fetcher_is_configuration_error() {
        let fx = Fixture::new();
        let mut node = doc_node(DocSource {
            url: Some("https://example.com/a.md".into()),
            ..empty_source()
        });
        let err = DocHandler
            .execute(
                &mut node,
                &with_field("url", json!("https://example.com/a.md")),
                &fx.cx(ScriptedRequester::new(&[""]), None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[tokio::test]
    async fn reference_chunks_are_resplit_under_reference_mark() {
        let fx = Fixture::new();
        let mut node = doc_node(DocSource {
            reference: Some("${load_a.output}".into()),
            splitter: Some(SplitterConfig {
                name: SplitterKind::Character,
                chunk_size: 8,
                chunk_overlap: 0,
                separator: Some(" ".into()),
                ..Default::default()
            }),
            ..empty_source()
        });
        let upstream = json!([{"content": "alpha beta gamma", "mark": "a.md", "metadata": {}}]);
        let out = DocHandler
            .execute(
                &mut node,
                &with_field("reference", upstream),
                &fx.cx(ScriptedRequester::new(&[""]), None),
            )
            .await
            .unwrap();
        let chunks = out.as_chunks().unwrap();
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.mark == "${load_a.output}"));
    }

    #[tokio::test]
    async fn zero_chunks_fail_for_every_strategy() {
        let mut fx = Fixture::new();
        fx.library.insert("blank.md", "   \n\n  ");
        for (name, language) in [
            (SplitterKind::Character, None),
            (SplitterKind::Recursive, None),
            (SplitterKind::Token, None),
            (SplitterKind::Markdown, None),
            (SplitterKind::Html, None),
            (SplitterKind::Code, Some("rust")),
        ] {
            let mut node = doc_node(DocSource {
                path: Some("blank.md".into()),
                splitter: Some(SplitterConfig {
                    name,
                    language: language.map(String::from),
                    ..Default::default()
                }),
                ..empty_source()
            });
            let err = DocHandler
                .execute(
                    &mut node,
                    &with_field("path", json!("blank.md")),
                    &fx.cx(ScriptedRequester::new(&[""]), None),
                )
                .await
                .unwrap_err();
            assert!(
                matches!(err, FlowError::NoChunks { ref mark, .. } if mark == "blank.md"),
                "{name:?}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn code_splitter_without_language_is_configuration_error() {
        let mut fx = Fixture::new();
        fx.library.insert("main.txt", "fn main() {}");
        let mut node = doc_node(DocSource {
            path: Some("main.txt".into()),
            splitter: Some(SplitterConfig {
                name: SplitterKind::Code,
                ..Default::default()
            }),
            ..empty_source()
        });
        let err = DocHandler
            .execute(
                &mut node,
                &with_field("path", json!("main.txt")),
                &fx.cx(ScriptedRequester::new(&[""]), None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }
}
