use async_trait::async_trait;
use flowx_dag::Node;
use flowx_types::Result;

// ---------------------------------------------------------------------------
// NodeRequester
// ---------------------------------------------------------------------------

/// The caller's request callback: receives the node being executed and its
/// fully resolved prompt, returns the external result.
///
/// Errors are surfaced unchanged and abort the run.
#[async_trait]
pub trait NodeRequester: Send + Sync {
    async fn request(&self, node: &Node, prompt: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. The default embeds them one at a time, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

/// Wraps a plain function as a [`NodeRequester`].
pub struct FnRequester<F>(F);

impl<F> FnRequester<F>
where
    F: Fn(&Node, &str) -> Result<String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> NodeRequester for FnRequester<F>
where
    F: Fn(&Node, &str) -> Result<String> + Send + Sync,
{
    async fn request(&self, node: &Node, prompt: &str) -> Result<String> {
        (self.0)(node, prompt)
    }
}

/// Wraps a plain function as an [`Embedder`].
pub struct FnEmbedder<F>(F);

impl<F> FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Embedder for FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (self.0)(text)
    }
}
