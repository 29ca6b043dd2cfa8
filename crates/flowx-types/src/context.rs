// ---------------------------------------------------------------------------
// FlowContext: caller-owned run state
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::Chunk;

/// Run-scoped state shared by every node of a run.
///
/// Holds three things:
/// - context-variable namespaces (object-valued entries that references may
///   read instead of a node output),
/// - the artifact cache, keyed by provenance mark,
/// - the reference memo written by a dry pass and consulted by the live pass.
///
/// Cloning a `FlowContext` yields another handle to the **same** inner state,
/// so the caller can keep a handle and reuse the cache across runs. A single
/// context must not be driven by two concurrent runs.
#[derive(Clone, Default)]
pub struct FlowContext {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Default)]
struct ContextInner {
    namespaces: Map<String, Value>,
    documents: HashMap<String, CachedDocument>,
    memo: HashMap<(String, String), Value>,
}

/// Chunks of one document and, once computed, their embeddings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedDocument {
    pub chunks: Vec<Chunk>,
    pub embeddings: Option<Vec<Vec<f32>>>,
}

impl FlowContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded with the given namespaces.
    pub fn with_namespaces(namespaces: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner {
                namespaces,
                ..Default::default()
            })),
        }
    }

    /// Insert or replace a whole namespace.
    pub async fn set_namespace(&self, name: impl Into<String>, value: Value) {
        self.inner
            .write()
            .await
            .namespaces
            .insert(name.into(), value);
    }

    /// Set one field of a namespace, creating the namespace if needed.
    pub async fn set(&self, namespace: &str, field: impl Into<String>, value: Value) {
        let mut guard = self.inner.write().await;
        let entry = guard
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(field.into(), value);
        }
    }

    /// Read a whole namespace (cloned).
    pub async fn namespace(&self, name: &str) -> Option<Value> {
        self.inner.read().await.namespaces.get(name).cloned()
    }

    /// Point-in-time copy of every namespace, for synchronous planning code.
    pub async fn namespaces(&self) -> Namespaces {
        Namespaces::new(self.inner.read().await.namespaces.clone())
    }

    /// Replace all namespaces, e.g. with the result of a hook evaluation.
    pub async fn replace_namespaces(&self, namespaces: Map<String, Value>) {
        self.inner.write().await.namespaces = namespaces;
    }

    // -- artifact cache --------------------------------------------------------

    pub async fn cached_document(&self, mark: &str) -> Option<CachedDocument> {
        self.inner.read().await.documents.get(mark).cloned()
    }

    /// Store the chunks of a document. Embeddings survive only when the
    /// chunks are unchanged.
    pub async fn cache_chunks(&self, mark: impl Into<String>, chunks: Vec<Chunk>) {
        let mut guard = self.inner.write().await;
        let mark = mark.into();
        tracing::debug!(mark = %mark, chunks = chunks.len(), "document cached");
        let entry = guard.documents.entry(mark).or_default();
        if entry.chunks != chunks {
            entry.embeddings = None;
            entry.chunks = chunks;
        }
    }

    pub async fn cache_embeddings(
        &self,
        mark: impl Into<String>,
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
    ) {
        self.inner.write().await.documents.insert(
            mark.into(),
            CachedDocument {
                chunks,
                embeddings: Some(embeddings),
            },
        );
    }

    // -- reference memo ----------------------------------------------------------

    /// Record the value a reference resolved to for `scope` (`node:namespace`).
    pub async fn remember(&self, scope: impl Into<String>, field: impl Into<String>, value: Value) {
        self.inner
            .write()
            .await
            .memo
            .insert((scope.into(), field.into()), value);
    }

    pub async fn recall(&self, scope: &str, field: &str) -> Option<Value> {
        self.inner
            .read()
            .await
            .memo
            .get(&(scope.to_string(), field.to_string()))
            .cloned()
    }

    pub async fn clear_memo(&self) {
        self.inner.write().await.memo.clear();
    }
}

// ---------------------------------------------------------------------------
// Namespaces: synchronous view used by graph building and path checking
// ---------------------------------------------------------------------------

/// Outcome of looking up `namespace.field` among the context namespaces.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// No namespace of that name; the name should be treated as a node.
    Missing,
    /// The namespace exists but the field is absent or null.
    Undefined,
    Value(Value),
}

#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    values: Map<String, Value>,
}

impl Namespaces {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// A namespace is any object-valued entry.
    pub fn contains(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(Value::Object(_)))
    }

    pub fn lookup(&self, namespace: &str, field: &str) -> Lookup {
        match self.values.get(namespace) {
            Some(Value::Object(map)) => match map.get(field) {
                None | Some(Value::Null) => Lookup::Undefined,
                Some(value) => Lookup::Value(value.clone()),
            },
            _ => Lookup::Missing,
        }
    }

    /// `true` when the namespace exists and the field is defined and non-null.
    pub fn is_resolvable(&self, namespace: &str, field: &str) -> bool {
        matches!(self.lookup(namespace, field), Lookup::Value(_))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn set_creates_namespace() {
        let ctx = FlowContext::new();
        ctx.set("ctx", "flag", json!(true)).await;
        assert_eq!(ctx.namespace("ctx").await, Some(json!({"flag": true})));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let ctx = FlowContext::new();
        let other = ctx.clone();
        other.set_namespace("env", json!({"lang": "en"})).await;
        assert!(ctx.namespaces().await.contains("env"));
    }

    #[tokio::test]
    async fn lookup_distinguishes_missing_and_undefined() {
        let ctx = FlowContext::with_namespaces(ctx_map(json!({
            "ctx": {"flag": null, "name": "x"},
            "scalar": 3
        })));
        let ns = ctx.namespaces().await;
        assert_eq!(ns.lookup("ctx", "flag"), Lookup::Undefined);
        assert_eq!(ns.lookup("ctx", "other"), Lookup::Undefined);
        assert_eq!(ns.lookup("ctx", "name"), Lookup::Value(json!("x")));
        assert_eq!(ns.lookup("A", "output"), Lookup::Missing);
        // Only objects count as namespaces.
        assert_eq!(ns.lookup("scalar", "x"), Lookup::Missing);
        assert!(!ns.contains("scalar"));
        assert!(ns.is_resolvable("ctx", "name"));
        assert!(!ns.is_resolvable("ctx", "flag"));
    }

    #[tokio::test]
    async fn cache_chunks_keeps_embeddings_for_identical_chunks() {
        let ctx = FlowContext::new();
        let chunks = vec![Chunk::new("a", "doc")];
        ctx.cache_embeddings("doc", chunks.clone(), vec![vec![1.0, 0.0]])
            .await;
        ctx.cache_chunks("doc", chunks.clone()).await;
        let cached = ctx.cached_document("doc").await.unwrap();
        assert!(cached.embeddings.is_some());

        ctx.cache_chunks("doc", vec![Chunk::new("b", "doc")]).await;
        let cached = ctx.cached_document("doc").await.unwrap();
        assert!(cached.embeddings.is_none());
        assert_eq!(cached.chunks[0].content, "b");
    }

    #[tokio::test]
    async fn memo_round_trip_and_clear() {
        let ctx = FlowContext::new();
        ctx.remember("B:ctx", "flag", json!("on")).await;
        assert_eq!(ctx.recall("B:ctx", "flag").await, Some(json!("on")));
        assert_eq!(ctx.recall("C:ctx", "flag").await, None);
        ctx.clear_memo().await;
        assert_eq!(ctx.recall("B:ctx", "flag").await, None);
    }

    #[tokio::test]
    async fn replace_namespaces_overwrites() {
        let ctx = FlowContext::with_namespaces(ctx_map(json!({"a": {"x": 1}})));
        ctx.replace_namespaces(ctx_map(json!({"b": {"y": 2}}))).await;
        let ns = ctx.namespaces().await;
        assert!(!ns.contains("a"));
        assert!(ns.is_resolvable("b", "y"));
    }
}
