//! Kind handler trait and handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowx_agent::ValidatorFactory;
use flowx_dag::{Library, Node, NodeKind, NodeOutput};
use flowx_llm::{Embedder, NodeRequester};
use flowx_tools::DocumentFetcher;
use flowx_types::{FlowContext, Result};
use serde_json::{Map, Value};

use crate::engine::EngineConfig;
use crate::events::EventEmitter;
use crate::executor::Prepared;
use crate::handlers::{DocHandler, PromptHandler, RetrieveHandler, SchemeHandler};

/// Everything a handler may consult while producing a node's output.
pub struct HandlerContext<'a> {
    pub context: &'a FlowContext,
    pub library: &'a Library,
    /// Entry node fields, for template rendering.
    pub entry: &'a Map<String, Value>,
    pub requester: Arc<dyn NodeRequester>,
    pub embedder: Option<&'a dyn Embedder>,
    pub fetcher: Option<&'a dyn DocumentFetcher>,
    pub validators: &'a dyn ValidatorFactory,
    pub config: &'a EngineConfig,
    pub events: &'a EventEmitter,
}

// ---------------------------------------------------------------------------
// KindHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait KindHandler: Send + Sync {
    /// The node kind this handler executes.
    fn kind(&self) -> NodeKind;

    /// Produce the output of a live node whose references are resolved.
    ///
    /// Handlers may record passthrough fields on `node.extra`; the caller
    /// stores the returned output.
    async fn execute(
        &self,
        node: &mut Node,
        prepared: &Prepared,
        cx: &HandlerContext<'_>,
    ) -> Result<NodeOutput>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<NodeKind, Box<dyn KindHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: impl KindHandler + 'static) {
        self.handlers.insert(handler.kind(), Box::new(handler));
    }

    pub fn get(&self, kind: NodeKind) -> Option<&dyn KindHandler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }

    pub fn has(&self, kind: NodeKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        default_registry()
    }
}

/// A registry with the built-in prompt, scheme, doc and retrieve handlers.
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(PromptHandler);
    registry.register(SchemeHandler);
    registry.register(DocHandler);
    registry.register(RetrieveHandler);
    registry
}
