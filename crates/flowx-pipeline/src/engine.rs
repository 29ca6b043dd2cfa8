//! Flow execution engine: plan, preview, and run.
//!
//! A run has three phases: plan (derive edges and pick a flow path), preview
//! (a dry pass over a scratch copy that resolves references, stores inert
//! placeholder outputs and runs hooks), and the live pass over the same path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowx_agent::{JsonSchemaFactory, SchemaAgentConfig, ValidatorFactory};
use flowx_dag::{Library, Node, NodeOutput, Pipeline, ENTRY_NODE, EXIT_NODE};
use flowx_llm::{Embedder, NodeRequester};
use flowx_tools::{DocumentFetcher, DEFAULT_TOP_K};
use flowx_types::{FlowContext, FlowError, Lookup, Namespaces, Result};
use serde_json::Value;

use crate::events::{EventEmitter, FlowEvent};
use crate::executor::{prepare, run_hook, Pass, Prepared};
use crate::graph::build_edges;
use crate::handler::{default_registry, HandlerContext, HandlerRegistry};
use crate::hooks::{HookEvaluator, RhaiHookEvaluator};
use crate::path::find_execution_path;
use crate::reference::parse_reference;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Tunables for a [`FlowEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget for one hook evaluation.
    pub hook_time_budget: Duration,
    pub hook_max_operations: u64,
    pub schema: SchemaAgentConfig,
    /// Chunks a retrieve node returns when it names no `top_k`.
    pub default_top_k: usize,
    /// Store a null output instead of failing when a scheme node cannot
    /// produce a valid value.
    pub tolerate_translation_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hook_time_budget: Duration::from_millis(1000),
            hook_max_operations: 1_000_000,
            schema: SchemaAgentConfig::default(),
            default_top_k: DEFAULT_TOP_K,
            tolerate_translation_failure: false,
        }
    }
}

/// Observer invoked with every finalized node, in path order.
#[async_trait]
pub trait NodeCallback: Send + Sync {
    async fn on_node(&self, node: &Node) -> Result<()>;
}

#[async_trait]
impl<F> NodeCallback for F
where
    F: Fn(&Node) -> Result<()> + Send + Sync,
{
    async fn on_node(&self, node: &Node) -> Result<()> {
        self(node)
    }
}

/// The outcome of a live run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub flow_path: Vec<String>,
    /// Value named by the exit reference, or null when it names nothing.
    pub result: Value,
}

/// The pipeline engine. Owns the collaborators and the handler registry.
pub struct FlowEngine {
    requester: Arc<dyn NodeRequester>,
    embedder: Option<Arc<dyn Embedder>>,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
    hooks: Option<Arc<dyn HookEvaluator>>,
    validators: Arc<dyn ValidatorFactory>,
    library: Library,
    registry: HandlerRegistry,
    events: EventEmitter,
    config: EngineConfig,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn is_frame(name: &str) -> bool {
    name == ENTRY_NODE || name == EXIT_NODE
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// The value the exit reference names: an entry field, a node field, or a
/// context namespace field.
pub fn exit_value(pipeline: &Pipeline, namespaces: &Namespaces) -> Value {
    let Some(reference) = pipeline.exit_reference.as_deref().and_then(parse_reference) else {
        return Value::Null;
    };
    let Some(field) = reference.field else {
        return Value::Null;
    };
    let ns = reference.namespace;
    if ns == ENTRY_NODE {
        return pipeline.entry.get(field).cloned().unwrap_or(Value::Null);
    }
    if let Some(node) = pipeline.node(ns) {
        return node.field(field).unwrap_or(Value::Null);
    }
    match namespaces.lookup(ns, field) {
        Lookup::Value(value) => value,
        _ => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

impl FlowEngine {
    /// Create an engine with the default handlers, the Rhai hook evaluator
    /// and the JSON Schema validator.
    pub fn new(requester: Arc<dyn NodeRequester>) -> Self {
        Self {
            requester,
            embedder: None,
            fetcher: None,
            hooks: None,
            validators: Arc::new(JsonSchemaFactory),
            library: Library::new(),
            registry: default_registry(),
            events: EventEmitter::default(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_hook_evaluator(mut self, hooks: Arc<dyn HookEvaluator>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_validator_factory(mut self, validators: Arc<dyn ValidatorFactory>) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_library(mut self, library: Library) -> Self {
        self.library = library;
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn hook_evaluator(&self) -> Arc<dyn HookEvaluator> {
        match &self.hooks {
            Some(hooks) => hooks.clone(),
            None => Arc::new(RhaiHookEvaluator::new(
                self.config.hook_time_budget,
                self.config.hook_max_operations,
            )),
        }
    }

    /// Derive the edge set and pick the flow path.
    pub async fn plan(&self, pipeline: &Pipeline, context: &FlowContext) -> Result<Vec<String>> {
        let namespaces = context.namespaces().await;
        let edges = build_edges(pipeline, &namespaces)?;
        tracing::debug!(edges = edges.len(), "edges built");
        find_execution_path(&edges, pipeline, &namespaces)
    }

    /// Plan, then dry-run the path on a scratch copy of the pipeline.
    ///
    /// No request, embedding or fetch calls are made. Hooks run and may
    /// change the context; values read from context namespaces are
    /// remembered for the live pass.
    pub async fn preview_path(
        &self,
        pipeline: &Pipeline,
        context: &FlowContext,
        per_node: Option<&dyn NodeCallback>,
    ) -> Result<Vec<String>> {
        self.preview(&new_run_id(), pipeline, context, per_node).await
    }

    /// Execute `path` against the pipeline, storing outputs on its nodes.
    pub async fn run_path(
        &self,
        pipeline: &mut Pipeline,
        path: &[String],
        context: &FlowContext,
        per_node: Option<&dyn NodeCallback>,
    ) -> Result<RunReport> {
        self.run(&new_run_id(), pipeline, path, context, per_node).await
    }

    /// Preview, then run the previewed path live.
    pub async fn execute(
        &self,
        pipeline: &mut Pipeline,
        context: &FlowContext,
        per_node: Option<&dyn NodeCallback>,
    ) -> Result<RunReport> {
        let run_id = new_run_id();
        context.clear_memo().await;
        let path = self.preview(&run_id, pipeline, context, per_node).await?;
        self.run(&run_id, pipeline, &path, context, per_node).await
    }

    async fn preview(
        &self,
        run_id: &str,
        pipeline: &Pipeline,
        context: &FlowContext,
        per_node: Option<&dyn NodeCallback>,
    ) -> Result<Vec<String>> {
        let path = self.plan(pipeline, context).await?;
        self.events.emit(FlowEvent::PathResolved {
            run_id: run_id.to_string(),
            path: path.clone(),
        });

        let mut scratch = pipeline.clone();
        self.walk(run_id, &mut scratch, &path, context, per_node, Pass::Dry)
            .await?;
        Ok(path)
    }

    async fn run(
        &self,
        run_id: &str,
        pipeline: &mut Pipeline,
        path: &[String],
        context: &FlowContext,
        per_node: Option<&dyn NodeCallback>,
    ) -> Result<RunReport> {
        self.walk(run_id, pipeline, path, context, per_node, Pass::Live)
            .await?;
        let namespaces = context.namespaces().await;
        Ok(RunReport {
            run_id: run_id.to_string(),
            flow_path: path.to_vec(),
            result: exit_value(pipeline, &namespaces),
        })
    }

    /// Visit every real node of `path` in order.
    async fn walk(
        &self,
        run_id: &str,
        pipeline: &mut Pipeline,
        path: &[String],
        context: &FlowContext,
        per_node: Option<&dyn NodeCallback>,
        pass: Pass,
    ) -> Result<()> {
        let dry_run = pass == Pass::Dry;
        let hooks = self.hook_evaluator();
        let started = Instant::now();
        let names: Vec<&str> = path.iter().map(String::as_str).filter(|n| !is_frame(n)).collect();

        self.events.emit(FlowEvent::RunStarted {
            run_id: run_id.to_string(),
            dry_run,
            node_count: names.len(),
        });
        tracing::info!(run_id, dry_run, nodes = names.len(), "flow run started");

        for name in names {
            let mut node = pipeline
                .node(name)
                .cloned()
                .ok_or_else(|| FlowError::config(format!("{name} Node Not Found")))?;
            self.events.emit(FlowEvent::NodeStarted {
                node: name.to_string(),
                kind: node.kind().to_string(),
                dry_run,
            });
            tracing::info!(node = %name, kind = %node.kind(), dry_run, "node started");
            let node_started = Instant::now();

            if let Err(e) = self
                .step(&mut node, pipeline, context, hooks.as_ref(), pass)
                .await
            {
                tracing::error!(node = %name, error = %e, dry_run, "node failed");
                self.events.emit(FlowEvent::NodeFailed {
                    node: name.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }

            if let Some(callback) = per_node {
                callback.on_node(&node).await?;
            }
            if let Some(slot) = pipeline.node_mut(name) {
                *slot = node;
            }

            let duration_ms = elapsed_ms(node_started);
            self.events.emit(FlowEvent::NodeCompleted {
                node: name.to_string(),
                duration_ms,
            });
            tracing::debug!(node = %name, duration_ms, "node completed");
        }

        let duration_ms = elapsed_ms(started);
        self.events.emit(FlowEvent::RunCompleted {
            run_id: run_id.to_string(),
            dry_run,
            duration_ms,
        });
        tracing::info!(run_id, dry_run, duration_ms, "flow run completed");
        Ok(())
    }

    /// Prepare, produce the output (or its placeholder), and run the hook.
    async fn step(
        &self,
        node: &mut Node,
        pipeline: &Pipeline,
        context: &FlowContext,
        hooks: &dyn HookEvaluator,
        pass: Pass,
    ) -> Result<()> {
        let prepared = prepare(node, pipeline, &self.library, context, pass).await?;
        let output = match pass {
            Pass::Dry => NodeOutput::placeholder(node.kind()),
            Pass::Live => self.dispatch(node, &prepared, pipeline, context).await?,
        };
        node.output = Some(output);

        if node.func.is_some() {
            let output_changed = run_hook(node, hooks, &self.library, context).await?;
            self.events.emit(FlowEvent::HookEvaluated {
                node: node.name.clone(),
                output_changed,
            });
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        node: &mut Node,
        prepared: &Prepared,
        pipeline: &Pipeline,
        context: &FlowContext,
    ) -> Result<NodeOutput> {
        let kind = node.kind();
        let handler = self
            .registry
            .get(kind)
            .ok_or_else(|| FlowError::config(format!("no handler registered for {kind} nodes")))?;
        let cx = HandlerContext {
            context,
            library: &self.library,
            entry: &pipeline.entry,
            requester: self.requester.clone(),
            embedder: self.embedder.as_deref(),
            fetcher: self.fetcher.as_deref(),
            validators: self.validators.as_ref(),
            config: &self.config,
            events: &self.events,
        };
        handler.execute(node, prepared, &cx).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
