//! Graph building, path finding, and node execution for FlowX pipelines.
//!
//! This crate implements the FlowX runner: `${node.field}` reference
//! resolution, edge derivation, flow-path search with its validity check,
//! per-kind node handlers, sandboxed hooks, the dry/live engine passes, an
//! event stream, and the definition linter.

pub mod engine;
pub mod events;
pub mod executor;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod hooks;
pub mod path;
pub mod reference;
pub mod validation;

pub use engine::{exit_value, EngineConfig, FlowEngine, NodeCallback, RunReport};
pub use events::{EventEmitter, FlowEvent};
pub use executor::{prepare, run_hook, Pass, Prepared};
pub use graph::{build_edges, EdgeSet, FlowEdge};
pub use handler::{default_registry, HandlerContext, HandlerRegistry, KindHandler};
pub use handlers::{DocHandler, PromptHandler, RetrieveHandler, SchemeHandler};
pub use hooks::{HookEvaluator, RhaiHookEvaluator};
pub use path::{check_path, find_execution_path};
pub use reference::{decompose, extract_reference, parse_reference, substitute_placeholders, Reference};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
