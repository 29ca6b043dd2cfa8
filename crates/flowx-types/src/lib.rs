//! Shared types, errors, and run context for the FlowX pipeline engine.
//!
//! This crate provides the foundational types used across all other FlowX crates:
//! - `FlowError`: unified error taxonomy
//! - `FlowContext`: caller-owned namespaces, artifact cache, and reference memo
//! - `Chunk`: a piece of split document text tagged with its provenance mark

mod chunk;
mod context;

pub use chunk::Chunk;
pub use context::{CachedDocument, FlowContext, Lookup, Namespaces};

/// Unified error type for all FlowX subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    // === Definition Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Definition parse error: {0}")]
    Parse(String),

    // === Planning Errors ===
    #[error("No valid execution path from '{entry}' to '{exit}'")]
    PathNotFound { entry: String, exit: String },

    // === Execution Errors ===
    #[error("[{node}] {message}")]
    ReferenceResolution { node: String, message: String },

    #[error("External call failed: {message}")]
    ExternalCall { message: String, retryable: bool },

    #[error("Translation failed on node '{node}': {message}")]
    Translation { node: String, message: String },

    #[error("Hook evaluation failed on node '{node}': {message}")]
    Evaluation { node: String, message: String },

    #[error("Node '{node}' produced no chunks from '{mark}'")]
    NoChunks { node: String, mark: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Shorthand for a [`FlowError::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        FlowError::Configuration(message.into())
    }

    /// Shorthand for a [`FlowError::ReferenceResolution`] attributed to `node`.
    pub fn reference(node: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::ReferenceResolution {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::ExternalCall { retryable: true, .. })
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowError::Configuration(_)
                | FlowError::Parse(_)
                | FlowError::PathNotFound { .. }
                | FlowError::ReferenceResolution { .. }
                | FlowError::NoChunks { .. }
        )
    }

    /// Name of the node the error is attributed to, when there is one.
    pub fn node(&self) -> Option<&str> {
        match self {
            FlowError::ReferenceResolution { node, .. }
            | FlowError::Translation { node, .. }
            | FlowError::Evaluation { node, .. }
            | FlowError::NoChunks { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, FlowError>`.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_configuration() {
        let err = FlowError::config("outputs reference not defined");
        assert_eq!(
            err.to_string(),
            "Configuration error: outputs reference not defined"
        );
    }

    #[test]
    fn error_display_reference_carries_node() {
        let err = FlowError::reference("summarize", "ctx.flag not defined");
        assert_eq!(err.to_string(), "[summarize] ctx.flag not defined");
        assert_eq!(err.node(), Some("summarize"));
    }

    #[test]
    fn error_display_path_not_found() {
        let err = FlowError::PathNotFound {
            entry: "inputs".into(),
            exit: "outputs".into(),
        };
        assert_eq!(
            err.to_string(),
            "No valid execution path from 'inputs' to 'outputs'"
        );
    }

    #[test]
    fn error_display_no_chunks() {
        let err = FlowError::NoChunks {
            node: "load".into(),
            mark: "guide.md".into(),
        };
        assert_eq!(err.to_string(), "Node 'load' produced no chunks from 'guide.md'");
    }

    #[test]
    fn retryable_only_for_flagged_external_calls() {
        let transient = FlowError::ExternalCall {
            message: "503".into(),
            retryable: true,
        };
        let permanent = FlowError::ExternalCall {
            message: "401".into(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!FlowError::config("x").is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(FlowError::config("x").is_terminal());
        assert!(FlowError::reference("a", "b").is_terminal());
        assert!(!FlowError::Other("x".into()).is_terminal());
        assert!(!FlowError::Translation {
            node: "n".into(),
            message: "m".into()
        }
        .is_terminal());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FlowError = io.into();
        assert!(matches!(err, FlowError::Io(_)));
        assert!(err.node().is_none());
    }
}
