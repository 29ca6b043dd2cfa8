//! Flow event system for observability.
//!
//! Emits [`FlowEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (loggers, progress displays, tests) can follow a run without
//! coupling to the engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted while previewing or running a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlowEvent {
    PathResolved {
        run_id: String,
        path: Vec<String>,
    },
    RunStarted {
        run_id: String,
        dry_run: bool,
        node_count: usize,
    },
    RunCompleted {
        run_id: String,
        dry_run: bool,
        duration_ms: u64,
    },
    NodeStarted {
        node: String,
        kind: String,
        dry_run: bool,
    },
    NodeCompleted {
        node: String,
        duration_ms: u64,
    },
    NodeFailed {
        node: String,
        error: String,
    },
    HookEvaluated {
        node: String,
        output_changed: bool,
    },
    CacheHit {
        node: String,
        mark: String,
    },
    SchemaRepaired {
        node: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
