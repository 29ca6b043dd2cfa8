//! Post-execution hooks (`func`) evaluated in a sandbox.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::{Map, Value};

/// Key under which the executing node is bound in a hook's scope.
pub const HOOK_NODE_KEY: &str = "node";

/// Evaluates hook source against a mutable scope of JSON values.
///
/// The scope holds every context namespace plus the node under
/// [`HOOK_NODE_KEY`]. Implementations write changed values back into the
/// map; errors are reported as plain messages.
pub trait HookEvaluator: Send + Sync {
    fn evaluate(&self, source: &str, scope: &mut Map<String, Value>) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Rhai
// ---------------------------------------------------------------------------

/// Hook evaluator backed by the Rhai scripting engine.
///
/// Each evaluation runs in a fresh engine bounded by an operation ceiling
/// and a wall-clock budget. Top-level variables of the scope are visible to
/// the script by name, so a hook can write `ctx.flag = true` or
/// `node.output = "..."`.
#[derive(Debug, Clone)]
pub struct RhaiHookEvaluator {
    time_budget: Duration,
    max_operations: u64,
}

impl RhaiHookEvaluator {
    pub fn new(time_budget: Duration, max_operations: u64) -> Self {
        Self {
            time_budget,
            max_operations,
        }
    }

    fn engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        engine.set_max_expr_depths(64, 64);

        let started = Instant::now();
        let budget = self.time_budget;
        engine.on_progress(move |_ops| {
            if started.elapsed() > budget {
                Some(Dynamic::from(format!(
                    "hook exceeded its {} ms time budget",
                    budget.as_millis()
                )))
            } else {
                None
            }
        });
        engine
    }
}

impl Default for RhaiHookEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 1_000_000)
    }
}

impl HookEvaluator for RhaiHookEvaluator {
    fn evaluate(&self, source: &str, scope: &mut Map<String, Value>) -> Result<(), String> {
        let engine = self.engine();

        let mut rhai_scope = Scope::new();
        for (name, value) in scope.iter() {
            let dynamic = rhai::serde::to_dynamic(value).map_err(|e| e.to_string())?;
            rhai_scope.push_dynamic(name.clone(), dynamic);
        }

        engine
            .run_with_scope(&mut rhai_scope, source)
            .map_err(|e| match *e {
                EvalAltResult::ErrorTerminated(ref reason, _) => reason.to_string(),
                ref other => other.to_string(),
            })?;

        for (name, _is_constant, value) in rhai_scope.iter() {
            let value: Value = rhai::serde::from_dynamic(&value).map_err(|e| e.to_string())?;
            // Scratch variables declared by the script are not namespaces.
            if scope.contains_key(name) || value.is_object() {
                scope.insert(name.to_string(), value);
            }
        }
        Ok(())
    }
}
