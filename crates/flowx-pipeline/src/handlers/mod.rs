//! Built-in kind handlers.

mod doc;
mod retrieve;

use async_trait::async_trait;
use flowx_agent::SchemaAgent;
use flowx_dag::{is_library_key, Node, NodeKind, NodeOutput, NodeSource};
use flowx_types::{FlowError, Result};
use serde_json::{Map, Value};

use crate::events::FlowEvent;
use crate::executor::{library_text, Prepared};
use crate::handler::{HandlerContext, KindHandler};

pub use doc::DocHandler;
pub use retrieve::RetrieveHandler;

/// Template marker that switches a prompt to minijinja rendering.
const TEMPLATE_MARKER: &str = "{{";

// ---------------------------------------------------------------------------
// PromptHandler
// ---------------------------------------------------------------------------

/// Sends the resolved prompt to the request callback.
pub struct PromptHandler;

/// Render a `{{ ... }}` template against the entry fields and the node's
/// resolved inputs, inputs taking precedence.
fn render_template(
    node: &str,
    text: &str,
    entry: &Map<String, Value>,
    inputs: &Map<String, Value>,
) -> Result<String> {
    let mut vars = entry.clone();
    vars.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
    minijinja::Environment::new()
        .render_str(text, &vars)
        .map_err(|e| FlowError::reference(node, format!("template error: {e}")))
}

#[async_trait]
impl KindHandler for PromptHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Prompt
    }

    async fn execute(
        &self,
        node: &mut Node,
        prepared: &Prepared,
        cx: &HandlerContext<'_>,
    ) -> Result<NodeOutput> {
        let prompt = if prepared.prompt.contains(TEMPLATE_MARKER) {
            render_template(&node.name, &prepared.prompt, cx.entry, &prepared.inputs)?
        } else {
            prepared.prompt.clone()
        };
        let text = cx.requester.request(node, &prompt).await?;
        Ok(NodeOutput::Text(text))
    }
}

// ---------------------------------------------------------------------------
// SchemeHandler
// ---------------------------------------------------------------------------

/// Asks for a structured response and validates it through the schema agent.
pub struct SchemeHandler;

#[async_trait]
impl KindHandler for SchemeHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Scheme
    }

    async fn execute(
        &self,
        node: &mut Node,
        prepared: &Prepared,
        cx: &HandlerContext<'_>,
    ) -> Result<NodeOutput> {
        let NodeSource::Scheme(source) = &node.source else {
            return Err(FlowError::config(format!(
                "{} is not a scheme node",
                node.name
            )));
        };
        let schema = if is_library_key(&source.schema) {
            library_text(cx.library, &source.schema)?
        } else {
            source.schema.clone()
        };
        let validator = cx
            .validators
            .create(&schema, source.type_name.as_deref())?;

        let agent = SchemaAgent::new(cx.requester.clone(), cx.config.schema.clone());
        match agent.translate(node, &prepared.prompt, validator.as_ref()).await {
            Ok(translation) => {
                if translation.repairs > 0 {
                    cx.events.emit(FlowEvent::SchemaRepaired {
                        node: node.name.clone(),
                    });
                }
                Ok(NodeOutput::Structured(translation.value))
            }
            Err(FlowError::Translation { message, .. }) if cx.config.tolerate_translation_failure => {
                tracing::warn!(node = %node.name, error = %message, "translation failed, continuing");
                node.extra
                    .insert("translation_error".into(), Value::String(message));
                Ok(NodeOutput::Structured(Value::Null))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for handler tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use flowx_agent::JsonSchemaFactory;
    use flowx_dag::{Library, Node};
    use flowx_llm::{Embedder, NodeRequester};
    use flowx_types::{FlowContext, Result};
    use serde_json::{Map, Value};

    use crate::engine::EngineConfig;
    use crate::events::EventEmitter;
    use crate::handler::HandlerContext;

    /// Replies from a fixed script, repeating the last entry, and records
    /// every prompt it sees.
    pub struct ScriptedRequester {
        replies: Vec<String>,
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedRequester {
        pub fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: replies.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NodeRequester for ScriptedRequester {
        async fn request(&self, _node: &Node, prompt: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            let reply = self
                .replies
                .get(n)
                .or(self.replies.last())
                .cloned()
                .unwrap_or_default();
            Ok(reply)
        }
    }

    /// Embeds text as `[len, vowels, 1]` and counts batch calls.
    #[derive(Default)]
    pub struct CountingEmbedder {
        pub batches: AtomicUsize,
        pub singles: AtomicUsize,
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count();
        vec![text.len() as f32, vowels as f32, 1.0]
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.singles.fetch_add(1, Ordering::SeqCst);
            Ok(vector(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vector(t)).collect())
        }
    }

    pub struct Fixture {
        pub context: FlowContext,
        pub library: Library,
        pub entry: Map<String, Value>,
        pub config: EngineConfig,
        pub events: EventEmitter,
        pub validators: JsonSchemaFactory,
    }

    impl Fixture {
        pub fn new() -> Self {
            let mut config = EngineConfig::default();
            config.schema.retry_pause = std::time::Duration::from_millis(1);
            Self {
                context: FlowContext::new(),
                library: Library::new(),
                entry: Map::new(),
                config,
                events: EventEmitter::default(),
                validators: JsonSchemaFactory,
            }
        }

        pub fn cx<'a>(
            &'a self,
            requester: Arc<dyn NodeRequester>,
            embedder: Option<&'a dyn Embedder>,
        ) -> HandlerContext<'a> {
            HandlerContext {
                context: &self.context,
                library: &self.library,
                entry: &self.entry,
                requester,
                embedder,
                fetcher: None,
                validators: &self.validators,
                config: &self.config,
                events: &self.events,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Fixture, ScriptedRequester};
    use super::*;
    use flowx_dag::{SchemeSource, TextSource};
    use serde_json::json;

    fn prepared(prompt: &str) -> Prepared {
        Prepared {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    fn scheme_node(schema: &str) -> Node {
        let mut node = Node::prompt("extract", "");
        node.source = NodeSource::Scheme(SchemeSource {
            text: TextSource {
                code: Some("Extract the person.".into()),
                path: None,
            },
            schema: schema.into(),
            type_name: None,
        });
        node
    }

    const PERSON: &str = r#"{
        "title": "Person",
        "type": "object",
        "properties": {"name": {"type": "string"}},
        "required": ["name"]
    }"#;

    #[tokio::test]
    async fn prompt_sends_resolved_text() {
        let fx = Fixture::new();
        let requester = ScriptedRequester::new(&["X"]);
        let mut node = Node::prompt("A", "hi");
        let out = PromptHandler
            .execute(&mut node, &prepared("hi there"), &fx.cx(requester.clone(), None))
            .await
            .unwrap();
        assert_eq!(out, NodeOutput::Text("X".into()));
        assert_eq!(requester.prompts.lock().unwrap()[0], "hi there");
    }

    #[tokio::test]
    async fn prompt_renders_double_brace_templates() {
        let mut fx = Fixture::new();
        fx.entry.insert("input_text".into(), json!("rust"));
        let requester = ScriptedRequester::new(&["ok"]);
        let mut node = Node::prompt("A", "");
        let mut prep = prepared("{% for t in tags %}{{ t }} {% endfor %}about {{ input_text }}");
        prep.inputs.insert("tags".into(), json!(["a", "b"]));

        PromptHandler
            .execute(&mut node, &prep, &fx.cx(requester.clone(), None))
            .await
            .unwrap();
        assert_eq!(requester.prompts.lock().unwrap()[0], "a b about rust");
    }

    #[tokio::test]
    async fn broken_template_is_reference_error() {
        let fx = Fixture::new();
        let mut node = Node::prompt("A", "");
        let err = PromptHandler
            .execute(
                &mut node,
                &prepared("{{ unclosed"),
                &fx.cx(ScriptedRequester::new(&["x"]), None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ReferenceResolution { .. }));
    }

    #[tokio::test]
    async fn scheme_returns_structured_value() {
        let fx = Fixture::new();
        let requester = ScriptedRequester::new(&[r#"Sure: {"name": "Ada"}"#]);
        let mut node = scheme_node(PERSON);
        let out = SchemeHandler
            .execute(&mut node, &prepared("Extract the person."), &fx.cx(requester.clone(), None))
            .await
            .unwrap();
        assert_eq!(out, NodeOutput::Structured(json!({"name": "Ada"})));
        assert_eq!(requester.count(), 1);
    }

    #[tokio::test]
    async fn scheme_repair_emits_event() {
        let fx = Fixture::new();
        let mut rx = fx.events.subscribe();
        let requester = ScriptedRequester::new(&[r#"{"age": 3}"#, r#"{"name": "Ada"}"#]);
        let mut node = scheme_node(PERSON);
        SchemeHandler
            .execute(&mut node, &prepared("p"), &fx.cx(requester.clone(), None))
            .await
            .unwrap();
        assert_eq!(requester.count(), 2);
        assert!(matches!(rx.try_recv(), Ok(FlowEvent::SchemaRepaired { .. })));
    }

    #[tokio::test]
    async fn scheme_schema_from_library() {
        let mut fx = Fixture::new();
        fx.library.insert("person.json", PERSON);
        let mut node = scheme_node("person.json");
        let out = SchemeHandler
            .execute(
                &mut node,
                &prepared("p"),
                &fx.cx(ScriptedRequester::new(&[r#"{"name": "Ada"}"#]), None),
            )
            .await
            .unwrap();
        assert_eq!(out.to_value()["name"], json!("Ada"));

        let mut node = scheme_node("other.json");
        let err = SchemeHandler
            .execute(&mut node, &prepared("p"), &fx.cx(ScriptedRequester::new(&["{}"]), None))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[tokio::test]
    async fn scheme_failure_is_fatal_unless_tolerated() {
        let mut fx = Fixture::new();
        let mut node = scheme_node(PERSON);
        let err = SchemeHandler
            .execute(&mut node, &prepared("p"), &fx.cx(ScriptedRequester::new(&["{}"]), None))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Translation { .. }));

        fx.config.tolerate_translation_failure = true;
        let out = SchemeHandler
            .execute(&mut node, &prepared("p"), &fx.cx(ScriptedRequester::new(&["{}"]), None))
            .await
            .unwrap();
        assert_eq!(out, NodeOutput::Structured(Value::Null));
        assert!(node.extra["translation_error"]
            .as_str()
            .unwrap()
            .contains("JSON validation failed"));
    }
}
