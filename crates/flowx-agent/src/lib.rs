//! Schema agent for FlowX `scheme` nodes.
//!
//! The agent asks the model for a JSON object of a given type, validates the
//! answer against the node's schema, and spends at most one repair round
//! feeding the validation error back before giving up.

pub mod retry;
mod validator;

use std::sync::Arc;
use std::time::Duration;

use flowx_dag::Node;
use flowx_llm::{last_user_content, Message, NodeRequester};
use flowx_types::{FlowError, Result};
use serde_json::Value;

pub use retry::complete_with_retry;
pub use validator::{
    JsonSchemaFactory, JsonSchemaValidator, SchemaValidator, ValidatorFactory, DEFAULT_TYPE_NAME,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchemaAgentConfig {
    /// Feed one validation failure back to the model before failing.
    pub attempt_repair: bool,
    /// Extra attempts when the model returns an empty response.
    pub retry_max_attempts: usize,
    pub retry_pause: Duration,
}

impl Default for SchemaAgentConfig {
    fn default() -> Self {
        Self {
            attempt_repair: true,
            retry_max_attempts: 3,
            retry_pause: Duration::from_secs(1),
        }
    }
}

/// A validated response together with the conversation that produced it.
#[derive(Debug, Clone)]
pub struct Translation {
    pub value: Value,
    pub messages: Vec<Message>,
    /// Number of repair rounds spent (0 or 1).
    pub repairs: usize,
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn request_prompt(validator: &dyn SchemaValidator, request: &str) -> String {
    format!(
        "You are a service that translates user requests into JSON objects of type \"{}\" \
         according to the following JSON Schema definitions:\n```\n{}\n```\n\
         The following is a user request:\n\"\"\"\n{}\n\"\"\"\n\
         The following is the user request translated into a JSON object with 2 spaces of \
         indentation and no properties with the value undefined:\n",
        validator.type_name(),
        validator.schema_text(),
        request
    )
}

fn repair_prompt(validation_error: &str) -> String {
    format!(
        "The JSON object is invalid for the following reason:\n\"\"\"\n{validation_error}\n\"\"\"\n\
         The following is a revised JSON object:\n"
    )
}

/// Substring from the first `{` to the last `}`, if there is such a pair.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

// ---------------------------------------------------------------------------
// SchemaAgent
// ---------------------------------------------------------------------------

pub struct SchemaAgent {
    requester: Arc<dyn NodeRequester>,
    config: SchemaAgentConfig,
}

impl SchemaAgent {
    pub fn new(requester: Arc<dyn NodeRequester>, config: SchemaAgentConfig) -> Self {
        Self { requester, config }
    }

    /// Turn `request` into a value accepted by `validator`.
    ///
    /// A response without a brace pair, or whose braces do not parse, fails
    /// at once. A response that parses but does not validate is repaired at
    /// most once when repair is enabled.
    pub async fn translate(
        &self,
        node: &Node,
        request: &str,
        validator: &dyn SchemaValidator,
    ) -> Result<Translation> {
        let fail = |message: String| FlowError::Translation {
            node: node.name.clone(),
            message,
        };

        let mut messages = vec![Message::user(request_prompt(validator, request))];
        let mut repairs = 0;

        loop {
            let prompt = last_user_content(&messages).unwrap_or_default().to_string();
            let response = complete_with_retry(
                || self.requester.request(node, &prompt),
                self.config.retry_max_attempts,
                self.config.retry_pause,
                &node.name,
            )
            .await?;

            let candidate = extract_object(&response)
                .ok_or_else(|| fail(format!("Response is not JSON:\n{response}")))?;
            let value: Value = serde_json::from_str(candidate)
                .map_err(|e| fail(format!("Response is not valid JSON: {e}\n{candidate}")))?;

            match validator.validate(&value) {
                Ok(()) => {
                    tracing::debug!(node = %node.name, repairs, "translation validated");
                    return Ok(Translation {
                        value,
                        messages,
                        repairs,
                    });
                }
                Err(reason) if self.config.attempt_repair && repairs == 0 => {
                    tracing::warn!(node = %node.name, reason = %reason, "translation invalid, attempting repair");
                    messages.push(Message::assistant(response.clone()));
                    messages.push(Message::user(format!("{response}\n{}", repair_prompt(&reason))));
                    repairs += 1;
                }
                Err(reason) => {
                    return Err(fail(format!("JSON validation failed: {reason}\n{candidate}")));
                }
            }
        }
    }
}
