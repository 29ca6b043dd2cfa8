use async_trait::async_trait;
use flowx_dag::Node;
use flowx_types::{FlowError, Result};
use serde_json::json;

use crate::{Embedder, Message, NodeRequester, Role};

// ---------------------------------------------------------------------------
// OpenAiClient
// ---------------------------------------------------------------------------

/// Chat-completions and embeddings client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }

    /// Reads `OPENAI_API_KEY`, plus optional `FLOWX_BASE_URL`, `FLOWX_MODEL`
    /// and `FLOWX_EMBEDDING_MODEL`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| FlowError::config("OPENAI_API_KEY is not set"))?;
        let mut client = Self::new(key);
        if let Ok(url) = std::env::var("FLOWX_BASE_URL") {
            client = client.with_base_url(url);
        }
        if let Ok(model) = std::env::var("FLOWX_MODEL") {
            client = client.with_model(model);
        }
        if let Ok(model) = std::env::var("FLOWX_EMBEDDING_MODEL") {
            client.embedding_model = model;
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_chat_body(&self, messages: &[Message], node: Option<&Node>) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();

        // Per-node overrides ride in the node's passthrough fields.
        let model = node
            .and_then(|n| n.extra.get("model"))
            .and_then(|v| v.as_str())
            .unwrap_or(self.model.as_str());

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(temp) = node
            .and_then(|n| n.extra.get("temperature"))
            .and_then(|v| v.as_f64())
        {
            body["temperature"] = json!(temp);
        }
        body
    }

    /// Send a chat history and return the first choice's text.
    pub async fn chat(&self, messages: &[Message], node: Option<&Node>) -> Result<String> {
        let body = self.build_chat_body(messages, node);
        let json = self.post("/v1/chat/completions", &body).await?;
        parse_chat_response(&json)
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| FlowError::ExternalCall {
                message: e.to_string(),
                retryable: true,
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| FlowError::ExternalCall {
            message: e.to_string(),
            retryable: true,
        })?;

        if !status.is_success() {
            return Err(map_error(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| FlowError::ExternalCall {
            message: format!("Failed to parse response JSON: {e}"),
            retryable: false,
        })
    }
}

fn parse_chat_response(body: &serde_json::Value) -> Result<String> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| FlowError::ExternalCall {
            message: "response carried no message content".into(),
            retryable: false,
        })
}

fn parse_embedding_response(body: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = body["data"].as_array().ok_or_else(|| FlowError::ExternalCall {
        message: "embedding response carried no data".into(),
        retryable: false,
    })?;
    let mut items: Vec<(u64, Vec<f32>)> = data
        .iter()
        .map(|item| {
            let index = item["index"].as_u64().unwrap_or(0);
            let vector = item["embedding"]
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect()
                })
                .unwrap_or_default();
            (index, vector)
        })
        .collect();
    items.sort_by_key(|(index, _)| *index);
    Ok(items.into_iter().map(|(_, v)| v).collect())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> FlowError {
    let code = status.as_u16();
    FlowError::ExternalCall {
        message: format!("HTTP {code}: {}", extract_error_message(body)),
        retryable: matches!(code, 429 | 500 | 502 | 503 | 504),
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl NodeRequester for OpenAiClient {
    async fn request(&self, node: &Node, prompt: &str) -> Result<String> {
        tracing::debug!(node = %node.name, model = %self.model, "chat completion request");
        self.chat(&[Message::user(prompt)], Some(node)).await
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| FlowError::ExternalCall {
            message: "embedding response was empty".into(),
            retryable: false,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.embedding_model, "input": texts });
        let json = self.post("/v1/embeddings", &body).await?;
        parse_embedding_response(&json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
