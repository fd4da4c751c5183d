//! Language-model providers.
//!
//! OpenAI and Groq share the chat-completions wire format, including tool
//! calling and `response_format` structured output.

use async_trait::async_trait;
use dayline_core::{Error, Result};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::config::{LlmConfig, ResolvedProvider};
use crate::types::{ChatMessage, Completion, CompletionRequest, ToolCallRequest};

/// A language-completion collaborator.
///
/// The orchestrators depend only on this trait; tests script it.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

/// Client for OpenAI-compatible chat-completions APIs (OpenAI, Groq).
pub struct OpenAiCompatClient {
    client: Client,
    url: String,
    model: String,
    api_key: String,
}

impl std::fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("url", &self.url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiCompatClient {
    pub fn new(resolved: ResolvedProvider, client: Client) -> Self {
        Self {
            client,
            url: format!("{}/chat/completions", resolved.base_url.trim_end_matches('/')),
            model: resolved.model,
            api_key: resolved.api_key,
        }
    }

    /// Build a client for the provider `config` resolves to.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let resolved = config.resolve_provider().ok_or_else(|| {
            Error::Config("no LLM provider configured (set OPENAI_API_KEY or GROQ_API_KEY)".into())
        })?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Completion(format!("HTTP client: {}", e)))?;
        Ok(Self::new(resolved, client))
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = request_body(&self.model, &request);
        debug!(
            "Completion request to {} with model {} ({} messages, {} tools)",
            self.url,
            self.model,
            request.messages.len(),
            request.tools.len()
        );

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Completion(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("LLM API error {}: {}", status, body);
            return Err(Error::Completion(format!("API error {}: {}", status, body)));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Error::Completion(format!("Malformed response: {}", e)))?;
        parse_completion(&parsed)
    }
}

/// Wire representation of one message.
fn wire_message(message: &ChatMessage) -> Value {
    let mut wire = json!({"role": message.role, "content": message.content});
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                // Unparseable arguments are kept as the raw string and echoed back verbatim.
                let arguments = match &call.arguments {
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                };
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": arguments},
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

pub(crate) fn request_body(model: &str, request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": model,
        "messages": request.messages.iter().map(wire_message).collect::<Vec<_>>(),
    });
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect();
    }
    if let Some(schema) = &request.response_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {"name": schema.name, "schema": schema.schema, "strict": true},
        });
    }
    body
}

pub(crate) fn parse_completion(response: &Value) -> Result<Completion> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| Error::Completion("response has no choices".into()))?;

    let content = message["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let name = call["function"]["name"]
                .as_str()
                .ok_or_else(|| Error::Completion("tool call without a name".into()))?;
            // Arguments arrive as a JSON-encoded string. When that string does
            // not parse, the raw text is kept so the call can be rejected on
            // its own instead of failing the whole completion.
            let arguments = match &call["function"]["arguments"] {
                Value::String(s) if s.trim().is_empty() => json!({}),
                Value::String(s) => serde_json::from_str(s).unwrap_or_else(|e| {
                    warn!("tool call {} has invalid arguments: {}", name, e);
                    Value::String(s.clone())
                }),
                Value::Null => json!({}),
                other => other.clone(),
            };
            tool_calls.push(ToolCallRequest {
                id: call["id"].as_str().unwrap_or(name).to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    Ok(Completion {
        content,
        tool_calls,
    })
}
