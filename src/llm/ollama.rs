//! Ollama `/api/chat` client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ChatMessage, FunctionCall, LlmClient, ModelError, ModelErrorKind, ModelResponse, Role, ToolCall};
use crate::tools::ToolSpec;

pub const DEFAULT_HOST: &str = "http://127.0.0.1:11434";

/// Client for a local Ollama runtime.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    host: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

/// Message as Ollama expects it. Tool results carry the tool name rather
/// than a call id.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<WireMessage>,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            host: normalize_host(host),
            http: reqwest::Client::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_HOST)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/api/chat", self.host);
        let request = ChatRequest {
            model,
            messages: to_wire(messages),
            tools: tools.iter().map(tool_schema).collect(),
            stream: false,
        };

        tracing::debug!(
            model = %model,
            messages = messages.len(),
            tools = tools.len(),
            "Sending chat request to Ollama"
        );

        let response = self.http.post(&url).json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::new(ModelErrorKind::Timeout, e.to_string())
            } else {
                ModelError::new(
                    ModelErrorKind::Unreachable,
                    format!("failed to reach Ollama at {} (is it running?): {}", self.host, e),
                )
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModelError::new(ModelErrorKind::Unreachable, e.to_string()))?;

        if !status.is_success() {
            let kind = if status.is_server_error() {
                ModelErrorKind::Unreachable
            } else {
                ModelErrorKind::Rejected
            };
            return Err(ModelError::new(
                kind,
                format!("Ollama returned HTTP {}: {}", status, body.trim()),
            ));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            ModelError::new(ModelErrorKind::Malformed, format!("invalid chat response: {}", e))
        })?;
        if let Some(error) = parsed.error {
            return Err(ModelError::new(ModelErrorKind::Rejected, error));
        }
        let message = parsed.message.ok_or_else(|| {
            ModelError::new(ModelErrorKind::Malformed, "chat response has no message")
        })?;

        Ok(ModelResponse {
            content: Some(message.content).filter(|c| !c.is_empty()),
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id.unwrap_or_default(),
                    function: FunctionCall {
                        name: call.function.name,
                        arguments: normalize_arguments(call.function.arguments),
                    },
                })
                .collect(),
        })
    }
}

fn to_wire(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            // Ids are only unique within one assistant turn.
            let tool_name = match msg.role {
                Role::Tool => msg.tool_call_id.as_ref().and_then(|id| {
                    messages[..i]
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::Assistant)
                        .and_then(|m| m.tool_calls.as_ref())
                        .and_then(|calls| calls.iter().find(|call| &call.id == id))
                        .map(|call| call.function.name.clone())
                }),
                _ => None,
            };
            WireMessage {
                role: msg.role,
                content: msg.content.clone().unwrap_or_default(),
                tool_calls: msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|call| WireToolCall {
                        id: None,
                        function: WireFunction {
                            name: call.function.name.clone(),
                            arguments: call.function.arguments.clone(),
                        },
                    })
                    .collect(),
                tool_name,
            }
        })
        .collect()
}

fn tool_schema(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// Some models emit the argument object as a JSON string.
fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        Value::Null => json!({}),
        other => other,
    }
}

fn normalize_host(host: &str) -> String {
    let mut host = host.trim().to_string();
    if host.is_empty() {
        host = DEFAULT_HOST.to_string();
    }
    if !host.starts_with("http://") && !host.starts_with("https://") {
        host = format!("http://{host}");
    }
    host.trim_end_matches('/').to_string()
}
