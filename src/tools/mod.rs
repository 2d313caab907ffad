//! Tool invocation boundary.
//!
//! The orchestrator only sees [`ToolAdapter`]: a named call with a JSON
//! argument payload that returns text or a [`ToolError`]. Expected failures
//! are returned as values and never retried here; retry policy belongs to the
//! agent loop.

pub mod mcp;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::template::ToolDeclaration;

pub use mcp::{McpClient, McpConnector};

/// Parameter names a free-text query tool is likely to accept, in order of
/// preference.
const QUERY_PARAM_CANDIDATES: [&str; 6] = ["query", "prompt", "question", "input", "text", "message"];

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: Value,
}

impl ToolSpec {
    /// A tool taking a single free-text `query` argument.
    pub fn query_tool(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural-language query"
                    }
                },
                "required": ["query"]
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Transport-level failure: connection refused, DNS, 5xx.
    Unreachable,
    /// The endpoint answered with an application-level error.
    Rejected,
    Timeout,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::Rejected => write!(f, "rejected"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Unreachable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Whether repeating the identical call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ToolErrorKind::Unreachable | ToolErrorKind::Timeout)
    }
}

/// One session against a tool endpoint.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tools the endpoint offers.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError>;

    /// Invoke a tool by its endpoint name and return its output as text.
    async fn invoke(&self, name: &str, arguments: &Value) -> Result<String, ToolError>;
}

/// Opens an independent [`ToolAdapter`] session for each run.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ToolAdapter>, ToolError>;
}

/// A declared tool resolved against what the endpoint offers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTool {
    /// What the model sees; `advertised.name` is the declared name.
    pub advertised: ToolSpec,
    /// Name to call on the endpoint.
    pub remote_name: String,
}

/// Map declared tools onto the endpoint's listing.
///
/// A declared name the endpoint also lists is used directly. Otherwise the
/// declaration is routed to the endpoint's first tool, which is the
/// natural-language query tool on the device-inventory endpoint. With an empty
/// listing the declared name and a plain query schema are used as-is, and the
/// endpoint gets to reject the call.
pub fn resolve_tools(declared: &[ToolDeclaration], available: &[ToolSpec]) -> Vec<ResolvedTool> {
    declared
        .iter()
        .map(|decl| {
            let remote = available
                .iter()
                .find(|t| t.name == decl.name)
                .or_else(|| available.first());
            match remote {
                Some(remote) => {
                    if remote.name != decl.name {
                        tracing::warn!(
                            declared = %decl.name,
                            remote = %remote.name,
                            "Declared tool not offered by endpoint, routing to its first tool"
                        );
                    }
                    let description = if decl.description.is_empty() {
                        remote.description.clone()
                    } else {
                        decl.description.clone()
                    };
                    ResolvedTool {
                        advertised: ToolSpec {
                            name: decl.name.clone(),
                            description,
                            parameters: remote.parameters.clone(),
                        },
                        remote_name: remote.name.clone(),
                    }
                }
                None => ResolvedTool {
                    advertised: ToolSpec::query_tool(&decl.name, &decl.description),
                    remote_name: decl.name.clone(),
                },
            }
        })
        .collect()
}

/// Every endpoint tool, advertised under its own name.
pub fn resolve_all(available: &[ToolSpec]) -> Vec<ResolvedTool> {
    available
        .iter()
        .map(|t| ResolvedTool {
            advertised: t.clone(),
            remote_name: t.name.clone(),
        })
        .collect()
}

/// Build the argument object for a free-text query against `spec`.
///
/// Picks the first well-known query parameter the schema declares, then the
/// first declared property, then `query`.
pub fn query_arguments(spec: &ToolSpec, query: &str) -> Value {
    let properties = spec.parameters.get("properties").and_then(Value::as_object);
    let param = properties
        .and_then(|props| {
            QUERY_PARAM_CANDIDATES
                .iter()
                .find(|c| props.contains_key(**c))
                .map(|c| c.to_string())
                .or_else(|| props.keys().next().cloned())
        })
        .unwrap_or_else(|| "query".to_string());

    let mut args = serde_json::Map::new();
    args.insert(param, Value::String(query.to_string()));
    Value::Object(args)
}
