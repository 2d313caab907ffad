//! MCP client over the streamable HTTP transport.
//!
//! JSON-RPC 2.0 requests are POSTed to a single endpoint. The server answers
//! with either a JSON body or a `text/event-stream` whose events carry the
//! response. After `initialize` the server may assign an `Mcp-Session-Id`,
//! which is echoed on every later request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ToolAdapter, ToolConnector, ToolError, ToolSpec};
use crate::config::Config;

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

/// Characters of a tool response shown in debug logs.
const PREVIEW_CHARS: usize = 500;

/// JSON-RPC 2.0 request. Notifications carry no id.
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Opens one [`McpClient`] session per run.
#[derive(Debug, Clone)]
pub struct McpConnector {
    url: String,
    api_key: String,
    timeout: Duration,
}

impl McpConnector {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.mcp_url.clone(),
            config.api_key.clone(),
            config.tool_timeout,
        )
    }
}

#[async_trait]
impl ToolConnector for McpConnector {
    async fn connect(&self) -> Result<Box<dyn ToolAdapter>, ToolError> {
        let client = McpClient::connect(&self.url, &self.api_key, self.timeout).await?;
        Ok(Box::new(client))
    }
}

/// A live MCP session.
pub struct McpClient {
    url: String,
    api_key: String,
    http: reqwest::Client,
    session_id: Option<String>,
    server_name: String,
    request_id: AtomicU64,
    tools: Mutex<Option<Vec<ToolSpec>>>,
}

impl McpClient {
    /// Connect and perform the initialization handshake:
    /// 1. `initialize`, remembering any session id the server assigns
    /// 2. `notifications/initialized`
    pub async fn connect(url: &str, api_key: &str, timeout: Duration) -> Result<Self, ToolError> {
        info!(url = %url, "Connecting to MCP server");

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::unreachable(format!("Failed to create HTTP client: {}", e)))?;

        let mut client = Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            http,
            session_id: None,
            server_name: String::new(),
            request_id: AtomicU64::new(1),
            tools: Mutex::new(None),
        };

        let id = client.next_id();
        let init = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method: "initialize",
            params: Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
        };
        let response = client.send(&init).await?;
        client.session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let result = into_result("initialize", read_response(response, id).await?)?;

        client.server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let initialized = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: "notifications/initialized",
            params: None,
        };
        client.send(&initialized).await?;

        info!(
            server = %client.server_name,
            session = client.session_id.as_deref().unwrap_or("-"),
            "MCP session established"
        );
        Ok(client)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// POST one message and check the HTTP status.
    async fn send(&self, message: &JsonRpcRequest<'_>) -> Result<reqwest::Response, ToolError> {
        let mut request = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session) = &self.session_id {
            request = request.header(SESSION_HEADER, session);
        }
        if message.method != "initialize" {
            request = request.header(PROTOCOL_HEADER, PROTOCOL_VERSION);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(message.method, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} returned HTTP {}: {}", message.method, status, body.trim());
        if status.is_server_error() {
            Err(ToolError::unreachable(detail))
        } else {
            Err(ToolError::rejected(detail))
        }
    }

    /// Send a request and return its `result`.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        let id = self.next_id();
        let message = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };
        let response = self.send(&message).await?;
        into_result(method, read_response(response, id).await?)
    }
}

#[async_trait]
impl ToolAdapter for McpClient {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let mut cached = self.tools.lock().await;
        if let Some(tools) = cached.as_ref() {
            return Ok(tools.clone());
        }

        let result = self.request("tools/list", None).await?;
        let tools: Vec<ToolSpec> = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|tool| {
                        let name = tool.get("name")?.as_str()?.to_string();
                        Some(ToolSpec {
                            name,
                            description: tool
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                            parameters: tool
                                .get("inputSchema")
                                .cloned()
                                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        info!(count = tools.len(), "MCP tools available");
        for tool in &tools {
            debug!(tool = %tool.name, description = %tool.description, "MCP tool");
        }
        *cached = Some(tools.clone());
        Ok(tools)
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<String, ToolError> {
        info!(tool = %name, "Calling MCP tool");
        let result = self
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;

        let text = render_content(&result);
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ToolError::rejected(format!(
                "tool '{}' reported an error: {}",
                name, text
            )));
        }

        info!(tool = %name, chars = text.chars().count(), "MCP response received");
        debug!(tool = %name, preview = %preview(&text), "MCP response preview");
        Ok(text)
    }
}

fn transport_error(method: &str, e: reqwest::Error) -> ToolError {
    if e.is_timeout() {
        ToolError::timeout(format!("{} timed out: {}", method, e))
    } else {
        ToolError::unreachable(format!("{} failed: {}", method, e))
    }
}

fn into_result(method: &str, response: JsonRpcResponse) -> Result<Value, ToolError> {
    if let Some(error) = response.error {
        return Err(ToolError::rejected(format!(
            "{} failed: [{}] {}",
            method, error.code, error.message
        )));
    }
    response
        .result
        .ok_or_else(|| ToolError::rejected(format!("{} returned no result", method)))
}

/// Read the response to request `id` from a JSON body or an event stream.
async fn read_response(response: reqwest::Response, id: u64) -> Result<JsonRpcResponse, ToolError> {
    let is_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if !is_stream {
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("read body", e))?;
        return serde_json::from_slice(&body)
            .map_err(|e| ToolError::rejected(format!("Malformed JSON-RPC response: {}", e)));
    }

    // The stream can stay open after our response, so stop at the first
    // event that answers `id` rather than reading to the end.
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| transport_error("read event stream", e))?;
        buffer.extend_from_slice(&chunk);
        while let Some((end, delimiter)) = event_boundary(&buffer) {
            let event = String::from_utf8_lossy(&buffer[..end]).into_owned();
            buffer.drain(..end + delimiter);
            if let Some(parsed) = parse_event(&event, id) {
                return Ok(parsed);
            }
        }
    }
    let rest = String::from_utf8_lossy(&buffer).into_owned();
    parse_event(&rest, id)
        .ok_or_else(|| ToolError::rejected("event stream ended without a response".to_string()))
}

/// Position and length of the first blank-line event delimiter.
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse one SSE event, returning it only if it is the response to `id`.
fn parse_event(event: &str, id: u64) -> Option<JsonRpcResponse> {
    let data = event
        .lines()
        .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect::<Vec<_>>()
        .join("\n");
    if data.trim().is_empty() {
        return None;
    }
    let response: JsonRpcResponse = serde_json::from_str(&data).ok()?;
    let matches = response.id.as_ref().and_then(Value::as_u64) == Some(id);
    matches.then_some(response)
}

/// Join the text items of a `tools/call` result.
fn render_content(result: &Value) -> String {
    let parts: Vec<String> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => item.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    if parts.is_empty() {
        if let Some(structured) = result.get("structuredContent") {
            return structured.to_string();
        }
    }
    parts.join("\n")
}

fn preview(text: &str) -> String {
    let total = text.chars().count();
    if total <= PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}\n... ({} more characters)", head, total - PREVIEW_CHARS)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex as StdMutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    #[derive(Default)]
    struct FakeServer {
        event_stream: bool,
        sessions_seen: StdMutex<Vec<(String, Option<String>)>>,
    }

    async fn handle(
        State(server): State<Arc<FakeServer>>,
        headers: HeaderMap,
        Json(req): Json<Value>,
    ) -> Response {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer test-key") {
            return (StatusCode::UNAUTHORIZED, "bad token").into_response();
        }
        let method = req["method"].as_str().unwrap_or_default().to_string();
        server.sessions_seen.lock().unwrap().push((
            method.clone(),
            headers
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        ));

        let result = match method.as_str() {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-armis", "version": "1.0"}
            }),
            "notifications/initialized" => return StatusCode::ACCEPTED.into_response(),
            "tools/list" => json!({"tools": [{
                "name": "armis_query",
                "description": "Ask the device inventory",
                "inputSchema": {"type": "object", "properties": {"prompt": {"type": "string"}}}
            }]}),
            "tools/call" => {
                let prompt = req["params"]["arguments"]["prompt"].as_str().unwrap_or("");
                match prompt {
                    "malformed" => {
                        let body = json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32602, "message": "invalid query"}});
                        return Json(body).into_response();
                    }
                    "fail" => json!({"content": [{"type": "text", "text": "query failed"}], "isError": true}),
                    _ => json!({"content": [
                        {"type": "text", "text": format!("devices matching {prompt}")},
                        {"type": "text", "text": "2 rows"}
                    ]}),
                }
            }
            _ => json!({}),
        };

        let body = json!({"jsonrpc": "2.0", "id": req["id"], "result": result});
        let mut response = if server.event_stream {
            let stream = format!(
                "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
                json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}),
                body
            );
            ([(CONTENT_TYPE, "text/event-stream")], stream).into_response()
        } else {
            Json(body).into_response()
        };
        if method == "initialize" {
            response
                .headers_mut()
                .insert(SESSION_HEADER, HeaderValue::from_static("sess-42"));
        }
        response
    }

    async fn spawn_server(server: Arc<FakeServer>) -> SocketAddr {
        let app = Router::new().route("/mcp", post(handle)).with_state(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, key: &str) -> Result<McpClient, ToolError> {
        McpClient::connect(&format!("http://{addr}/mcp"), key, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn handshake_lists_and_calls_tools() {
        let server = Arc::new(FakeServer::default());
        let addr = spawn_server(server.clone()).await;
        let client = connect(addr, "test-key").await.expect("connect");
        assert_eq!(client.server_name(), "fake-armis");

        let tools = client.list_tools().await.expect("list tools");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "armis_query");

        let text = client
            .invoke("armis_query", &json!({"prompt": "AA:BB"}))
            .await
            .expect("call");
        assert_eq!(text, "devices matching AA:BB\n2 rows");

        let seen = server.sessions_seen.lock().unwrap().clone();
        assert_eq!(seen[0], ("initialize".to_string(), None));
        assert!(seen[1..]
            .iter()
            .all(|(_, session)| session.as_deref() == Some("sess-42")));
    }

    #[tokio::test]
    async fn event_stream_responses_skip_unrelated_events() {
        let server = Arc::new(FakeServer {
            event_stream: true,
            ..Default::default()
        });
        let addr = spawn_server(server).await;
        let client = connect(addr, "test-key").await.expect("connect");
        let text = client
            .invoke("armis_query", &json!({"prompt": "cameras"}))
            .await
            .expect("call");
        assert_eq!(text, "devices matching cameras\n2 rows");
    }

    #[tokio::test]
    async fn application_errors_are_rejected() {
        let addr = spawn_server(Arc::new(FakeServer::default())).await;
        let client = connect(addr, "test-key").await.expect("connect");

        let rpc = client
            .invoke("armis_query", &json!({"prompt": "malformed"}))
            .await
            .unwrap_err();
        assert_eq!(rpc.kind, super::super::ToolErrorKind::Rejected);
        assert!(rpc.message.contains("invalid query"));

        let tool = client
            .invoke("armis_query", &json!({"prompt": "fail"}))
            .await
            .unwrap_err();
        assert_eq!(tool.kind, super::super::ToolErrorKind::Rejected);
        assert!(tool.message.contains("query failed"));
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let addr = spawn_server(Arc::new(FakeServer::default())).await;
        let err = connect(addr, "wrong-key").await.err().expect("must fail");
        assert_eq!(err.kind, super::super::ToolErrorKind::Rejected);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect(addr, "test-key").await.err().expect("must fail");
        assert_eq!(err.kind, super::super::ToolErrorKind::Unreachable);
    }

    #[test]
    fn event_boundary_handles_both_line_endings() {
        assert_eq!(event_boundary(b"data: x\n\nrest"), Some((7, 2)));
        assert_eq!(event_boundary(b"data: x\r\n\r\nrest"), Some((7, 4)));
        assert_eq!(event_boundary(b"data: x\n"), None);
    }

    #[test]
    fn structured_content_is_used_when_no_text_items() {
        let result = json!({"content": [], "structuredContent": {"devices": 3}});
        assert_eq!(render_content(&result), "{\"devices\":3}");
    }
}
