//! Per-session MCP protocol engine
//!
//! [`GatewayMcpService`] turns one JSON-RPC message into at most one JSON-RPC
//! response. Each session owns its own engine; every engine shares the same
//! [`ToolDispatcher`].
//!
//! # Supported Methods
//!
//! | Method          | Result                                       |
//! |-----------------|----------------------------------------------|
//! | `initialize`    | server info and the tools capability         |
//! | `ping`          | `{}`                                         |
//! | `tools/list`    | the tool catalog                             |
//! | `tools/call`    | a `CallToolResult`                           |
//! | `notifications/*` or no `id` | acknowledged, no response       |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rmcp::model::{
    ErrorData, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::ServerHandler;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::McpServiceError;
use crate::mcp::envelope::{self, JSONRPC_VERSION};
use crate::services::ToolDispatcher;

#[derive(Clone)]
pub struct GatewayMcpService {
    session_id: String,
    dispatcher: Arc<ToolDispatcher>,
    initialized: Arc<AtomicBool>,
}

impl GatewayMcpService {
    pub fn new(session_id: impl Into<String>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            session_id: session_id.into(),
            dispatcher,
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Handle a single JSON-RPC message.
    ///
    /// Returns `None` for notifications, otherwise a complete response
    /// envelope carrying either a result or an error.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let response = engine
    ///     .handle_request(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), None)
    ///     .await;
    /// assert_eq!(response.unwrap()["result"], json!({}));
    /// ```
    pub async fn handle_request(&self, request: Value, credential: Option<&str>) -> Option<Value> {
        let (id, method, params) = match parse_envelope(&request) {
            Ok(Envelope::Request { id, method, params }) => (id, method, params),
            Ok(Envelope::Notification { method }) => {
                debug!(session_id = %self.session_id, method = %method, "Notification received");
                return None;
            }
            Err((id, err)) => {
                warn!(session_id = %self.session_id, error = %err, "Rejected malformed request");
                return Some(envelope::failure(id, err.into()));
            }
        };

        match self.route(&method, params, credential).await {
            Ok(result) => Some(envelope::success(id, result)),
            Err(err) => {
                match &err {
                    McpServiceError::Internal(detail) => {
                        error!(session_id = %self.session_id, method = %method, error = %detail, "Request failed")
                    }
                    other => {
                        warn!(session_id = %self.session_id, method = %method, error = %other, "Request rejected")
                    }
                }
                let data: ErrorData = err.into();
                Some(envelope::failure(id, data))
            }
        }
    }

    async fn route(
        &self,
        method: &str,
        params: Option<Value>,
        credential: Option<&str>,
    ) -> Result<Value, McpServiceError> {
        match method {
            "initialize" => {
                let client = params
                    .as_ref()
                    .and_then(|p| p.pointer("/clientInfo/name"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                self.initialized.store(true, Ordering::Release);
                info!(session_id = %self.session_id, client = %client, "Session initialized");

                let info = self.get_info();
                Ok(json!({
                    "protocolVersion": info.protocol_version,
                    "capabilities": info.capabilities,
                    "serverInfo": info.server_info,
                    "instructions": info.instructions,
                }))
            }

            "ping" => Ok(json!({})),

            "tools/list" => Ok(json!({
                "tools": self.dispatcher.list_tools(),
            })),

            "tools/call" => {
                let (name, arguments) = parse_call_params(params)?;
                debug!(session_id = %self.session_id, tool = %name, "Calling tool");
                let result = self.dispatcher.call(&name, arguments, credential).await?;
                Ok(serde_json::to_value(&result)?)
            }

            other => Err(McpServiceError::MethodNotFound(other.to_string())),
        }
    }
}

enum Envelope {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
    },
}

fn parse_envelope(request: &Value) -> Result<Envelope, (Value, McpServiceError)> {
    let object = match request {
        Value::Object(object) => object,
        Value::Array(_) => {
            return Err((
                Value::Null,
                McpServiceError::InvalidRequest("Batch requests are not supported".to_string()),
            ))
        }
        _ => {
            return Err((
                Value::Null,
                McpServiceError::InvalidRequest("Request must be a JSON object".to_string()),
            ))
        }
    };

    let id = match object.get("id") {
        Some(id @ (Value::String(_) | Value::Number(_) | Value::Null)) => Some(id.clone()),
        Some(_) => {
            return Err((
                Value::Null,
                McpServiceError::InvalidRequest("id must be a string or number".to_string()),
            ))
        }
        None => None,
    };
    let reply_id = id.clone().unwrap_or(Value::Null);

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err((
            reply_id,
            McpServiceError::InvalidRequest("jsonrpc must be \"2.0\"".to_string()),
        ));
    }

    let method = match object.get("method").and_then(Value::as_str) {
        Some(method) => method.to_string(),
        None => {
            return Err((
                reply_id,
                McpServiceError::InvalidRequest("Missing method field".to_string()),
            ))
        }
    };

    let params = object.get("params").cloned();

    Ok(match id {
        Some(id) => Envelope::Request { id, method, params },
        None => Envelope::Notification { method },
    })
}

fn parse_call_params(
    params: Option<Value>,
) -> Result<(String, Option<Map<String, Value>>), McpServiceError> {
    let mut params = match params {
        Some(Value::Object(params)) => params,
        _ => {
            return Err(McpServiceError::InvalidParams(
                "tools/call requires params object".to_string(),
            ))
        }
    };

    let name = match params.remove("name") {
        Some(Value::String(name)) => name,
        _ => return Err(McpServiceError::InvalidParams("Missing tool name".to_string())),
    };

    let arguments = match params.remove("arguments") {
        None | Some(Value::Null) => None,
        Some(Value::Object(arguments)) => Some(arguments),
        Some(_) => {
            return Err(McpServiceError::InvalidParams(
                "arguments must be an object".to_string(),
            ))
        }
    };

    Ok((name, arguments))
}

impl ServerHandler for GatewayMcpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "graphmcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Graph memory gateway".to_string()),
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Tools for storing and searching a knowledge graph. Call set_context to pick \
                 an active workspace; tools that take group_id use it when the id is omitted."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend_client::MockKnowledgeBackend;
    use crate::services::ContextManager;

    fn engine() -> GatewayMcpService {
        let dispatcher = ToolDispatcher::new(
            Arc::new(MockKnowledgeBackend::new()),
            Arc::new(ContextManager::new(5)),
        );
        GatewayMcpService::new("session-1", Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn initialize_reports_tools_capability() {
        let engine = engine();
        assert!(!engine.is_initialized());

        let response = engine
            .handle_request(
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                       "params": {"clientInfo": {"name": "test", "version": "1"}}}),
                None,
            )
            .await
            .unwrap();

        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["serverInfo"]["name"], "graphmcp");
        assert!(response["result"]["capabilities"]["tools"].is_object());
        assert!(engine.is_initialized());
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let response = engine()
            .handle_request(
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                None,
            )
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn rejects_batches_and_bad_envelopes() {
        let engine = engine();

        let response = engine.handle_request(json!([{"jsonrpc": "2.0"}]), None).await.unwrap();
        assert_eq!(response["error"]["code"], -32600);

        let response = engine
            .handle_request(json!({"jsonrpc": "1.0", "id": 2, "method": "ping"}), None)
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32600);
        assert_eq!(response["id"], 2);

        let response = engine
            .handle_request(json!({"jsonrpc": "2.0", "id": 3}), None)
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let response = engine()
            .handle_request(json!({"jsonrpc": "2.0", "id": "a", "method": "resources/list"}), None)
            .await
            .unwrap();
        assert_eq!(response["id"], "a");
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn tools_list_and_ping() {
        let engine = engine();
        let response = engine
            .handle_request(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}), None)
            .await
            .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "search_memory"));
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));

        let response = engine
            .handle_request(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}), None)
            .await
            .unwrap();
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn validation_failure_is_invalid_params_with_field() {
        let response = engine()
            .handle_request(
                json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call",
                       "params": {"name": "get_episodes", "arguments": {"last_n": 500, "group_id": "g"}}}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32602);
        assert_eq!(response["error"]["data"]["tool"], "get_episodes");
        assert_eq!(response["error"]["data"]["field"], "last_n");
    }

    #[tokio::test]
    async fn tools_call_requires_name() {
        let response = engine()
            .handle_request(
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"arguments": {}}}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32602);
    }
}
