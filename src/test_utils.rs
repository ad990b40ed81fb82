pub mod test_helpers {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header, Request, Response},
    };
    use serde_json::Value;

    use crate::config::{GatewayConfig, RateLimitConfig};
    use crate::mcp::SESSION_HEADER;

    /// Configuration pointing at `backend_url` with fast retries and no rate limit.
    pub fn test_config(backend_url: &str) -> GatewayConfig {
        GatewayConfig {
            backend_url: backend_url.to_string(),
            backend_timeout: Duration::from_secs(2),
            backend_max_retries: 2,
            backend_retry_base: Duration::from_millis(10),
            rate_limit: None,
            shutdown_timeout: Duration::from_secs(2),
            ..GatewayConfig::default()
        }
    }

    /// Rate limit of `max_requests` per `window`.
    pub fn rate_limit(max_requests: usize, window: Duration) -> Option<RateLimitConfig> {
        Some(RateLimitConfig {
            max_requests,
            window,
            sweep_interval: window,
        })
    }

    /// Build a `POST /mcp` request carrying `body`.
    pub fn mcp_request(body: &Value, session_id: Option<&str>) -> Request<Body> {
        mcp_request_with(body, session_id, &[])
    }

    pub fn mcp_request_with(
        body: &Value,
        session_id: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = session_id {
            builder = builder.header(SESSION_HEADER, id);
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("valid test request")
    }

    /// JSON-RPC `tools/call` envelope.
    pub fn tool_call(id: i64, name: &str, arguments: Value) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        })
    }

    /// Collect a response body and parse it as JSON (`Null` when empty).
    pub async fn body_json(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        if bytes.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&bytes).expect("JSON body")
    }

    /// Text content of the first item in a `tools/call` result.
    pub fn tool_text(reply: &Value) -> String {
        reply["result"]["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    pub fn session_id(response: &Response<Body>) -> Option<String> {
        response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}
