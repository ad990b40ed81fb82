//! Streamable HTTP transport handler for MCP
//!
//! `POST /mcp` runs every request through the admission pipeline before it
//! reaches a session's protocol engine:
//!
//! | Stage | Check                        | Rejection                    |
//! |-------|------------------------------|------------------------------|
//! | 1     | gateway draining             | 503 + `Retry-After`          |
//! | 2     | body size ceiling            | 413                          |
//! | 3     | credential present           | 401 (when auth is required)  |
//! | 4     | `Origin` / `Referer`         | 403                          |
//! | 5     | sliding-window rate limit    | 429 + `Retry-After`          |
//! | 6     | body parses as JSON          | 400 + parse error            |
//! | 7     | session capacity             | 503 "service busy"           |
//! | 8     | JSON-RPC dispatch            | JSON-RPC error envelope      |
//!
//! # Usage
//!
//! ```http
//! POST /mcp
//! Content-Type: application/json
//! Mcp-Session-Id: 6f1c...
//!
//! {"jsonrpc":"2.0","id":1,"method":"tools/list"}
//! ```

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{codes, AdmissionError, McpServiceError, BUSY_RETRY_AFTER_SECS};
use crate::gateway::{ActiveRequestGuard, GatewayState};
use crate::mcp::envelope;
use crate::mcp::registry::RegistryError;
use crate::middleware::{check_credential, check_origin, client_address, peer_address};
use crate::services::RateLimiter;

/// Session id header, lower-cased for `HeaderName::from_static`.
pub const SESSION_HEADER: &str = "mcp-session-id";

const EVENT_STREAM: &str = "text/event-stream";

/// POST /mcp
pub async fn handle_mcp_post(State(state): State<GatewayState>, request: Request) -> Response {
    let Some(guard) = state.lifecycle.enter() else {
        debug!("Rejecting request while draining");
        return AdmissionError::ShuttingDown.into_response();
    };

    match process(&state, request, guard).await {
        Ok(response) => response,
        Err(err) => {
            warn!(status = err.status().as_u16(), error = %err, "Request rejected");
            err.into_response()
        }
    }
}

/// `guard` follows the dispatch task, so drain also waits for calls whose
/// client has already gone away.
async fn process(
    state: &GatewayState,
    request: Request,
    guard: ActiveRequestGuard,
) -> Result<Response, AdmissionError> {
    let config = &state.config;
    let peer = peer_address(&request);
    let (parts, body) = request.into_parts();
    let headers = parts.headers;

    let body = read_body_limited(&headers, body, config.max_body_size).await?;

    let credential = check_credential(&headers, config.require_auth)?;
    check_origin(&headers, &config.allowed_origins)?;

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    if let Some(limiter) = &state.rate_limiter {
        let client = client_address(&headers, peer, config.trust_forwarded_for);
        // Unknown ids share the anonymous bucket; minting ids must not mint quota.
        let live_session = match session_id.as_deref() {
            Some(id) => state
                .registry
                .get(id)
                .await
                .filter(|session| !session.is_closed())
                .map(|_| id),
            None => None,
        };
        let key = RateLimiter::key(live_session, &client);
        if !limiter.admit(&key) {
            return Err(AdmissionError::RateLimited {
                retry_after_secs: limiter.retry_after_secs(&key),
            });
        }
    }

    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "Malformed JSON body");
            let data = McpServiceError::Parse(format!("Parse error: {}", e)).into();
            return Ok((StatusCode::BAD_REQUEST, Json(envelope::failure(Value::Null, data)))
                .into_response());
        }
    };

    let resolved = match state.registry.resolve(session_id.as_deref()).await {
        Ok(resolved) => resolved,
        Err(RegistryError::CapacityReached { max }) => {
            warn!(max_sessions = max, "Session capacity reached");
            return Ok(service_busy());
        }
        Err(RegistryError::Closed) => return Err(AdmissionError::ShuttingDown),
        Err(other) => {
            error!(error = %other, "Session resolution failed");
            return Ok(internal_error(Value::Null));
        }
    };

    let session = resolved.session;
    if session.attach() {
        debug!(session_id = %resolved.session_id, "Engine attached to transport");
    }
    session.record_request(credential.as_deref());

    let request_id = message.get("id").cloned().unwrap_or(Value::Null);
    let engine = Arc::clone(session.engine());

    // Runs detached so a dropped connection does not cancel backend work.
    let mut dispatch = tokio::spawn(async move {
        let _guard = guard;
        engine.handle_request(message, credential.as_deref()).await
    });

    let outcome = tokio::select! {
        biased;
        joined = &mut dispatch => Ok(joined),
        _ = session.closed() => {
            dispatch.abort();
            Err(McpServiceError::SessionClosed)
        }
    };

    let mut response = match outcome {
        Ok(Ok(Some(reply))) => reply_response(reply, wants_event_stream(&headers)),
        Ok(Ok(None)) => StatusCode::ACCEPTED.into_response(),
        Ok(Err(join_error)) => {
            error!(session_id = %resolved.session_id, error = %join_error, "Dispatch task failed");
            internal_error(request_id)
        }
        Err(err) => {
            warn!(session_id = %resolved.session_id, "Session closed with request in flight");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(envelope::failure(request_id, err.into())),
            )
                .into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&resolved.session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

/// Read the body, refusing anything over `limit` bytes.
///
/// A declared `Content-Length` over the limit is rejected before reading. For
/// streamed bodies the chunk that crosses the limit is the last one read.
pub async fn read_body_limited(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<Bytes, AdmissionError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(AdmissionError::PayloadTooLarge { limit });
    }

    let mut stream = body.into_data_stream();
    let mut buffer = Vec::with_capacity(declared.map_or(0, |len| len as usize));
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AdmissionError::BodyRead(e.to_string()))?;
        if buffer.len() + chunk.len() > limit {
            return Err(AdmissionError::PayloadTooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

/// True when the client accepts only SSE.
fn wants_event_stream(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let types: Vec<&str> = accept
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .collect();

    types.contains(&EVENT_STREAM)
        && !types
            .iter()
            .any(|t| *t == "application/json" || *t == "*/*" || *t == "application/*")
}

fn reply_response(reply: Value, event_stream: bool) -> Response {
    if !event_stream {
        return (StatusCode::OK, Json(reply)).into_response();
    }

    let event = format!("event: message\ndata: {}\n\n", reply);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, EVENT_STREAM),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        event,
    )
        .into_response()
}

fn service_busy() -> Response {
    let data = rmcp::model::ErrorData::new(
        codes::SERVICE_BUSY,
        "Service busy: session capacity reached",
        Some(serde_json::json!({ "retry_after": BUSY_RETRY_AFTER_SECS })),
    );
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(envelope::failure(Value::Null, data)),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(BUSY_RETRY_AFTER_SECS));
    response
}

fn internal_error(id: Value) -> Response {
    let data = McpServiceError::Internal(String::new()).into();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(envelope::failure(id, data)),
    )
        .into_response()
}
