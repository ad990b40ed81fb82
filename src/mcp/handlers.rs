//! Auxiliary HTTP endpoints: health, tool catalog, session management.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::AdmissionError;
use crate::gateway::GatewayState;
use crate::mcp::http_transport::SESSION_HEADER;
use crate::mcp::registry::RegistryError;
use crate::middleware::{check_credential, check_origin};

/// GET /health
///
/// 200 when the backend answers and the gateway is accepting work, 503 otherwise.
pub async fn health(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
    let backend = match state.dispatcher.backend().health().await {
        Ok(latency) => json!({
            "reachable": true,
            "latency_ms": latency.as_millis() as u64,
        }),
        Err(e) => {
            warn!(error = %e, "Backend health check failed");
            json!({
                "reachable": false,
                "error": e.to_string(),
            })
        }
    };

    let lifecycle = &state.lifecycle;
    let draining = lifecycle.is_draining();
    let reachable = backend["reachable"].as_bool().unwrap_or(false);
    let (status, label) = match (draining, reachable) {
        (true, _) => (StatusCode::SERVICE_UNAVAILABLE, "draining"),
        (false, false) => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
        (false, true) => (StatusCode::OK, "ok"),
    };

    (
        status,
        Json(json!({
            "status": label,
            "backend": backend,
            "sessions": state.registry.len().await,
            "active_requests": lifecycle.active_requests(),
            "draining": draining,
            "uptime_secs": lifecycle.uptime().as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// GET /tools
pub async fn list_tools(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({ "tools": state.dispatcher.list_tools() }))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<GatewayState>) -> Json<Value> {
    let sessions = state.registry.list().await;
    Json(json!({
        "count": sessions.len(),
        "max_sessions": state.registry.max_sessions(),
        "sessions": sessions,
    }))
}

/// DELETE /sessions/{id}
pub async fn terminate_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> StatusCode {
    terminate(&state, &id).await
}

/// DELETE /mcp
///
/// Ends the session named by the `Mcp-Session-Id` header.
pub async fn delete_mcp_session(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<StatusCode, AdmissionError> {
    check_origin(&headers, &state.config.allowed_origins)?;
    check_credential(&headers, state.config.require_auth)?;

    let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return Ok(StatusCode::BAD_REQUEST);
    };
    Ok(terminate(&state, id.trim()).await)
}

/// GET /mcp
///
/// Server-initiated streams are not offered.
pub async fn mcp_stream_not_supported() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST, DELETE")],
    )
        .into_response()
}

async fn terminate(state: &GatewayState, id: &str) -> StatusCode {
    match state.registry.terminate(id).await {
        Ok(()) => {
            info!(session_id = %id, "Session terminated by client");
            StatusCode::NO_CONTENT
        }
        Err(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!(session_id = %id, error = %e, "Failed to terminate session");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
