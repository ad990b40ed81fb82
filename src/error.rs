use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use rmcp::model::{ErrorCode, ErrorData};
use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::envelope;
use crate::services::tool_dispatcher::DispatchError;

/// Gateway-specific JSON-RPC error codes.
///
/// Standard JSON-RPC codes come from [`rmcp::model::ErrorCode`]; the values here
/// live in the implementation-defined server range, grouped by band.
pub mod codes {
    use rmcp::model::ErrorCode;

    // Authentication / authorization band
    pub const UNAUTHORIZED: ErrorCode = ErrorCode(-32001);
    pub const ORIGIN_NOT_ALLOWED: ErrorCode = ErrorCode(-32003);

    // Throttling band
    pub const RATE_LIMITED: ErrorCode = ErrorCode(-32020);
    pub const SERVICE_BUSY: ErrorCode = ErrorCode(-32021);

    // Availability band
    pub const SHUTTING_DOWN: ErrorCode = ErrorCode(-32030);
    pub const PAYLOAD_TOO_LARGE: ErrorCode = ErrorCode(-32031);
    pub const SESSION_CLOSED: ErrorCode = ErrorCode(-32032);
}

/// Seconds clients are told to wait while the gateway drains or is full.
pub const BUSY_RETRY_AFTER_SECS: u64 = 5;

/// Rejections raised by the request pipeline before any session or backend work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Service temporarily unavailable: shutting down")]
    ShuttingDown,

    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    #[error("Missing credential")]
    Unauthorized,

    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AdmissionError::BodyRead(_) => StatusCode::BAD_REQUEST,
            AdmissionError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdmissionError::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AdmissionError::ShuttingDown => Some(BUSY_RETRY_AFTER_SECS),
            AdmissionError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn error_data(&self) -> ErrorData {
        let (code, data) = match self {
            AdmissionError::ShuttingDown => (
                codes::SHUTTING_DOWN,
                Some(json!({ "retry_after": BUSY_RETRY_AFTER_SECS })),
            ),
            AdmissionError::PayloadTooLarge { limit } => {
                (codes::PAYLOAD_TOO_LARGE, Some(json!({ "limit": limit })))
            }
            AdmissionError::BodyRead(_) => (ErrorCode::PARSE_ERROR, None),
            AdmissionError::Unauthorized => (codes::UNAUTHORIZED, None),
            AdmissionError::OriginNotAllowed(_) => (codes::ORIGIN_NOT_ALLOWED, None),
            AdmissionError::RateLimited { retry_after_secs } => (
                codes::RATE_LIMITED,
                Some(json!({ "retry_after": retry_after_secs })),
            ),
        };

        ErrorData {
            code,
            message: self.to_string().into(),
            data,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after_secs();
        let body = envelope::failure(Value::Null, self.error_data());

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"graphmcp\""),
            );
        }
        response
    }
}

/// Error types for the per-session protocol engine
///
/// Every variant maps onto a JSON-RPC error object via
/// `From<McpServiceError> for rmcp::ErrorData`.
///
/// | McpServiceError Variant | Code                | Reason                            |
/// |-------------------------|---------------------|-----------------------------------|
/// | Parse                   | PARSE_ERROR         | Body is not JSON                  |
/// | InvalidRequest          | INVALID_REQUEST     | Not a JSON-RPC 2.0 request        |
/// | MethodNotFound          | METHOD_NOT_FOUND    | Unsupported method                |
/// | InvalidParams           | INVALID_PARAMS      | Malformed method params           |
/// | Dispatch                | (see DispatchError) | Unknown tool or validation error  |
/// | SessionClosed           | SESSION_CLOSED      | Session closed while in flight    |
/// | Internal                | INTERNAL_ERROR      | Unexpected server error           |
#[derive(Debug, Error)]
pub enum McpServiceError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Session closed")]
    SessionClosed,

    /// Details stay in the server log; clients only see a generic message.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for McpServiceError {
    fn from(err: serde_json::Error) -> Self {
        McpServiceError::Internal(format!("Serialization failed: {}", err))
    }
}

impl From<McpServiceError> for ErrorData {
    fn from(err: McpServiceError) -> Self {
        match err {
            McpServiceError::Parse(msg) => ErrorData::new(ErrorCode::PARSE_ERROR, msg, None),
            McpServiceError::InvalidRequest(msg) => {
                ErrorData::new(ErrorCode::INVALID_REQUEST, msg, None)
            }
            McpServiceError::MethodNotFound(method) => ErrorData::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
                None,
            ),
            McpServiceError::InvalidParams(msg) => {
                ErrorData::new(ErrorCode::INVALID_PARAMS, msg, None)
            }
            McpServiceError::Dispatch(e) => e.into(),
            McpServiceError::SessionClosed => ErrorData::new(
                codes::SESSION_CLOSED,
                "Session closed before the request completed",
                None,
            ),
            McpServiceError::Internal(_) => {
                ErrorData::new(ErrorCode::INTERNAL_ERROR, "Internal error", None)
            }
        }
    }
}
