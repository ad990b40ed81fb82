use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use reqwest::Url;
use tracing::{debug, warn};

use crate::error::AdmissionError;
use crate::gateway::GatewayState;

/// Header carrying the knowledge-store credential.
pub const CREDENTIAL_HEADER: &str = "x-graphiti-token";

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_CLIENT: &str = "unknown";

/// Extract Bearer token from Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth_header = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = auth_header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// The request's credential: the dedicated header first, then a Bearer token.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| extract_bearer_token(headers))
}

/// Returns the credential, or `Unauthorized` when one is required and absent.
pub fn check_credential(
    headers: &HeaderMap,
    require_auth: bool,
) -> Result<Option<String>, AdmissionError> {
    match extract_credential(headers) {
        None if require_auth => Err(AdmissionError::Unauthorized),
        credential => Ok(credential),
    }
}

/// Validate `Origin` (or the origin of `Referer`) against the allow-list.
///
/// An empty allow-list disables the check; `*` allows everything. Requests
/// carrying neither header are not browser-originated and pass.
pub fn check_origin(headers: &HeaderMap, allowed_origins: &[String]) -> Result<(), AdmissionError> {
    if allowed_origins.is_empty() {
        return Ok(());
    }

    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(normalize_origin)
        .or_else(|| {
            headers
                .get("referer")
                .and_then(|v| v.to_str().ok())
                .and_then(referer_origin)
        });

    let Some(origin) = origin else {
        debug!("No Origin or Referer header, skipping origin check");
        return Ok(());
    };

    let allowed = allowed_origins
        .iter()
        .any(|candidate| candidate == "*" || normalize_origin(candidate) == origin);

    if allowed {
        Ok(())
    } else {
        Err(AdmissionError::OriginNotAllowed(origin))
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn referer_origin(referer: &str) -> Option<String> {
    let url = Url::parse(referer).ok()?;
    let origin = url.origin();
    origin
        .is_tuple()
        .then(|| normalize_origin(&origin.ascii_serialization()))
}

/// Address used to key rate limits.
///
/// The first `X-Forwarded-For` hop is only believed when the gateway is
/// configured to trust its proxy.
pub fn client_address(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Peer address recorded by `into_make_service_with_connect_info`, if any.
pub fn peer_address(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Origin and credential checks for the operator endpoints.
pub async fn mcp_auth_middleware(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Result<Response, AdmissionError> {
    let headers = request.headers();

    if let Err(err) = check_origin(headers, &state.config.allowed_origins)
        .and_then(|_| check_credential(headers, state.config.require_auth).map(|_| ()))
    {
        warn!(path = %request.uri().path(), error = %err, "Rejected operator request");
        return Err(err);
    }

    Ok(next.run(request).await)
}
