//! Tracing setup and redaction helpers.
//!
//! Everything that logs request or backend payloads runs them through
//! [`redact`] first. Credentials themselves are never logged; use
//! [`fingerprint`] to correlate log lines that involve the same token.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const REDACTED: &str = "[REDACTED]";

const DEFAULT_FILTER: &str = "graphmcp=info,tower_http=info,axum::rejection=trace";

static SENSITIVE_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(pass(word|wd)?|secret|token|api[_-]?key|authorization|credential|cookie|session[_-]?key|private[_-]?key)",
    )
    .expect("sensitive field pattern is valid")
});

/// Output format for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
}

/// True when a field name looks like it carries a credential.
pub fn is_sensitive_field(name: &str) -> bool {
    SENSITIVE_FIELD.is_match(name)
}

/// Copy of `value` with every credential-shaped field masked, at any depth.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let masked = if is_sensitive_field(key) && !inner.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(inner)
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Short stable identifier for a credential, safe to log.
pub fn fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    hex::encode(&digest[..6])
}

/// Truncate `message` to `max_chars` characters, marking the cut.
pub fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... [truncated]", &message[..cut]),
        None => message.to_string(),
    }
}
