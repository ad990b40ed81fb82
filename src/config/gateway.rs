use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Errors produced while loading or validating [`GatewayConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid backend URL: {0}")]
    InvalidBackendUrl(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_millis(60_000),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Runtime parameters for the gateway.
///
/// Loaded from the environment by [`GatewayConfig::from_env`]; tests usually
/// start from [`GatewayConfig::default`] and override individual fields.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    /// Base URL of the knowledge-store API.
    pub backend_url: String,
    /// Static fallback credential used when a request carries none.
    pub backend_token: Option<String>,
    pub backend_timeout: Duration,
    pub backend_max_retries: u32,
    pub backend_retry_base: Duration,

    pub max_body_size: usize,
    pub max_sessions: usize,
    pub session_max_age: Duration,
    pub session_sweep_interval: Duration,

    pub require_auth: bool,
    /// Empty means origin validation is disabled.
    pub allowed_origins: Vec<String>,
    /// `None` disables rate limiting.
    pub rate_limit: Option<RateLimitConfig>,

    pub shutdown_timeout: Duration,
    pub context_recent_limit: usize,
    /// Use the first `X-Forwarded-For` hop as the client address.
    pub trust_forwarded_for: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            backend_url: "http://localhost:8000".to_string(),
            backend_token: None,
            backend_timeout: Duration::from_millis(30_000),
            backend_max_retries: 2,
            backend_retry_base: Duration::from_millis(200),
            max_body_size: 1024 * 1024,
            max_sessions: 100,
            session_max_age: Duration::from_secs(30 * 60),
            session_sweep_interval: Duration::from_secs(60),
            require_auth: false,
            allowed_origins: Vec::new(),
            rate_limit: Some(RateLimitConfig::default()),
            shutdown_timeout: Duration::from_secs(10),
            context_recent_limit: 10,
            trust_forwarded_for: false,
        }
    }
}

impl GatewayConfig {
    /// Build configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_limits = RateLimitConfig::default();

        let rate_limit = if env_flag("RATE_LIMIT_ENABLED", true)? {
            Some(RateLimitConfig {
                max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", default_limits.max_requests)?,
                window: Duration::from_millis(env_parse(
                    "RATE_LIMIT_WINDOW_MS",
                    default_limits.window.as_millis() as u64,
                )?),
                sweep_interval: Duration::from_secs(env_parse(
                    "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                    default_limits.sweep_interval.as_secs(),
                )?),
            })
        } else {
            None
        };

        let config = Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port)?,
            backend_url: env::var("GRAPHITI_API_URL").unwrap_or(defaults.backend_url),
            backend_token: env::var("GRAPHITI_API_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            backend_timeout: Duration::from_millis(env_parse(
                "BACKEND_TIMEOUT_MS",
                defaults.backend_timeout.as_millis() as u64,
            )?),
            backend_max_retries: env_parse("BACKEND_MAX_RETRIES", defaults.backend_max_retries)?,
            backend_retry_base: Duration::from_millis(env_parse(
                "BACKEND_RETRY_BASE_MS",
                defaults.backend_retry_base.as_millis() as u64,
            )?),
            max_body_size: env_parse("MAX_BODY_SIZE", defaults.max_body_size)?,
            max_sessions: env_parse("MAX_SESSIONS", defaults.max_sessions)?,
            session_max_age: Duration::from_secs(env_parse(
                "SESSION_MAX_AGE_SECS",
                defaults.session_max_age.as_secs(),
            )?),
            session_sweep_interval: Duration::from_secs(env_parse(
                "SESSION_SWEEP_INTERVAL_SECS",
                defaults.session_sweep_interval.as_secs(),
            )?),
            require_auth: env_flag("REQUIRE_AUTH", defaults.require_auth)?,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|raw| parse_origin_list(&raw))
                .unwrap_or_default(),
            rate_limit,
            shutdown_timeout: Duration::from_secs(env_parse(
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )?),
            context_recent_limit: env_parse(
                "CONTEXT_RECENT_LIMIT",
                defaults.context_recent_limit,
            )?,
            trust_forwarded_for: env_flag("TRUST_FORWARDED_FOR", defaults.trust_forwarded_for)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.backend_url)
            .map_err(|e| ConfigError::InvalidBackendUrl(format!("{}: {}", self.backend_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBackendUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        if self.max_body_size == 0 {
            return Err(ConfigError::Zero("MAX_BODY_SIZE"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Zero("MAX_SESSIONS"));
        }
        if self.session_max_age.is_zero() {
            return Err(ConfigError::Zero("SESSION_MAX_AGE_SECS"));
        }
        if self.session_sweep_interval.is_zero() {
            return Err(ConfigError::Zero("SESSION_SWEEP_INTERVAL_SECS"));
        }
        if self.backend_timeout.is_zero() {
            return Err(ConfigError::Zero("BACKEND_TIMEOUT_MS"));
        }
        if self.context_recent_limit == 0 {
            return Err(ConfigError::Zero("CONTEXT_RECENT_LIMIT"));
        }

        if let Some(limits) = &self.rate_limit {
            if limits.max_requests == 0 {
                return Err(ConfigError::Zero("RATE_LIMIT_MAX_REQUESTS"));
            }
            if limits.window.is_zero() {
                return Err(ConfigError::Zero("RATE_LIMIT_WINDOW_MS"));
            }
            if limits.sweep_interval.is_zero() {
                return Err(ConfigError::Zero("RATE_LIMIT_SWEEP_INTERVAL_SECS"));
            }
        }

        if self.session_sweep_interval > self.session_max_age {
            return Err(ConfigError::Inconsistent(
                "SESSION_SWEEP_INTERVAL_SECS must not exceed SESSION_MAX_AGE_SECS".to_string(),
            ));
        }

        if self.require_auth && self.backend_token.is_some() {
            warn!("REQUIRE_AUTH is set; GRAPHITI_API_TOKEN is only used when a session has no credential");
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })
        }
        _ => Ok(default),
    }
}

fn env_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

/// Split a comma separated origin list, dropping blanks and trailing slashes.
pub fn parse_origin_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().trim_end_matches('/').to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}
