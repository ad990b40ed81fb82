//! Gateway assembly and lifecycle
//!
//! [`Gateway`] wires configuration, backend, dispatcher, registry and rate
//! limiter into an axum router, runs the periodic sweeps, and owns the
//! graceful shutdown sequence:
//!
//! 1. mark the gateway as draining (new requests get 503)
//! 2. stop accepting connections
//! 3. stop the sweep tasks
//! 4. wait for in-flight requests, polling every 50ms up to the timeout
//! 5. close every session

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GatewayConfig};
use crate::mcp::{handlers, http_transport, SessionRegistry};
use crate::middleware::{mcp_auth_middleware, CREDENTIAL_HEADER};
use crate::services::{
    BackendError, ContextManager, HttpBackend, KnowledgeBackend, RateLimiter, ToolDispatcher,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend client error: {0}")]
    Backend(#[from] BackendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drain flag, active-request counter and the tokens that stop background work.
#[derive(Debug)]
pub struct Lifecycle {
    draining: AtomicBool,
    active: AtomicUsize,
    started: Instant,
    accept: CancellationToken,
    sweeps: CancellationToken,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            draining: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            started: Instant::now(),
            accept: CancellationToken::new(),
            sweeps: CancellationToken::new(),
        }
    }

    /// Register an in-flight request, or `None` once draining has begun.
    ///
    /// The counter is bumped before the flag is read, so a request that gets
    /// past this point is always visible to the drain loop.
    pub fn enter(self: &Arc<Self>) -> Option<ActiveRequestGuard> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveRequestGuard {
            lifecycle: Arc::clone(self),
        };
        if self.draining.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Decrements the active-request counter when dropped.
#[derive(Debug)]
pub struct ActiveRequestGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.lifecycle.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub registry: Arc<SessionRegistry>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub lifecycle: Arc<Lifecycle>,
}

/// Outcome of [`Gateway::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The timeout expired with requests still running.
    pub forced: bool,
    /// Requests still running when sessions were closed.
    pub in_flight: usize,
    pub closed_sessions: usize,
}

pub struct Gateway {
    state: GatewayState,
}

impl Gateway {
    pub fn new(config: GatewayConfig, backend: Arc<dyn KnowledgeBackend>) -> Self {
        let context = Arc::new(ContextManager::new(config.context_recent_limit));
        let dispatcher = Arc::new(ToolDispatcher::new(backend, context));
        let registry = Arc::new(SessionRegistry::from_config(Arc::clone(&dispatcher), &config));
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|limits| Arc::new(RateLimiter::from_config(limits)));

        Self {
            state: GatewayState {
                config: Arc::new(config),
                dispatcher,
                registry,
                rate_limiter,
                lifecycle: Arc::new(Lifecycle::new()),
            },
        }
    }

    /// Validate the configuration and connect to the backend over HTTP.
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let backend = HttpBackend::from_config(&config)?;
        Ok(Self::new(config, Arc::new(backend)))
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    pub fn router(&self) -> Router {
        let state = self.state.clone();

        let operator = Router::new()
            .route("/sessions", get(handlers::list_sessions))
            .route("/sessions/{id}", delete(handlers::terminate_session))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                mcp_auth_middleware,
            ));

        Router::new()
            .route(
                "/mcp",
                post(http_transport::handle_mcp_post)
                    .delete(handlers::delete_mcp_session)
                    .get(handlers::mcp_stream_not_supported),
            )
            .route("/health", get(handlers::health))
            .route("/tools", get(handlers::list_tools))
            .merge(operator)
            .layer(cors_layer(&state.config))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the idle-session and rate-limit sweeps.
    ///
    /// Both stop when shutdown begins.
    pub fn spawn_sweeps(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let token = self.state.lifecycle.sweeps.clone();

        let registry = Arc::clone(&self.state.registry);
        handles.push(spawn_periodic(
            "sessions",
            self.state.config.session_sweep_interval,
            token.clone(),
            move || {
                let registry = Arc::clone(&registry);
                async move { registry.evict_idle().await }
            },
        ));

        if let (Some(limiter), Some(limits)) =
            (&self.state.rate_limiter, &self.state.config.rate_limit)
        {
            let limiter = Arc::clone(limiter);
            handles.push(spawn_periodic(
                "rate_limits",
                limits.sweep_interval,
                token,
                move || {
                    let limiter = Arc::clone(&limiter);
                    async move { limiter.sweep() }
                },
            ));
        }

        handles
    }

    /// Drain in-flight requests and close every session.
    ///
    /// Safe to call more than once; later calls find nothing left to do.
    pub async fn shutdown(&self) -> ShutdownReport {
        let lifecycle = &self.state.lifecycle;
        if lifecycle.draining.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
        }
        info!(
            active_requests = lifecycle.active_requests(),
            "Shutting down, no longer admitting requests"
        );

        lifecycle.accept.cancel();
        lifecycle.sweeps.cancel();

        let deadline = Instant::now() + self.state.config.shutdown_timeout;
        let forced = loop {
            let active = lifecycle.active_requests();
            if active == 0 {
                break false;
            }
            if Instant::now() >= deadline {
                warn!(
                    in_flight = active,
                    timeout_secs = self.state.config.shutdown_timeout.as_secs(),
                    "Shutdown timeout reached with requests in flight"
                );
                break true;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        };

        let in_flight = lifecycle.active_requests();
        let closed_sessions = self.state.registry.close_all().await;
        info!(forced, in_flight, closed_sessions, "Shutdown complete");

        ShutdownReport {
            forced,
            in_flight,
            closed_sessions,
        }
    }

    /// Serve on `listener` until `signal` resolves, then shut down.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<ShutdownReport, GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let sweeps = self.spawn_sweeps();

        let accept = self.state.lifecycle.accept.clone();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { accept.cancelled().await })
                .await
        });

        info!(address = %addr, "Gateway listening");

        signal.await;
        let report = self.shutdown().await;

        for handle in sweeps {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweep task ended abnormally");
            }
        }

        match tokio::time::timeout(self.state.config.shutdown_timeout, server).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => warn!(error = %e, "Server task ended abnormally"),
            Err(_) => warn!("Connections still open after shutdown, exiting anyway"),
        }

        Ok(report)
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = usize> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = task().await;
                    if evicted > 0 {
                        debug!(sweep = name, evicted, "Sweep evicted entries");
                    }
                }
            }
        }
        debug!(sweep = name, "Sweep stopped");
    })
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            HeaderName::from_static(CREDENTIAL_HEADER),
            HeaderName::from_static(http_transport::SESSION_HEADER),
        ])
        .expose_headers([HeaderName::from_static(http_transport::SESSION_HEADER)])
}
