//! Logical MCP sessions
//!
//! A [`Session`] pairs one protocol engine with a transport lifecycle handle.
//! The handle is a [`CancellationToken`]: closing the session cancels it, and
//! any dispatch racing against it is abandoned.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::logging;
use crate::mcp::service::GatewayMcpService;

pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    engine: Arc<GatewayMcpService>,
    transport: CancellationToken,
    attached: AtomicBool,
    last_activity: Mutex<Instant>,
    credential: Mutex<Option<String>>,
    request_count: AtomicU64,
}

/// Listing view of a session; never exposes the credential itself.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub request_count: u64,
    pub initialized: bool,
    pub credential_fingerprint: Option<String>,
}

impl Session {
    pub fn new(id: String, engine: Arc<GatewayMcpService>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            engine,
            transport: CancellationToken::new(),
            attached: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            credential: Mutex::new(None),
            request_count: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<GatewayMcpService> {
        &self.engine
    }

    /// Wire the engine to the transport. Returns true only the first time.
    pub fn attach(&self) -> bool {
        !self.attached.swap(true, Ordering::AcqRel)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Note a request on this session and the credential it carried.
    pub fn record_request(&self, credential: Option<&str>) {
        self.touch();
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.credential.lock().unwrap_or_else(PoisonError::into_inner) =
            credential.map(str::to_string);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.transport.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_cancelled()
    }

    /// Resolves once the session has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.transport.cancelled()
    }

    pub fn summary(&self) -> SessionSummary {
        let credential_fingerprint = self
            .credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .map(logging::fingerprint);

        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
            request_count: self.request_count(),
            initialized: self.engine.is_initialized(),
            credential_fingerprint,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .field("request_count", &self.request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend_client::MockKnowledgeBackend;
    use crate::services::{ContextManager, ToolDispatcher};

    fn session() -> Session {
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(MockKnowledgeBackend::new()),
            Arc::new(ContextManager::new(5)),
        ));
        Session::new(
            "s-1".to_string(),
            Arc::new(GatewayMcpService::new("s-1", dispatcher)),
        )
    }

    #[test]
    fn attach_happens_once() {
        let session = session();
        assert!(!session.is_attached());
        assert!(session.attach());
        assert!(!session.attach());
        assert!(session.is_attached());
    }

    #[test]
    fn summary_fingerprints_credential() {
        let session = session();
        session.record_request(Some("secret-token"));
        session.record_request(Some("secret-token"));

        let summary = session.summary();
        assert_eq!(summary.request_count, 2);
        let fingerprint = summary.credential_fingerprint.unwrap();
        assert_eq!(fingerprint, logging::fingerprint("secret-token"));
        assert!(!fingerprint.contains("secret"));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let session = Arc::new(session());
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };

        session.close();
        waiter.await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_tracks_activity() {
        let session = session();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(session.idle_for() >= Duration::from_secs(30));

        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}
