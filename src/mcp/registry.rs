//! Thread-safe session registry
//!
//! Tracks live [`Session`]s by id. The map lock is held only while inserting,
//! removing or scanning; request handling runs on an `Arc<Session>` clone, so
//! sessions never serialize against each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::mcp::instance::{Session, SessionSummary};
use crate::mcp::service::GatewayMcpService;
use crate::services::ToolDispatcher;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Session capacity reached ({max} live sessions)")]
    CapacityReached { max: usize },

    #[error("Session registry is closed")]
    Closed,

    #[error("Session not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session_id: String,
    pub session: Arc<Session>,
    pub is_new: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    dispatcher: Arc<ToolDispatcher>,
    max_sessions: usize,
    max_age: Duration,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(dispatcher: Arc<ToolDispatcher>, max_sessions: usize, max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            dispatcher,
            max_sessions,
            max_age,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(dispatcher: Arc<ToolDispatcher>, config: &GatewayConfig) -> Self {
        Self::new(dispatcher, config.max_sessions, config.session_max_age)
    }

    /// Find the session named by `session_id`, or create a fresh one.
    ///
    /// An unknown or expired id is not an error: the caller gets a new session
    /// under a new id and learns it from the response header.
    ///
    /// # Returns
    ///
    /// * `Ok(ResolvedSession)` - existing (`is_new = false`) or new session
    /// * `Err(RegistryError::CapacityReached)` - full even after evicting idle sessions
    /// * `Err(RegistryError::Closed)` - registry has been shut down
    pub async fn resolve(&self, session_id: Option<&str>) -> Result<ResolvedSession, RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }

        if let Some(id) = session_id {
            if let Some(session) = self
                .get(id)
                .await
                .filter(|session| session.idle_for() < self.max_age)
            {
                session.touch();
                return Ok(ResolvedSession {
                    session_id: session.id.clone(),
                    session,
                    is_new: false,
                });
            }
            debug!(session_id = %id, "Unknown session id, creating a new session");
        }

        self.evict_idle().await;

        let mut sessions = self.sessions.write().await;
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::CapacityReached {
                max: self.max_sessions,
            });
        }

        let id = Uuid::new_v4().to_string();
        let engine = Arc::new(GatewayMcpService::new(id.clone(), Arc::clone(&self.dispatcher)));
        let session = Arc::new(Session::new(id.clone(), engine));
        sessions.insert(id.clone(), Arc::clone(&session));
        let live = sessions.len();
        drop(sessions);

        info!(session_id = %id, live, "Session created");
        Ok(ResolvedSession {
            session_id: id,
            session,
            is_new: true,
        })
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).map(Arc::clone)
    }

    /// Close and remove sessions idle for at least the configured maximum age.
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.idle_for() >= self.max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.close();
                info!(session_id = %id, idle_secs = session.idle_for().as_secs(), "Evicted idle session");
            }
        }
        expired.len()
    }

    pub async fn terminate(&self, session_id: &str) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        session.close();
        info!(session_id = %session_id, requests = session.request_count(), "Session terminated");
        Ok(())
    }

    /// Close every session and refuse to create new ones.
    pub async fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in &drained {
            session.close();
        }
        info!(closed = drained.len(), "All sessions closed");
        drained.len()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.summary())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
