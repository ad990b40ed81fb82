//! Active workspace tracking.
//!
//! One instance is shared by every session: the gateway is single-tenant and
//! a workspace chosen by one client is the default for all of them. A
//! multi-tenant deployment would move this state onto the session instead.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceContext {
    pub current: Option<String>,
    /// Most recently used first, no duplicates.
    pub recent: Vec<String>,
}

#[derive(Debug)]
struct ContextState {
    current: Option<String>,
    recent: VecDeque<String>,
}

#[derive(Debug)]
pub struct ContextManager {
    state: RwLock<ContextState>,
    recent_limit: usize,
}

impl ContextManager {
    pub fn new(recent_limit: usize) -> Self {
        Self {
            state: RwLock::new(ContextState {
                current: None,
                recent: VecDeque::new(),
            }),
            recent_limit: recent_limit.max(1),
        }
    }

    /// Make `workspace_id` the active workspace and move it to the front of the
    /// recent list. Returns the previously active workspace.
    pub async fn set_current(&self, workspace_id: &str) -> Option<String> {
        let mut state = self.state.write().await;
        let previous = state.current.replace(workspace_id.to_string());
        push_recent(&mut state.recent, workspace_id, self.recent_limit);
        previous
    }

    pub async fn clear_current(&self) -> Option<String> {
        self.state.write().await.current.take()
    }

    pub async fn current(&self) -> Option<String> {
        self.state.read().await.current.clone()
    }

    /// Record that a call referenced `workspace_id` without changing the
    /// active workspace.
    pub async fn touch(&self, workspace_id: &str) {
        let mut state = self.state.write().await;
        push_recent(&mut state.recent, workspace_id, self.recent_limit);
    }

    pub async fn snapshot(&self) -> WorkspaceContext {
        let state = self.state.read().await;
        WorkspaceContext {
            current: state.current.clone(),
            recent: state.recent.iter().cloned().collect(),
        }
    }
}

fn push_recent(recent: &mut VecDeque<String>, workspace_id: &str, limit: usize) {
    if let Some(pos) = recent.iter().position(|id| id == workspace_id) {
        recent.remove(pos);
    }
    recent.push_front(workspace_id.to_string());
    recent.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_current_replaces_and_records() {
        let manager = ContextManager::new(5);
        assert_eq!(manager.set_current("proj-a").await, None);
        assert_eq!(manager.set_current("proj-b").await, Some("proj-a".to_string()));

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.current.as_deref(), Some("proj-b"));
        assert_eq!(snapshot.recent, vec!["proj-b", "proj-a"]);
    }

    #[tokio::test]
    async fn touch_updates_recent_but_not_current() {
        let manager = ContextManager::new(5);
        manager.set_current("proj-a").await;
        manager.touch("proj-b").await;

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.current.as_deref(), Some("proj-a"));
        assert_eq!(snapshot.recent, vec!["proj-b", "proj-a"]);
    }

    #[tokio::test]
    async fn recent_list_is_bounded_and_deduplicated() {
        let manager = ContextManager::new(3);
        for id in ["a", "b", "c", "b", "d"] {
            manager.touch(id).await;
        }

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.recent, vec!["d", "b", "c"]);
    }

    #[tokio::test]
    async fn clear_keeps_history() {
        let manager = ContextManager::new(3);
        manager.set_current("a").await;
        assert_eq!(manager.clear_current().await, Some("a".to_string()));
        assert_eq!(manager.current().await, None);
        assert_eq!(manager.snapshot().await.recent, vec!["a"]);
    }
}
