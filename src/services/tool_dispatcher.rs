//! Tool dispatch: validate, enrich from the workspace context, execute.
//!
//! ```text
//! tools/call ─► lookup contract ─► check shape ─► fill workspace ─► check required
//!                                                                      │
//!            CallToolResult ◄── backend / context action ◄── invoker ◄─┘
//! ```
//!
//! Validation failures are protocol errors (`DispatchError`). Once a call is
//! valid it always produces a `CallToolResult`; backend failures come back
//! with `is_error = true` so the client sees them as a tool-level failure.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::model::{CallToolResult, Content, ErrorCode, ErrorData, Tool};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::backend_client::{BackendRequest, KnowledgeBackend};
use super::context_manager::ContextManager;
use super::tool_contracts::{self, ContextPolicy, FieldError, ToolAction, ToolContract, ToolInvocation};
use crate::logging;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid argument '{field}' for {tool}: {message}")]
    Validation {
        tool: String,
        field: String,
        message: String,
    },
}

impl DispatchError {
    fn validation(tool: &str, err: FieldError) -> Self {
        DispatchError::Validation {
            tool: tool.to_string(),
            field: err.field,
            message: err.message,
        }
    }
}

impl From<DispatchError> for ErrorData {
    fn from(err: DispatchError) -> Self {
        let data = match &err {
            DispatchError::UnknownTool(tool) => json!({ "tool": tool }),
            DispatchError::Validation { tool, field, .. } => json!({ "tool": tool, "field": field }),
        };
        ErrorData::new(ErrorCode::INVALID_PARAMS, err.to_string(), Some(data))
    }
}

pub struct ToolDispatcher {
    contracts: HashMap<&'static str, ToolContract>,
    /// Catalog order for listings.
    order: Vec<&'static str>,
    backend: Arc<dyn KnowledgeBackend>,
    context: Arc<ContextManager>,
}

impl ToolDispatcher {
    pub fn new(backend: Arc<dyn KnowledgeBackend>, context: Arc<ContextManager>) -> Self {
        Self::with_contracts(tool_contracts::catalog(), backend, context)
    }

    pub fn with_contracts(
        contracts: Vec<ToolContract>,
        backend: Arc<dyn KnowledgeBackend>,
        context: Arc<ContextManager>,
    ) -> Self {
        let order = contracts.iter().map(|c| c.name).collect();
        let contracts = contracts.into_iter().map(|c| (c.name, c)).collect();
        Self {
            contracts,
            order,
            backend,
            context,
        }
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.order
            .iter()
            .filter_map(|name| self.contracts.get(name))
            .map(ToolContract::to_tool)
            .collect()
    }

    pub fn backend(&self) -> &Arc<dyn KnowledgeBackend> {
        &self.backend
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    /// Validate and execute one tool call.
    ///
    /// `credential` is forwarded to the backend for this call only.
    pub async fn call(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        credential: Option<&str>,
    ) -> Result<CallToolResult, DispatchError> {
        let contract = self
            .contracts
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        let mut args = arguments.unwrap_or_default();
        contract
            .check_shape(&mut args)
            .map_err(|e| DispatchError::validation(contract.name, e))?;

        if let Some((field, policy)) = contract.context {
            if !args.contains_key(field) {
                match (self.context.current().await, policy) {
                    (Some(workspace), _) => {
                        debug!(tool = contract.name, field, workspace = %workspace, "Filled from active workspace");
                        args.insert(field.to_string(), Value::String(workspace));
                    }
                    (None, ContextPolicy::Require) => {
                        return Err(DispatchError::validation(
                            contract.name,
                            FieldError::new(field, "is required when no active workspace is set"),
                        ));
                    }
                    (None, ContextPolicy::Fill) => {}
                }
            }
        }

        contract
            .check_required(&args)
            .map_err(|e| DispatchError::validation(contract.name, e))?;

        for workspace in contract.workspace_refs(&args) {
            self.context.touch(&workspace).await;
        }

        let invocation = ToolInvocation {
            tool: contract.name,
            args,
            credential: credential.map(str::to_string),
        };
        let action = (contract.invoker)(&invocation);
        Ok(self.execute(&invocation, action).await)
    }

    async fn execute(&self, invocation: &ToolInvocation, action: ToolAction) -> CallToolResult {
        match action {
            ToolAction::Backend(request) => rendered(self.forward(invocation, request).await),
            ToolAction::DeleteWorkspace { request, workspace } => {
                let outcome = self.forward(invocation, request).await;
                if outcome.is_ok() {
                    self.forget_workspace(&workspace).await;
                }
                rendered(outcome)
            }
            ToolAction::SetContext(workspace) => {
                let previous = self.context.set_current(&workspace).await;
                info!(workspace = %workspace, previous = ?previous, "Active workspace set");
                success(json!({ "current": workspace, "previous": previous }))
            }
            ToolAction::GetContext => {
                let snapshot = self.context.snapshot().await;
                success(json!(snapshot))
            }
            ToolAction::ClearContext => {
                let cleared = self.context.clear_current().await;
                info!(cleared = ?cleared, "Active workspace cleared");
                success(json!({ "cleared": cleared }))
            }
        }
    }

    /// Send one backend request; both arms are already rendered for the client.
    async fn forward(
        &self,
        invocation: &ToolInvocation,
        request: BackendRequest,
    ) -> Result<CallToolResult, CallToolResult> {
        let method = request.method.clone();
        let path = request.path();
        match self.backend.send(request).await {
            Ok(value) => {
                info!(tool = invocation.tool, %method, path = %path, "Tool call succeeded");
                Ok(success(value))
            }
            Err(err) => {
                let redacted_args = logging::redact(&Value::Object(invocation.args.clone()));
                warn!(
                    tool = invocation.tool,
                    %method,
                    path = %path,
                    status = ?err.status(),
                    error = %err,
                    arguments = %redacted_args,
                    "Tool call failed"
                );
                Err(CallToolResult::error(vec![Content::text(format!(
                    "{} failed: {}",
                    invocation.tool, err
                ))]))
            }
        }
    }

    async fn forget_workspace(&self, deleted: &str) {
        if self.context.current().await.as_deref() == Some(deleted) {
            self.context.clear_current().await;
            info!(workspace = %deleted, "Cleared active workspace after deletion");
        }
    }
}

fn rendered(outcome: Result<CallToolResult, CallToolResult>) -> CallToolResult {
    outcome.unwrap_or_else(|failed| failed)
}

fn success(value: Value) -> CallToolResult {
    let value = if value.is_null() {
        json!({ "success": true })
    } else {
        value
    };
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    CallToolResult::success(vec![Content::text(text)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend_client::{BackendError, MockKnowledgeBackend};

    fn dispatcher(mock: MockKnowledgeBackend) -> (ToolDispatcher, Arc<ContextManager>) {
        let context = Arc::new(ContextManager::new(10));
        (
            ToolDispatcher::new(Arc::new(mock), Arc::clone(&context)),
            context,
        )
    }

    fn args(value: Value) -> Option<Map<String, Value>> {
        value.as_object().cloned()
    }

    fn text(result: &CallToolResult) -> String {
        let value = serde_json::to_value(result).unwrap();
        value["content"][0]["text"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn explicit_group_wins_and_context_fills_the_gap() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send()
            .withf(|req| {
                req.path() == "/episodes/proj-a"
                    && req.query == vec![("last_n".to_string(), "10".to_string())]
            })
            .times(1)
            .returning(|_| Ok(json!([{"uuid": "e1"}])));
        mock.expect_send()
            .withf(|req| req.path() == "/episodes/proj-b")
            .times(1)
            .returning(|_| Ok(json!([])));

        let (dispatcher, context) = dispatcher(mock);

        dispatcher
            .call("set_context", args(json!({"group_id": "proj-a"})), None)
            .await
            .unwrap();

        let result = dispatcher.call("get_episodes", None, None).await.unwrap();
        assert_ne!(result.is_error, Some(true));
        assert!(text(&result).contains("e1"));

        dispatcher
            .call("get_episodes", args(json!({"group_id": "proj-b"})), None)
            .await
            .unwrap();

        let snapshot = context.snapshot().await;
        assert_eq!(snapshot.current.as_deref(), Some("proj-a"));
        assert!(snapshot.recent.contains(&"proj-b".to_string()));
    }

    #[tokio::test]
    async fn require_without_context_fails_before_backend() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send().times(0);
        let (dispatcher, _) = dispatcher(mock);

        let err = dispatcher.call("get_episodes", None, None).await.unwrap_err();
        match err {
            DispatchError::Validation { tool, field, .. } => {
                assert_eq!(tool, "get_episodes");
                assert_eq!(field, "group_id");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn fill_policy_leaves_field_absent_without_context() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send()
            .withf(|req| req.path() == "/tags" && req.query.is_empty())
            .times(1)
            .returning(|_| Ok(json!({"tags": []})));
        let (dispatcher, _) = dispatcher(mock);

        let result = dispatcher.call("list_tags", None, None).await.unwrap();
        assert_ne!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_backend() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send().times(0);
        let (dispatcher, _) = dispatcher(mock);

        let err = dispatcher
            .call("search_memory", args(json!({"query": "q", "max_facts": 0})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation { ref field, .. } if field == "max_facts"));

        let err = dispatcher
            .call("search_memory", args(json!({"max_facts": 5})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation { ref field, .. } if field == "query"));
    }

    #[tokio::test]
    async fn unknown_tool_maps_to_invalid_params() {
        let (dispatcher, _) = dispatcher(MockKnowledgeBackend::new());
        let err = dispatcher.call("drop_database", None, None).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownTool("drop_database".to_string()));

        let data: ErrorData = err.into();
        assert_eq!(data.code, ErrorCode::INVALID_PARAMS);
        assert_eq!(data.data, Some(json!({"tool": "drop_database"})));
    }

    #[tokio::test]
    async fn backend_failure_is_tool_error() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send().times(1).returning(|_| {
            Err(BackendError::Server {
                status: 500,
                message: "neo4j unavailable".to_string(),
            })
        });
        let (dispatcher, _) = dispatcher(mock);

        let result = dispatcher.call("list_groups", None, None).await.unwrap();
        assert_eq!(result.is_error, Some(true));
        let message = text(&result);
        assert!(message.starts_with("list_groups failed:"));
        assert!(message.contains("neo4j unavailable"));
    }

    #[tokio::test]
    async fn credential_is_threaded_per_call() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send()
            .withf(|req| req.credential.as_deref() == Some("token-a"))
            .times(1)
            .returning(|_| Ok(json!([])));
        mock.expect_send()
            .withf(|req| req.credential.is_none())
            .times(1)
            .returning(|_| Ok(json!([])));
        let (dispatcher, _) = dispatcher(mock);

        dispatcher.call("list_groups", None, Some("token-a")).await.unwrap();
        dispatcher.call("list_groups", None, None).await.unwrap();
    }

    #[tokio::test]
    async fn deleting_active_workspace_clears_it() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send()
            .withf(|req| req.path() == "/group/proj-a")
            .times(1)
            .returning(|_| Ok(Value::Null));
        let (dispatcher, context) = dispatcher(mock);

        context.set_current("proj-a").await;
        let result = dispatcher
            .call("delete_group", args(json!({"group_id": "proj-a"})), None)
            .await
            .unwrap();
        assert!(text(&result).contains("success"));
        assert_eq!(context.current().await, None);
    }

    #[tokio::test]
    async fn failed_delete_keeps_active_workspace() {
        let mut mock = MockKnowledgeBackend::new();
        mock.expect_send()
            .withf(|req| req.path() == "/group/proj-a")
            .times(1)
            .returning(|_| {
                Err(BackendError::Server {
                    status: 500,
                    message: "db down".to_string(),
                })
            });
        let (dispatcher, context) = dispatcher(mock);

        context.set_current("proj-a").await;
        let result = dispatcher
            .call("delete_group", args(json!({"group_id": "proj-a"})), None)
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(context.current().await.as_deref(), Some("proj-a"));
    }

    #[tokio::test]
    async fn context_tools_round_trip() {
        let (dispatcher, _) = dispatcher(MockKnowledgeBackend::new());

        dispatcher
            .call("set_context", args(json!({"group_id": "proj-a"})), None)
            .await
            .unwrap();
        let result = dispatcher.call("get_context", None, None).await.unwrap();
        assert!(text(&result).contains("proj-a"));

        let result = dispatcher.call("clear_context", None, None).await.unwrap();
        assert!(text(&result).contains("proj-a"));
        assert_eq!(dispatcher.context().current().await, None);
    }

    #[test]
    fn lists_tools_in_catalog_order() {
        let (dispatcher, _) = dispatcher(MockKnowledgeBackend::new());
        let tools = dispatcher.list_tools();
        assert_eq!(tools[0].name, "add_memory");
        assert_eq!(tools.len(), 21);
    }
}
