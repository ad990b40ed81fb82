pub mod backend_client;
pub mod context_manager;
pub mod rate_limiter;
pub mod tool_contracts;
pub mod tool_dispatcher;

pub use backend_client::{BackendError, BackendRequest, HttpBackend, KnowledgeBackend};
pub use context_manager::{ContextManager, WorkspaceContext};
pub use rate_limiter::RateLimiter;
pub use tool_dispatcher::{DispatchError, ToolDispatcher};
