//! MCP sessions, protocol engine and HTTP transport
//!
//! # Architecture
//!
//! - [`SessionRegistry`] - live sessions by id, capacity and idle eviction
//! - [`Session`] - one engine plus its transport lifecycle handle
//! - [`GatewayMcpService`] - JSON-RPC method routing for one session
//! - [`http_transport`] - the `POST /mcp` admission pipeline
//! - [`handlers`] - health, tool catalog and session endpoints

pub mod envelope;
pub mod handlers;
pub mod http_transport;
pub mod instance;
pub mod registry;
pub mod service;

pub use http_transport::SESSION_HEADER;
pub use instance::{Session, SessionSummary};
pub use registry::{RegistryError, ResolvedSession, SessionRegistry};
pub use service::GatewayMcpService;
