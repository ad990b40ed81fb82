pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod mcp;
pub mod middleware;
pub mod services;

// Make test_utils available for both unit tests and integration tests
pub mod test_utils;

pub use gateway::{Gateway, GatewayError, GatewayState, ShutdownReport};
