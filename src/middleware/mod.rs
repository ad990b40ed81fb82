pub mod mcp_auth;

pub use mcp_auth::{
    check_credential, check_origin, client_address, extract_credential, mcp_auth_middleware,
    peer_address, CREDENTIAL_HEADER,
};
