pub mod gateway;

pub use gateway::{parse_origin_list, ConfigError, GatewayConfig, RateLimitConfig};
