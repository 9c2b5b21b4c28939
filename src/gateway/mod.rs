//! Rate-limited model access with fallback chains.

pub mod gateway;
pub mod rate_limiter;

pub use gateway::{FallbackChain, GatewayReply, ModelGateway};
pub use rate_limiter::RateLimiter;
