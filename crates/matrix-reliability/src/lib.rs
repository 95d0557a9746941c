//! Circuit breaker and retry/backoff helpers shared by the Browser Control
//! Client, Browser Pool, and Recovery Engine (spec §4.1, §4.7, §4.8).

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, BreakerOpenError, CircuitBreaker, State};
pub use registry::BreakerRegistry;
pub use retry::RetryPolicy;
