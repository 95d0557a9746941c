//! Durable priority Job Queue (spec §4.5).

pub mod queue;
pub mod rate_limiter;

pub use queue::{JobQueue, QueueConfig, QueueError, QueueStats};
pub use rate_limiter::RateLimiter;
