//! Retry policy with exponential backoff, grounded in
//! `riptide_utils::retry::RetryPolicy` — used by the Browser Control Client
//! (spec §4.1: "3 attempts, base 1s, factor 2, jitter").

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_ms: u64,
    pub factor: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1_000,
            factor: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let base = self.base_ms as f64 * self.factor.powi(attempt as i32);
        let jitter = base * self.jitter_fraction * rand::random::<f64>();
        Duration::from_millis((base + jitter) as u64)
    }

    /// Run `operation` up to `max_attempts` times, retrying only when
    /// `is_retryable` returns true for the error.
    pub async fn execute<F, Fut, T, E>(&self, mut is_retryable: impl FnMut(&E) -> bool, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !is_retryable(&e) {
                        warn!(attempt, error = %e, "giving up after retries");
                        return Err(e);
                    }
                    sleep(self.backoff_duration(attempt - 1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_ms: 1,
            factor: 1.0,
            jitter_fraction: 0.0,
        };
        let calls = AtomicUsize::new(0);

        let result: Result<u32, &str> = policy
            .execute(
                |_| true,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err("transient") } else { Ok(42) } }
                },
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable() {
        let policy = RetryPolicy::default();
        let calls = AtomicUsize::new(0);

        let result: Result<u32, &str> = policy
            .execute(
                |_| false,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err("permanent") }
                },
            )
            .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
