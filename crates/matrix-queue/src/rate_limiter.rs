//! Per-account sliding-window rate limiter (spec §4.5: "Per-account rate
//! limits are enforced via a sliding window keyed by account id with a
//! configurable (max, duration)"). Keeps the timestamps in the same Redis
//! instance as the queue, as a sorted set scored by the call's own timestamp.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max: u32,
    pub duration: Duration,
}

pub struct RateLimiter {
    namespace: String,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(namespace: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            namespace: namespace.into(),
            config,
        }
    }

    fn key(&self, account_id: Uuid) -> String {
        format!("{}:rate:{}", self.namespace, account_id)
    }

    /// Returns true (and records the call) if `account_id` is still under
    /// its rate limit; false if the call should be rejected.
    pub async fn try_acquire(&self, conn: &mut MultiplexedConnection, account_id: Uuid) -> redis::RedisResult<bool> {
        let key = self.key(account_id);
        let now = chrono::Utc::now().timestamp_millis();
        let window_start = now - self.config.duration.as_millis() as i64;

        let _: i64 = conn.zrembyscore(&key, 0, window_start).await?;
        let count: i64 = conn.zcard(&key).await?;

        if count as u32 >= self.config.max {
            return Ok(false);
        }

        conn.zadd(&key, now, now).await?;
        conn.expire(&key, self.config.duration.as_secs() as i64).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_namespaced_per_account() {
        let limiter = RateLimiter::new(
            "matrix_jobs",
            RateLimiterConfig {
                max: 2,
                duration: Duration::from_secs(86_400),
            },
        );
        let id = Uuid::new_v4();
        assert_eq!(limiter.key(id), format!("matrix_jobs:rate:{id}"));
    }
}
