//! Environment-variable-driven configuration (spec §6).
//!
//! Mirrors the teacher's `EnvConfigLoader` pattern (prefix + defaults +
//! typed getters) rather than a generic config-file parser, since every
//! option in spec §6 has a sane default and the deployment model is one
//! process per coordinator.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

/// Small environment loader: `prefix + var` with per-key defaults.
pub struct EnvLoader {
    prefix: String,
    defaults: HashMap<&'static str, String>,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            defaults: HashMap::new(),
        }
    }

    pub fn default(mut self, var: &'static str, value: impl Into<String>) -> Self {
        self.defaults.insert(var, value.into());
        self
    }

    fn raw(&self, var: &str) -> Option<String> {
        let full = format!("{}{}", self.prefix, var);
        env::var(&full).ok().or_else(|| self.defaults.get(var).cloned())
    }

    pub fn string(&self, var: &str) -> Option<String> {
        self.raw(var)
    }

    pub fn parsed<T: std::str::FromStr>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.raw(var) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    var: var.to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}

/// `browser.*` (spec §6, §4.1).
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub api_url: String,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub max_concurrent_sessions: usize,
    pub session_lease_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:54345".to_string(),
            max_retries: 3,
            retry_base_ms: 1_000,
            max_concurrent_sessions: 50,
            session_lease_timeout: Duration::from_secs(10),
        }
    }
}

/// `queue.*` (spec §6, §4.5).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_duration: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
            rate_limit_max: 2,
            rate_limit_duration: Duration::from_secs(24 * 3600),
        }
    }
}

/// `account.*` (spec §6, §4.3).
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub daily_limit_default: u32,
    pub health_threshold: u8,
    pub rollover_tz_offset_hours: i32,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            daily_limit_default: 2,
            health_threshold: 50,
            rollover_tz_offset_hours: 0,
        }
    }
}

/// `breaker.*` (spec §6, §4.7).
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_ms: u64,
    pub success_threshold: u32,
    pub volume_threshold: u32,
    pub window_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_ms: 60_000,
            success_threshold: 3,
            volume_threshold: 10,
            window_ms: 300_000,
            call_timeout_ms: 30_000,
        }
    }
}

/// `shutdown.*` (spec §6, §4.9).
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// `alerts.*` (spec §6, §4.9 Error/Shutdown Supervisor).
#[derive(Debug, Clone)]
pub struct AlertsConfig {
    /// Error-rate over the same rolling window the breaker uses, above
    /// which the supervisor logs an alert.
    pub error_rate: f64,
    /// Consecutive job failures across the whole pool that count as critical.
    pub critical_threshold: u32,
    /// Consecutive job failures that trigger a first-level alert.
    pub consecutive_threshold: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            critical_threshold: 10,
            consecutive_threshold: 5,
        }
    }
}

/// Top-level configuration aggregate, assembled by the orchestrator binary.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    pub max_concurrent_uploads: usize,
    pub upload_deadline: Duration,
    pub browser: BrowserConfig,
    pub queue: QueueConfig,
    pub account: AccountConfig,
    pub breaker: BreakerConfig,
    pub shutdown: ShutdownConfig,
    pub alerts: AlertsConfig,
    /// Required; sourced from `MATRIX_ENCRYPTION_KEY`. Never logged.
    pub encryption_key: Vec<u8>,
    pub redis_url: String,
    pub database_url: String,
}

impl MatrixConfig {
    /// Load configuration from the process environment, applying the
    /// defaults listed in spec §6. `encryption.key` is the one required
    /// option; everything else falls back to its documented default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let loader = EnvLoader::new("MATRIX_");

        let encryption_key = env::var("MATRIX_ENCRYPTION_KEY")
            .map(|s| s.into_bytes())
            .map_err(|_| ConfigError::InvalidValue {
                var: "ENCRYPTION_KEY".to_string(),
                reason: "required, set via environment".to_string(),
            })?;

        Ok(Self {
            max_concurrent_uploads: loader.parsed("MAX_CONCURRENT_UPLOADS")?.unwrap_or(5),
            upload_deadline: Duration::from_secs(loader.parsed("UPLOAD_DEADLINE_SECS")?.unwrap_or(1800)),
            browser: BrowserConfig {
                api_url: loader.string("BROWSER_API_URL").unwrap_or_else(|| BrowserConfig::default().api_url),
                max_retries: loader.parsed("BROWSER_MAX_RETRIES")?.unwrap_or(3),
                retry_base_ms: loader.parsed("BROWSER_RETRY_BASE_MS")?.unwrap_or(1_000),
                max_concurrent_sessions: loader.parsed("BROWSER_MAX_SESSIONS")?.unwrap_or(50),
                session_lease_timeout: Duration::from_secs(loader.parsed("BROWSER_LEASE_TIMEOUT_SECS")?.unwrap_or(10)),
            },
            queue: QueueConfig {
                max_attempts: loader.parsed("QUEUE_ATTEMPTS")?.unwrap_or(3),
                backoff_base_ms: loader.parsed("QUEUE_BACKOFF_BASE_MS")?.unwrap_or(2_000),
                backoff_cap_ms: loader.parsed("QUEUE_BACKOFF_CAP_MS")?.unwrap_or(60_000),
                rate_limit_max: loader.parsed("QUEUE_RATE_MAX")?.unwrap_or(2),
                rate_limit_duration: Duration::from_secs(loader.parsed("QUEUE_RATE_DURATION_SECS")?.unwrap_or(86_400)),
            },
            account: AccountConfig {
                daily_limit_default: loader.parsed("ACCOUNT_DAILY_LIMIT")?.unwrap_or(2),
                health_threshold: loader.parsed("ACCOUNT_HEALTH_THRESHOLD")?.unwrap_or(50),
                rollover_tz_offset_hours: loader.parsed("ACCOUNT_ROLLOVER_TZ_OFFSET")?.unwrap_or(0),
            },
            breaker: BreakerConfig {
                failure_threshold: loader.parsed("BREAKER_FAILURE_THRESHOLD")?.unwrap_or(5),
                reset_ms: loader.parsed("BREAKER_RESET_MS")?.unwrap_or(60_000),
                success_threshold: loader.parsed("BREAKER_SUCCESS_THRESHOLD")?.unwrap_or(3),
                volume_threshold: loader.parsed("BREAKER_VOLUME_THRESHOLD")?.unwrap_or(10),
                window_ms: loader.parsed("BREAKER_WINDOW_MS")?.unwrap_or(300_000),
                call_timeout_ms: loader.parsed("BREAKER_CALL_TIMEOUT_MS")?.unwrap_or(30_000),
            },
            shutdown: ShutdownConfig {
                timeout: Duration::from_secs(loader.parsed("SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(30)),
            },
            alerts: AlertsConfig {
                error_rate: loader.parsed("ALERTS_ERROR_RATE")?.unwrap_or(0.5),
                critical_threshold: loader.parsed("ALERTS_CRITICAL_THRESHOLD")?.unwrap_or(10),
                consecutive_threshold: loader.parsed("ALERTS_CONSECUTIVE_THRESHOLD")?.unwrap_or(5),
            },
            encryption_key,
            redis_url: loader.string("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            database_url: loader.string("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/matrix".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_config_default_matches_spec() {
        let c = BrowserConfig::default();
        assert_eq!(c.api_url, "http://127.0.0.1:54345");
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn breaker_config_default_matches_spec() {
        let c = BreakerConfig::default();
        assert_eq!(c.failure_threshold, 5);
        assert_eq!(c.reset_ms, 60_000);
        assert_eq!(c.success_threshold, 3);
        assert_eq!(c.volume_threshold, 10);
    }

    #[test]
    fn env_loader_falls_back_to_default() {
        let loader = EnvLoader::new("MATRIX_TEST_").default("FOO", "42");
        let v: Option<u32> = loader.parsed("FOO").unwrap();
        assert_eq!(v, Some(42));
    }
}
