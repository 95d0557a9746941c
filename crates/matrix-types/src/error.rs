//! Error taxonomy (spec §7).
//!
//! `ErrorClass` is the behavioral classification the Recovery Engine
//! dispatches on; `MatrixError` is the concrete error type threaded through
//! the rest of the workspace. Kept as a small closed set per component,
//! mirroring `riptide_types::error::RiptideError` rather than one giant enum.

use thiserror::Error;

/// Behavioral error category used for recovery dispatch (spec §7, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Coordinator-side connectivity failure (control API unreachable, DNS, etc).
    Network,
    /// Session dead / unreachable / control API reports window not openable.
    Browser,
    /// Platform session no longer logged in.
    Auth,
    /// Platform throttled this account.
    RateLimit,
    /// Platform terminated the account.
    Suspended,
    /// Invalid video (size, codec, title length, ...).
    Validation,
    /// Coordinator resource exhaustion (OOM, disk).
    Resource,
    /// Anything that doesn't fit the above; retried up to max_attempts.
    Unknown,
}

impl ErrorClass {
    /// Whether a failure of this class should ever be retried on the same account.
    pub fn retryable_same_account(self) -> bool {
        !matches!(self, ErrorClass::Auth | ErrorClass::Suspended | ErrorClass::Validation)
    }
}

/// Errors surfaced by the core orchestrator components.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account {0} is not eligible for selection")]
    AccountNotEligible(String),

    #[error("pinned account unavailable: {0}")]
    PinUnavailable(String),

    #[error("no eligible account available")]
    NoAccount,

    #[error("account {account_id} already at daily limit ({limit})")]
    DailyLimitReached { account_id: String, limit: u32 },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} is not in a state that allows this transition")]
    InvalidJobTransition(String),

    #[error("browser session busy for window {0}")]
    SessionBusy(String),

    #[error("browser pool exhausted (max {0} concurrent sessions)")]
    PoolExhausted(usize),

    #[error("circuit breaker open for resource {0}")]
    BreakerOpen(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("control API error: {0}")]
    ControlApi(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("classified failure: {class:?}: {message}")]
    Classified { class: ErrorClass, message: String },
}

impl MatrixError {
    /// Classify this error for the Recovery Engine (spec §7).
    pub fn class(&self) -> ErrorClass {
        match self {
            MatrixError::Classified { class, .. } => *class,
            MatrixError::ControlApi(_) | MatrixError::SessionBusy(_) | MatrixError::PoolExhausted(_) => {
                ErrorClass::Browser
            }
            MatrixError::Timeout(_) => ErrorClass::Network,
            MatrixError::PinUnavailable(_) | MatrixError::DailyLimitReached { .. } => ErrorClass::RateLimit,
            _ => ErrorClass::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, MatrixError>;
