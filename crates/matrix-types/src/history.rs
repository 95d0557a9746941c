//! Append-only outcome/recovery logs (spec §3 "HistoryRecord", §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only outcome log entry. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub account_id: Uuid,
    pub session_pool_id: Option<Uuid>,
    pub success: bool,
    pub duration_ms: u64,
    pub error_summary: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(
        job_id: Uuid,
        account_id: Uuid,
        session_pool_id: Option<Uuid>,
        success: bool,
        duration_ms: u64,
        error_summary: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            account_id,
            session_pool_id,
            success,
            duration_ms,
            error_summary,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only record of a Recovery Engine action, keyed by `(error_class, resource_id)`
/// with the last 10 per key retained for diagnostics (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryLogEntry {
    pub id: Uuid,
    pub error_class: String,
    pub resource_id: String,
    pub action: String,
    pub success: bool,
    pub duration_ms: u64,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl RecoveryLogEntry {
    pub fn new(
        error_class: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
        success: bool,
        duration_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_class: error_class.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            success,
            duration_ms,
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}
