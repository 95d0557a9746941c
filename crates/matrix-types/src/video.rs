//! Video upload descriptor persisted on a `Job` (spec §3 "Job").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    Public,
    Unlisted,
    Private,
}

impl Default for Privacy {
    fn default() -> Self {
        Self::Private
    }
}

/// Everything needed to drive one upload attempt against the external
/// video platform. `performUpload(session, video)` (spec §1) takes one of
/// these plus a leased `BrowserSession`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSpec {
    pub title: String,
    pub source_path: String,
    pub description: String,
    pub tags: Vec<String>,
    pub privacy: Privacy,
    pub schedule_time: Option<DateTime<Utc>>,
}

impl VideoSpec {
    /// Basic boundary validation (spec §7 `validation` error class).
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title must not be empty".into());
        }
        if self.title.len() > 100 {
            return Err("title exceeds 100 characters".into());
        }
        if self.source_path.trim().is_empty() {
            return Err("source_path must not be empty".into());
        }
        Ok(())
    }
}
