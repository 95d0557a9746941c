//! Upload job record and its status machine (spec §3 "Job").

use crate::video::VideoSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// `pending -> queued -> active -> {completed | failed | cancelled}`;
/// `failed` with attempts remaining may transition back to `queued`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Exponential backoff schedule for job retries (spec §4.5, §6 `queue.backoff`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            cap_ms: 60_000,
            jitter_fraction: 0.20,
        }
    }
}

impl BackoffConfig {
    /// `base * 2^attempt`, capped, plus up to `jitter_fraction` jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> chrono::Duration {
        let raw = self.base_ms as f64 * 2f64.powi(attempt as i32);
        let capped = raw.min(self.cap_ms as f64);
        let jitter = capped * self.jitter_fraction * rand::random::<f64>();
        chrono::Duration::milliseconds((capped + jitter) as i64)
    }
}

/// One upload request for one video against one (chosen or pinned) account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub video: VideoSpec,
    /// If set, this account must be used (spec §3 "Optional account pin").
    pub pinned_account_id: Option<Uuid>,
    /// Lower is higher priority (spec §4.5: 0-10).
    pub priority: u8,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set once the worker has an authoritative outcome from the platform.
    pub result_video_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Job {
    pub fn new(video: VideoSpec, priority: u8, pinned_account_id: Option<Uuid>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            video,
            pinned_account_id,
            priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            backoff: BackoffConfig::default(),
            scheduled_for: None,
            last_error: None,
            result_video_url: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// `submit -> status` returns `{status: queued, attempts: 0}` before any
    /// worker picks the job up (spec §8 round-trip property).
    pub fn is_freshly_queued(&self) -> bool {
        self.status == JobStatus::Queued && self.attempts == 0
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        match self.scheduled_for {
            Some(t) => now >= t,
            None => true,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Active;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, video_url: String) {
        self.status = JobStatus::Completed;
        self.result_video_url = Some(video_url);
        self.updated_at = Utc::now();
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt. Does not increment `attempts` itself on
    /// early releases (e.g. no account available) — callers that found a
    /// genuine attempt failure should call [`Job::record_attempt`] first.
    pub fn fail_terminal(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Record an attempt and either reschedule (`queued`, delayed) or mark
    /// terminal `failed` once `max_attempts` is exhausted (spec §4.5/§4.8).
    pub fn record_attempt_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();

        if self.attempts >= self.max_attempts {
            self.status = JobStatus::Failed;
        } else {
            self.status = JobStatus::Queued;
            self.scheduled_for = Some(Utc::now() + self.backoff.delay_for_attempt(self.attempts));
        }
    }

    /// Release back to `queued` without counting an attempt (spec §4.6 step 2/3:
    /// no account/session available).
    pub fn release_uncounted(&mut self, delay: chrono::Duration) {
        self.status = JobStatus::Queued;
        self.scheduled_for = Some(Utc::now() + delay);
        self.updated_at = Utc::now();
    }

    /// `retry` on a `failed` job yields `queued` with attempts reset to 0
    /// (spec §8 round-trip property).
    pub fn retry_reset(&mut self) {
        self.attempts = 0;
        self.status = JobStatus::Queued;
        self.scheduled_for = None;
        self.updated_at = Utc::now();
    }
}

/// Terminal outcome of one worker attempt, independent of the append-only
/// history log (spec §3 "HistoryRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub success: bool,
    pub video_url: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Privacy;

    fn sample_video() -> VideoSpec {
        VideoSpec {
            title: "t".into(),
            source_path: "/tmp/v.mp4".into(),
            description: String::new(),
            tags: vec![],
            privacy: Privacy::Private,
            schedule_time: None,
        }
    }

    #[test]
    fn new_job_is_freshly_queued() {
        let job = Job::new(sample_video(), 5, None, 3);
        assert!(job.is_freshly_queued());
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn failure_reschedules_until_max_attempts() {
        let mut job = Job::new(sample_video(), 5, None, 2);
        job.record_attempt_failure("boom");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.scheduled_for.is_some());

        job.record_attempt_failure("boom again");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn retry_resets_attempts_but_keeps_error() {
        let mut job = Job::new(sample_video(), 5, None, 1);
        job.record_attempt_failure("boom");
        assert_eq!(job.status, JobStatus::Failed);

        job.retry_reset();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn release_uncounted_does_not_increment_attempts() {
        let mut job = Job::new(sample_video(), 5, None, 3);
        job.release_uncounted(chrono::Duration::seconds(5));
        assert_eq!(job.attempts, 0);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        let cfg = BackoffConfig {
            base_ms: 2_000,
            cap_ms: 60_000,
            jitter_fraction: 0.0,
        };
        assert_eq!(cfg.delay_for_attempt(0).num_milliseconds(), 2_000);
        assert_eq!(cfg.delay_for_attempt(1).num_milliseconds(), 4_000);
        assert_eq!(cfg.delay_for_attempt(10).num_milliseconds(), 60_000);
    }
}
