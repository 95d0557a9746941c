//! Orchestrator Facade (spec §4.9): the one object callers hold. Grounded
//! in `riptide_workers::service::WorkerService` — a single struct built by
//! an async constructor that wires the queue, pool, and workers together
//! and exposes a small, direct method-per-operation surface rather than a
//! builder (`riptide-facade`'s pattern fits a multi-shape scraping API
//! better than this system's fixed set of nine operations).

use chrono::{DateTime, Utc};
use matrix_accounts::{AccountSelector, AccountStore, SelectorError, StoreError};
use matrix_browser::{BrowserPool, PoolStatusCounts};
use matrix_events::{EventBus, MatrixEvent, ProgressUpdate};
use matrix_queue::{JobQueue, QueueError, QueueStats};
use matrix_types::account::{Account, AccountFilter, AccountStatus, AccountUpdate, DEFAULT_HEALTH_THRESHOLD};
use matrix_types::job::Job;
use matrix_types::video::VideoSpec;
use matrix_worker::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid video: {0}")]
    InvalidVideo(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// Optional per-submission overrides (spec §4.9 `submit` "hints").
#[derive(Debug, Clone, Default)]
pub struct SubmitHints {
    pub priority: Option<u8>,
    pub pinned_account_id: Option<Uuid>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

const DEFAULT_PRIORITY: u8 = 5;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AccountStatusCounts {
    pub total: usize,
    pub active: usize,
    pub limited: usize,
    pub suspended: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SystemStatus {
    pub accounts: AccountStatusCounts,
    pub queue: QueueStats,
    pub pool: PoolStatusCounts,
}

/// Spec §4.9 `status`: the persisted job record plus a best-effort snapshot
/// of its in-flight progress, when a worker is currently driving it (spec
/// §9's "bounded progress channel consumed by the orchestrator facade").
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatusView {
    pub job: Job,
    pub progress: Option<ProgressUpdate>,
}

/// Pure round-robin pin assignment for `submit_batch` (spec §4.9
/// `submitBatch`): one entry per job, cycling through `eligible` in order.
fn round_robin_pins(count: usize, eligible: &[Account]) -> Vec<Option<Uuid>> {
    if eligible.is_empty() {
        return vec![None; count];
    }
    (0..count).map(|i| Some(eligible[i % eligible.len()].id)).collect()
}

/// Pure aggregation for `system_status` (spec §4.9 `systemStatus`).
fn count_accounts_by_status(accounts: &[Account]) -> AccountStatusCounts {
    let mut counts = AccountStatusCounts {
        total: accounts.len(),
        ..Default::default()
    };
    for a in accounts {
        match a.status {
            AccountStatus::Active => counts.active += 1,
            AccountStatus::Limited => counts.limited += 1,
            AccountStatus::Suspended => counts.suspended += 1,
            AccountStatus::NeedsAttention | AccountStatus::Error => counts.errored += 1,
        }
    }
    counts
}

/// Wires every component and exposes the public surface spec §4.9 names.
/// Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct MatrixOrchestrator {
    queue: Arc<JobQueue>,
    store: Arc<dyn AccountStore>,
    selector: Arc<AccountSelector>,
    browser_pool: Arc<BrowserPool>,
    worker_pool: Arc<WorkerPool>,
    events: Arc<EventBus>,
    shutdown_timeout: Duration,
}

impl MatrixOrchestrator {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn AccountStore>,
        selector: Arc<AccountSelector>,
        browser_pool: Arc<BrowserPool>,
        worker_pool: Arc<WorkerPool>,
        events: Arc<EventBus>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            selector,
            browser_pool,
            worker_pool,
            events,
            shutdown_timeout,
        }
    }

    fn build_job(video: VideoSpec, hints: &SubmitHints) -> Result<Job, OrchestratorError> {
        video.validate().map_err(OrchestratorError::InvalidVideo)?;
        let mut job = Job::new(
            video,
            hints.priority.unwrap_or(DEFAULT_PRIORITY),
            hints.pinned_account_id,
            hints.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        );
        job.scheduled_for = hints.scheduled_for;
        Ok(job)
    }

    /// Spec §4.9 `submit`.
    pub async fn submit(&self, video: VideoSpec, hints: SubmitHints) -> Result<Uuid, OrchestratorError> {
        let job = Self::build_job(video, &hints)?;
        let id = self.queue.enqueue(job).await?;
        self.events.emit(MatrixEvent::JobQueued { job_id: id });
        info!(job_id = %id, "job submitted");
        Ok(id)
    }

    /// Spec §4.9 `submitBatch`: round-robins a different pinned account per
    /// job across currently-healthy accounts, unless `hints` already pins
    /// one explicitly (that pin then applies to every job in the batch).
    pub async fn submit_batch(&self, videos: Vec<VideoSpec>, hints: SubmitHints) -> Result<Vec<Uuid>, OrchestratorError> {
        let pins: Vec<Option<Uuid>> = if hints.pinned_account_id.is_some() {
            vec![hints.pinned_account_id; videos.len()]
        } else {
            let eligible = self
                .store
                .get_eligible(videos.len().max(1) as u32, DEFAULT_HEALTH_THRESHOLD)
                .await?;
            round_robin_pins(videos.len(), &eligible)
        };

        let mut ids = Vec::with_capacity(videos.len());
        for (video, pinned) in videos.into_iter().zip(pins) {
            let mut per_job_hints = hints.clone();
            per_job_hints.pinned_account_id = pinned;
            let job = Self::build_job(video, &per_job_hints)?;
            let id = self.queue.enqueue(job).await?;
            self.events.emit(MatrixEvent::JobQueued { job_id: id });
            ids.push(id);
        }
        info!(count = ids.len(), "batch submitted");
        Ok(ids)
    }

    /// Spec §4.9 `cancel`.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        self.queue.cancel(job_id).await?;
        Ok(())
    }

    /// Spec §4.9 `retry`: immediate requeue with attempts reset to 0.
    pub async fn retry(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        self.queue.retry_later(job_id, chrono::Duration::zero()).await?;
        Ok(())
    }

    /// Spec §4.9 `status`.
    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView, OrchestratorError> {
        let job = self.queue.get_job(job_id).await?;
        let progress = self.worker_pool.progress(job_id);
        Ok(JobStatusView { job, progress })
    }

    /// Spec §4.9 `listAccounts`.
    pub async fn list_accounts(&self, filter: AccountFilter) -> Result<Vec<Account>, OrchestratorError> {
        Ok(self.store.list(filter).await?)
    }

    /// Spec §4.9 `upsertAccount`: creates if `id` is absent from the store,
    /// otherwise applies `update` in place.
    pub async fn upsert_account(&self, account: Account) -> Result<Account, OrchestratorError> {
        Self::upsert_account_with(self.store.as_ref(), &self.browser_pool, account).await
    }

    /// Create-vs-update branch of `upsert_account`, factored out so it can
    /// be exercised against a fake store without the rest of the facade's
    /// dependencies (queue, worker pool, event bus).
    async fn upsert_account_with(
        store: &dyn AccountStore,
        browser_pool: &BrowserPool,
        account: Account,
    ) -> Result<Account, OrchestratorError> {
        match store.get(account.id).await {
            Ok(_) => {
                let update = AccountUpdate {
                    status: Some(account.status),
                    health_score: Some(account.health_score),
                    daily_upload_limit: Some(account.daily_upload_limit),
                    credentials_ciphertext: Some(account.credentials_ciphertext),
                };
                Ok(store.update(account.id, update).await?)
            }
            Err(StoreError::NotFound(_)) => {
                browser_pool.register(account.window_name.clone());
                store.create(&account).await?;
                Ok(account)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Spec §4.9 `disableAccount`: marks suspended and evicts its session so
    /// no in-flight lease continues against a disabled account.
    pub async fn disable_account(&self, account_id: Uuid) -> Result<Account, OrchestratorError> {
        let account = self.store.get(account_id).await?;
        let updated = self
            .store
            .update(
                account_id,
                AccountUpdate {
                    status: Some(AccountStatus::Suspended),
                    ..Default::default()
                },
            )
            .await?;
        let _ = self.browser_pool.evict(&account.window_name).await;
        self.events.emit(MatrixEvent::AccountStatusChanged {
            account_id,
            status: "suspended".to_string(),
        });
        Ok(updated)
    }

    /// Spec §4.9 `systemStatus`.
    pub async fn system_status(&self) -> Result<SystemStatus, OrchestratorError> {
        let accounts = self.store.list(AccountFilter::default()).await?;
        Ok(SystemStatus {
            accounts: count_accounts_by_status(&accounts),
            queue: self.queue.stats().await?,
            pool: self.browser_pool.status_counts(),
        })
    }

    /// Spec §4.9 `pause`: dispatch only, in-flight jobs continue.
    pub async fn pause(&self) -> Result<(), OrchestratorError> {
        self.queue.pause().await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), OrchestratorError> {
        self.queue.resume().await?;
        Ok(())
    }

    /// Spec §4.9 `shutdown`: stop accepting new claims, wait for in-flight
    /// jobs up to `shutdown_timeout`, then force.
    pub async fn shutdown(&self) {
        self.events.emit(MatrixEvent::ShutdownStarted);
        self.queue.pause().await.ok();
        self.worker_pool.shutdown(self.shutdown_timeout).await;
        self.events.emit(MatrixEvent::ShutdownCompleted);
        info!("orchestrator shut down");
    }

    pub fn account_selector(&self) -> &Arc<AccountSelector> {
        &self.selector
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use matrix_browser::BrowserControlClient;
    use matrix_types::account::RecoveryTransition;
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        accounts: StdMutex<Vec<Account>>,
    }

    #[async_trait]
    impl AccountStore for FakeStore {
        async fn create(&self, account: &Account) -> Result<(), StoreError> {
            self.accounts.lock().unwrap().push(account.clone());
            Ok(())
        }
        async fn get(&self, id: Uuid) -> Result<Account, StoreError> {
            self.accounts.lock().unwrap().iter().find(|a| a.id == id).cloned().ok_or(StoreError::NotFound(id))
        }
        async fn update(&self, id: Uuid, update: AccountUpdate) -> Result<Account, StoreError> {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts.iter_mut().find(|a| a.id == id).ok_or(StoreError::NotFound(id))?;
            if let Some(status) = update.status {
                account.status = status;
            }
            if let Some(health) = update.health_score {
                account.health_score = health;
            }
            Ok(account.clone())
        }
        async fn delete(&self, _id: Uuid) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn list(&self, _filter: AccountFilter) -> Result<Vec<Account>, StoreError> {
            Ok(self.accounts.lock().unwrap().clone())
        }
        async fn get_eligible(&self, _count: u32, _threshold: u8) -> Result<Vec<Account>, StoreError> {
            unimplemented!()
        }
        async fn update_health(&self, _id: Uuid, _success: bool) -> Result<Account, StoreError> {
            unimplemented!()
        }
        async fn increment_daily(&self, _id: Uuid) -> Result<Account, StoreError> {
            unimplemented!()
        }
        async fn rollover_daily(&self) -> Result<u64, StoreError> {
            unimplemented!()
        }
        async fn apply_recovery_transition(&self, _id: Uuid, _transition: RecoveryTransition) -> Result<Account, StoreError> {
            unimplemented!()
        }
    }

    fn test_browser_pool() -> BrowserPool {
        let client = Arc::new(BrowserControlClient::new("http://127.0.0.1:1", 1, 1).unwrap());
        BrowserPool::new(client, 4, Duration::from_millis(200))
    }

    #[test]
    fn round_robin_pins_cycles_through_eligible_accounts() {
        let a1 = Account::new("a@example.com", "win-a", vec![]);
        let a2 = Account::new("b@example.com", "win-b", vec![]);
        let eligible = vec![a1.clone(), a2.clone()];

        let pins = round_robin_pins(3, &eligible);
        assert_eq!(pins, vec![Some(a1.id), Some(a2.id), Some(a1.id)]);
    }

    #[test]
    fn round_robin_pins_is_none_when_no_eligible_accounts() {
        let pins = round_robin_pins(2, &[]);
        assert_eq!(pins, vec![None, None]);
    }

    #[test]
    fn count_accounts_by_status_aggregates_each_bucket() {
        let mut active = Account::new("a@example.com", "win-a", vec![]);
        active.status = AccountStatus::Active;
        let mut limited = Account::new("b@example.com", "win-b", vec![]);
        limited.status = AccountStatus::Limited;
        let mut suspended = Account::new("c@example.com", "win-c", vec![]);
        suspended.status = AccountStatus::Suspended;
        let mut needs_attention = Account::new("d@example.com", "win-d", vec![]);
        needs_attention.status = AccountStatus::NeedsAttention;

        let counts = count_accounts_by_status(&[active, limited, suspended, needs_attention]);
        assert_eq!(counts.total, 4);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.limited, 1);
        assert_eq!(counts.suspended, 1);
        assert_eq!(counts.errored, 1);
    }

    #[tokio::test]
    async fn upsert_account_creates_when_absent() {
        let store = FakeStore { accounts: StdMutex::new(vec![]) };
        let pool = test_browser_pool();
        let account = Account::new("new@example.com", "win-new", vec![]);

        let created = MatrixOrchestrator::upsert_account_with(&store, &pool, account.clone()).await.unwrap();
        assert_eq!(created.id, account.id);
        assert_eq!(pool.registered_count(), 1);
        assert_eq!(store.accounts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_account_updates_when_present() {
        let mut existing = Account::new("existing@example.com", "win-existing", vec![]);
        existing.status = AccountStatus::Active;
        let account_id = existing.id;
        let store = FakeStore { accounts: StdMutex::new(vec![existing]) };
        let pool = test_browser_pool();

        let mut update = Account::new("existing@example.com", "win-existing", vec![]);
        update.id = account_id;
        update.status = AccountStatus::Suspended;

        let updated = MatrixOrchestrator::upsert_account_with(&store, &pool, update).await.unwrap();
        assert_eq!(updated.status, AccountStatus::Suspended);
        assert_eq!(pool.registered_count(), 0);
        assert_eq!(store.accounts.lock().unwrap().len(), 1);
    }
}
