//! Upload Worker and worker pool (spec §4.6).
//!
//! Structurally grounded in `riptide_workers::worker::{Worker, WorkerPool}`:
//! a semaphore-bounded pool of workers polling a shared queue, each running
//! one job at a time with a heartbeat task reporting liveness. The per-job
//! procedure itself follows spec §4.6's eight numbered steps rather than
//! the teacher's generic `JobProcessor` dispatch, since this system only
//! ever runs one kind of job (an upload).

use crate::processor::{make_progress_update, ProgressReporter, UploadPerformer};
use crate::recovery::{RecoveryAction, RecoveryEngine};
use dashmap::DashMap;
use matrix_accounts::{AccountSelector, HistoryStore, SelectorError};
use matrix_browser::BrowserPool;
use matrix_events::{EventBus, MatrixEvent, ProgressChannel, ProgressUpdate, UploadStage};
use matrix_queue::JobQueue;
use matrix_reliability::BreakerRegistry;
use matrix_types::account::RecoveryTransition;
use matrix_types::error::MatrixError;
use matrix_types::history::HistoryRecord;
use matrix_types::job::{Job, JobResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub upload_deadline: Duration,
    pub heartbeat_interval: Duration,
    /// Delay used when releasing a job back to `queued` without counting an
    /// attempt (spec §4.6 step 2/3).
    pub uncounted_release_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            poll_interval: Duration::from_secs(2),
            upload_deadline: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
            uncounted_release_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub last_heartbeat: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
    pub current_job: RwLock<Option<Uuid>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatsSnapshot {
    pub worker_id: String,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub current_job: Option<Uuid>,
    pub is_healthy: bool,
}

pub struct Worker {
    pub id: String,
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    account_selector: Arc<AccountSelector>,
    browser_pool: Arc<BrowserPool>,
    recovery: Arc<RecoveryEngine>,
    performer: Arc<dyn UploadPerformer>,
    events: Arc<EventBus>,
    /// Per-account breaker protecting `performUpload` (spec §4.7: "keyed
    /// by, e.g., account id, window-name, external API" — this is the
    /// account-id instance; the control API has its own).
    breakers: Arc<BreakerRegistry>,
    history: Arc<dyn HistoryStore>,
    /// In-flight jobs' latest progress, shared across every worker in the
    /// pool and consumed through the orchestrator facade (spec §9).
    progress_channels: Arc<DashMap<Uuid, watch::Receiver<Option<ProgressUpdate>>>>,
    running: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

struct ChannelProgressReporter {
    job_id: Uuid,
    channel: ProgressChannel,
}

impl ProgressReporter for ChannelProgressReporter {
    fn report(&self, stage: UploadStage, _percent: u8) {
        self.channel.report(make_progress_update(self.job_id, stage));
    }
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        account_selector: Arc<AccountSelector>,
        browser_pool: Arc<BrowserPool>,
        recovery: Arc<RecoveryEngine>,
        performer: Arc<dyn UploadPerformer>,
        events: Arc<EventBus>,
        breakers: Arc<BreakerRegistry>,
        history: Arc<dyn HistoryStore>,
        progress_channels: Arc<DashMap<Uuid, watch::Receiver<Option<ProgressUpdate>>>>,
    ) -> Self {
        Self {
            id,
            config,
            queue,
            account_selector,
            browser_pool,
            recovery,
            performer,
            events,
            breakers,
            history,
            progress_channels,
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            worker_id: self.id.clone(),
            jobs_completed: self.stats.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.stats.jobs_failed.load(Ordering::Relaxed),
            current_job: *self.stats.current_job.read(),
            is_healthy: self.is_healthy(),
        }
    }

    fn is_healthy(&self) -> bool {
        match *self.stats.last_heartbeat.read() {
            Some(t) => (chrono::Utc::now() - t).num_seconds() < (self.config.heartbeat_interval.as_secs() * 3) as i64,
            None => true,
        }
    }

    pub async fn run(&self) {
        info!(worker_id = %self.id, "worker started");
        let heartbeat = self.heartbeat_task();
        let main = self.main_loop();
        tokio::select! {
            _ = heartbeat => {}
            _ = main => {}
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    fn heartbeat_task(&self) -> impl std::future::Future<Output = ()> {
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let interval = self.config.heartbeat_interval;
        async move {
            while running.load(Ordering::Relaxed) {
                *stats.last_heartbeat.write() = Some(chrono::Utc::now());
                sleep(interval).await;
            }
        }
    }

    async fn main_loop(&self) {
        while self.running.load(Ordering::Relaxed) {
            match self.claim_and_process().await {
                Ok(true) => {}
                Ok(false) => sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "error processing job, continuing");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Claim one job from the queue and run it through the spec §4.6
    /// per-job procedure. Returns `Ok(true)` if a job was found.
    async fn claim_and_process(&self) -> Result<bool, MatrixError> {
        let job = match self.queue.next_job(&self.id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(false),
            Err(e) => return Err(MatrixError::Storage(e.to_string())),
        };

        *self.stats.current_job.write() = Some(job.id);
        self.events.emit(MatrixEvent::JobStarted {
            job_id: job.id,
            account_id: job.pinned_account_id.unwrap_or_default(),
        });

        self.run_one_attempt(job).await;
        *self.stats.current_job.write() = None;
        Ok(true)
    }

    async fn run_one_attempt(&self, job: Job) {
        let job_id = job.id;
        let start = Instant::now();

        // Step 2: resolve target account.
        let account = match self.account_selector.lease(job_id, job.pinned_account_id).await {
            Ok(account) => account,
            Err(SelectorError::PinUnavailable(_)) | Err(SelectorError::NoAccount) => {
                self.release_uncounted(job_id).await;
                return;
            }
            Err(e) => {
                warn!(%job_id, error = %e, "account selector error, releasing job uncounted");
                self.release_uncounted(job_id).await;
                return;
            }
        };

        match self.queue.check_account_rate_limit(account.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%job_id, account_id = %account.id, "account rate limit exceeded, releasing job uncounted");
                self.account_selector.release_uncounted(account.id);
                self.release_uncounted(job_id).await;
                return;
            }
            Err(e) => {
                warn!(%job_id, account_id = %account.id, error = %e, "rate limit check failed, proceeding");
            }
        }

        // Step 3: lease a browser session keyed by the account's window name.
        let lease = match self.browser_pool.lease_by_name(&account.window_name).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(%job_id, account_id = %account.id, error = %e, "session lease failed, releasing");
                self.account_selector.release_uncounted(account.id);
                self.release_uncounted(job_id).await;
                return;
            }
        };

        // Step 4: verify login.
        match self.performer.verify_logged_in(&lease).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                warn!(%job_id, account_id = %account.id, "session not logged in, failing job non-retryably");
                if let Err(e) = self
                    .account_selector
                    .apply_recovery_transition(account.id, RecoveryTransition::NeedsAttention)
                    .await
                {
                    warn!(%job_id, account_id = %account.id, error = %e, "failed to mark account needs_attention");
                }
                self.account_selector.release_uncounted(account.id);
                drop(lease);
                self.fail_terminal(job_id, "session not logged in").await;
                return;
            }
        }

        // Step 5: perform the upload under a hard deadline, gated by the
        // per-account circuit breaker.
        let breaker = self.breakers.get(&account.id.to_string());
        let _permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%job_id, account_id = %account.id, "account breaker open, releasing job uncounted");
                self.account_selector.release_uncounted(account.id);
                drop(lease);
                self.release_uncounted(job_id).await;
                return;
            }
        };

        let (progress_chan, rx) = ProgressChannel::new();
        self.progress_channels.insert(job_id, rx);
        let reporter = ChannelProgressReporter { job_id, channel: progress_chan };
        reporter.report(UploadStage::Uploading, 0);

        let outcome = tokio::time::timeout(
            self.config.upload_deadline,
            self.performer.perform_upload(&lease, &job.video, &reporter),
        )
        .await;

        let state_before = breaker.state();
        match &outcome {
            Ok(Ok(_)) => breaker.on_success(),
            _ => breaker.on_failure(),
        }
        let resource_id = account.id.to_string();
        match (state_before, breaker.state()) {
            (matrix_reliability::State::Closed, matrix_reliability::State::Open) => {
                self.events.emit(MatrixEvent::BreakerOpened { resource_id });
            }
            (matrix_reliability::State::HalfOpen, matrix_reliability::State::Closed) => {
                self.events.emit(MatrixEvent::BreakerClosed { resource_id });
            }
            _ => {}
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(video_url)) => {
                // Step 6: success path.
                let _ = self.queue.complete(
                    job_id,
                    JobResult {
                        job_id,
                        success: true,
                        video_url: Some(video_url),
                        error: None,
                        duration_ms,
                    },
                ).await;
                let _ = self.account_selector.release(account.id, job_id, true).await;
                self.record_history(job_id, account.id, true, duration_ms, None).await;
                self.stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(MatrixEvent::JobCompleted { job_id, account_id: account.id });
                info!(%job_id, account_id = %account.id, duration_ms, "upload completed");
            }
            Ok(Err(matrix_err)) => {
                self.record_history(job_id, account.id, false, duration_ms, Some(matrix_err.to_string())).await;
                self.handle_attempt_failure(job_id, &job, &account, &lease.window_name().to_string(), matrix_err).await;
            }
            Err(_) => {
                self.record_history(job_id, account.id, false, duration_ms, Some("upload deadline exceeded".to_string())).await;
                self.handle_attempt_failure(
                    job_id,
                    &job,
                    &account,
                    &lease.window_name().to_string(),
                    MatrixError::Timeout("upload deadline exceeded".to_string()),
                )
                .await;
            }
        }

        // Step 8 (finally): always release the session lease and the
        // per-job progress channel, regardless of outcome. Every early
        // return above already released the account lease itself.
        drop(lease);
        self.progress_channels.remove(&job_id);
    }

    async fn record_history(&self, job_id: Uuid, account_id: Uuid, success: bool, duration_ms: u64, error_summary: Option<String>) {
        let entry = HistoryRecord::new(job_id, account_id, None, success, duration_ms, error_summary);
        if let Err(e) = self.history.record(entry).await {
            warn!(%job_id, %account_id, error = %e, "failed to persist history record");
        }
    }

    /// Step 7: classify the failure and dispatch to the Recovery Engine.
    async fn handle_attempt_failure(&self, job_id: Uuid, job: &Job, account: &matrix_types::account::Account, window_name: &str, err: MatrixError) {
        let class = err.class();
        warn!(%job_id, account_id = %account.id, ?class, error = %err, "attempt failed");

        let action = self
            .recovery
            .handle(class, window_name, account.id, job.attempts + 1, job.max_attempts)
            .await;

        let _ = self.account_selector.release(account.id, job_id, false).await;

        let is_terminal = matches!(action, RecoveryAction::FailTerminal);

        match action {
            RecoveryAction::FailTerminal => {
                self.fail_terminal(job_id, err.to_string()).await;
            }
            RecoveryAction::RescheduleWithDelay { delay, .. } => {
                let _ = self.queue.fail_with_delay(job_id, err.to_string(), Some(delay)).await;
            }
            RecoveryAction::RebuildSession { .. } => {
                let _ = self.queue.fail(job_id, err.to_string()).await;
            }
        }

        self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(MatrixEvent::JobFailed { job_id, terminal: is_terminal, error: err.to_string() });
    }

    async fn fail_terminal(&self, job_id: Uuid, error: impl Into<String>) {
        let error = error.into();
        let _ = self.queue.fail(job_id, error.clone()).await;
        if let Ok(mut job) = self.queue.get_job(job_id).await {
            job.fail_terminal(error);
        }
    }

    async fn release_uncounted(&self, job_id: Uuid) {
        if let Err(e) = self.queue.retry_later(job_id, chrono::Duration::from_std(self.config.uncounted_release_delay).unwrap()).await {
            warn!(%job_id, error = %e, "failed to release job uncounted");
        }
    }
}

pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    account_selector: Arc<AccountSelector>,
    browser_pool: Arc<BrowserPool>,
    recovery: Arc<RecoveryEngine>,
    performer: Arc<dyn UploadPerformer>,
    events: Arc<EventBus>,
    breakers: Arc<BreakerRegistry>,
    history: Arc<dyn HistoryStore>,
    progress_channels: Arc<DashMap<Uuid, watch::Receiver<Option<ProgressUpdate>>>>,
    workers: DashMap<String, Arc<Worker>>,
    concurrency: Arc<Semaphore>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        account_selector: Arc<AccountSelector>,
        browser_pool: Arc<BrowserPool>,
        recovery: Arc<RecoveryEngine>,
        performer: Arc<dyn UploadPerformer>,
        events: Arc<EventBus>,
        breakers: Arc<BreakerRegistry>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.worker_count));
        Self {
            config,
            queue,
            account_selector,
            browser_pool,
            recovery,
            performer,
            events,
            breakers,
            history,
            progress_channels: Arc::new(DashMap::new()),
            workers: DashMap::new(),
            concurrency,
        }
    }

    /// Spawn `worker_count` workers, each run as its own task. Returns
    /// immediately; hold the returned handles or call [`WorkerPool::stop`]
    /// to shut them down.
    pub fn spawn(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.worker_count);
        for i in 0..self.config.worker_count {
            let worker_id = format!("worker-{i}");
            let worker = Arc::new(Worker::new(
                worker_id.clone(),
                self.config.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&self.account_selector),
                Arc::clone(&self.browser_pool),
                Arc::clone(&self.recovery),
                Arc::clone(&self.performer),
                Arc::clone(&self.events),
                Arc::clone(&self.breakers),
                Arc::clone(&self.history),
                Arc::clone(&self.progress_channels),
            ));
            self.workers.insert(worker_id, Arc::clone(&worker));
            handles.push(tokio::spawn(async move { worker.run().await }));
        }
        handles
    }

    /// Stop accepting new claims (spec §4.9 `shutdown`: "stop accepting new
    /// claims, wait for in-flight jobs up to shutdown_timeout, then force").
    pub async fn shutdown(&self, timeout: Duration) {
        for w in self.workers.iter() {
            w.value().stop();
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let any_in_flight = self.workers.iter().any(|w| w.value().stats().current_job.is_some());
            if !any_in_flight {
                break;
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    pub fn stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.workers.iter().map(|w| w.value().stats()).collect()
    }

    pub fn available_permits(&self) -> usize {
        self.concurrency.available_permits()
    }

    /// Best-effort progress snapshot for a job currently past the upload
    /// step (spec §9); `None` before that point or once the job finishes.
    pub fn progress(&self, job_id: Uuid) -> Option<ProgressUpdate> {
        self.progress_channels.get(&job_id).and_then(|rx| rx.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_config_matches_spec() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.worker_count, 5);
        assert_eq!(cfg.upload_deadline, Duration::from_secs(1800));
    }
}
