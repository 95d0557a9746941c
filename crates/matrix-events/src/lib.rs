//! Typed, in-process event bus (spec §9: "explicit event channels per
//! component ... no process-wide event bus"). Grounded in
//! `riptide_events::bus::EventBus`, but narrowed to a fixed enum of matrix
//! orchestrator events rather than a `dyn Event` trait object, since every
//! event this system emits is known ahead of time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Coarse upload stage, reported alongside percent-complete (spec §4.6 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Claiming,
    LeasingAccount,
    LeasingSession,
    VerifyingLogin,
    Uploading,
    Finalizing,
}

/// One progress update for a job. Progress is informational only — never a
/// contract (spec §9) — so consumers that miss an update lose nothing.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub percent: u8,
    pub stage: UploadStage,
    pub at: DateTime<Utc>,
}

/// Cross-component lifecycle events (spec §4.7 breaker transitions, §4.8
/// recovery actions, §4.9 pause/resume/shutdown).
#[derive(Debug, Clone)]
pub enum MatrixEvent {
    JobQueued { job_id: Uuid },
    JobStarted { job_id: Uuid, account_id: Uuid },
    JobCompleted { job_id: Uuid, account_id: Uuid },
    JobFailed { job_id: Uuid, terminal: bool, error: String },
    AccountStatusChanged { account_id: Uuid, status: String },
    BreakerOpened { resource_id: String },
    BreakerClosed { resource_id: String },
    SessionEvicted { window_name: String },
    ShutdownStarted,
    ShutdownCompleted,
}

/// Broadcast bus for [`MatrixEvent`]s. Slow/absent subscribers simply miss
/// events that age out of the channel buffer — matching the teacher's
/// `broadcast`-backed `EventBus`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MatrixEvent>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(buffer_size);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatrixEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: MatrixEvent) {
        // No subscribers is not an error: emitting is fire-and-forget.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Per-job progress channel. Backed by `watch` so a new update always
/// replaces the previous one — exactly the "drop oldest" backpressure
/// policy spec §9 asks for, without an unbounded queue.
pub struct ProgressChannel {
    tx: watch::Sender<Option<ProgressUpdate>>,
}

impl ProgressChannel {
    pub fn new() -> (Self, watch::Receiver<Option<ProgressUpdate>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(Some(update));
    }
}

/// Small helper used by the Upload Worker to emit a sequence of coarse
/// stage updates without threading percent math through every call site.
pub fn stage_percent(stage: UploadStage) -> u8 {
    match stage {
        UploadStage::Claiming => 0,
        UploadStage::LeasingAccount => 10,
        UploadStage::LeasingSession => 25,
        UploadStage::VerifyingLogin => 35,
        UploadStage::Uploading => 60,
        UploadStage::Finalizing => 95,
    }
}

/// Poll interval used by components that watch a progress channel purely
/// for logging/diagnostics (not a spec requirement, but matches the
/// teacher's heartbeat-style polling cadence).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(MatrixEvent::ShutdownStarted);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, MatrixEvent::ShutdownStarted));
    }

    #[tokio::test]
    async fn progress_channel_keeps_latest_only() {
        let (chan, mut rx) = ProgressChannel::new();
        let job_id = Uuid::new_v4();

        chan.report(ProgressUpdate {
            job_id,
            percent: 10,
            stage: UploadStage::LeasingAccount,
            at: Utc::now(),
        });
        chan.report(ProgressUpdate {
            job_id,
            percent: 60,
            stage: UploadStage::Uploading,
            at: Utc::now(),
        });

        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone().unwrap();
        assert_eq!(latest.percent, 60);
    }
}
