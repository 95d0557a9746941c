//! Error/Shutdown Supervisor (spec §4.9, §7): watches the event bus for
//! failure patterns a single worker can't see on its own and escalates.
//! Grounded in the teacher's `WorkerService::start_metrics_collection_task`
//! — a background task polling shared state on an interval — generalized
//! here to react to events as they arrive instead of polling, since the
//! supervisor's job is to notice a *run* of failures, not a point-in-time
//! count.

use matrix_config::AlertsConfig;
use matrix_events::{EventBus, MatrixEvent};
use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Tracks consecutive job failures across the whole pool (spec §7:
/// "anything unhandled reaching the supervisor ... for uncaught, initiates
/// graceful shutdown"). `shutdown_requested` is observed by the binary's
/// main loop alongside the OS signal future.
pub struct ErrorSupervisor {
    config: AlertsConfig,
    consecutive_failures: AtomicU32,
    shutdown_requested: AtomicBool,
}

impl ErrorSupervisor {
    pub fn new(config: AlertsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            consecutive_failures: AtomicU32::new(0),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Spawn a task consuming `events` until the bus (and every sender)
    /// drops. Returns immediately.
    pub fn spawn(self: &Arc<Self>, events: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                supervisor.observe(&event);
            }
        })
    }

    fn observe(&self, event: &MatrixEvent) {
        match event {
            MatrixEvent::JobFailed { terminal: true, error, .. } => {
                let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if n >= self.config.critical_threshold {
                    error!(consecutive = n, %error, "critical failure streak, requesting shutdown");
                    self.shutdown_requested.store(true, Ordering::Relaxed);
                } else if n >= self.config.consecutive_threshold {
                    warn!(consecutive = n, %error, "consecutive job failures crossed alert threshold");
                }
            }
            MatrixEvent::JobCompleted { .. } => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            MatrixEvent::BreakerOpened { resource_id } => {
                warn!(resource_id, "circuit breaker opened");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn consecutive_terminal_failures_trip_shutdown() {
        let supervisor = ErrorSupervisor::new(AlertsConfig {
            error_rate: 0.5,
            critical_threshold: 3,
            consecutive_threshold: 2,
        });
        for _ in 0..3 {
            supervisor.observe(&MatrixEvent::JobFailed {
                job_id: Uuid::new_v4(),
                terminal: true,
                error: "boom".to_string(),
            });
        }
        assert!(supervisor.shutdown_requested());
    }

    #[test]
    fn a_completion_resets_the_streak() {
        let supervisor = ErrorSupervisor::new(AlertsConfig {
            error_rate: 0.5,
            critical_threshold: 3,
            consecutive_threshold: 2,
        });
        supervisor.observe(&MatrixEvent::JobFailed {
            job_id: Uuid::new_v4(),
            terminal: true,
            error: "boom".to_string(),
        });
        supervisor.observe(&MatrixEvent::JobCompleted {
            job_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
        });
        supervisor.observe(&MatrixEvent::JobFailed {
            job_id: Uuid::new_v4(),
            terminal: true,
            error: "boom".to_string(),
        });
        assert!(!supervisor.shutdown_requested());
    }
}
