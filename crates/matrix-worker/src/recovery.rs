//! Recovery Engine (spec §4.8): dispatches by [`ErrorClass`] to a strategy
//! and keeps a rolling per-resource action log. Grounded structurally in
//! the teacher's pattern of a small dispatch table keyed by category
//! (`riptide_reliability`'s error-class-driven retry policies), adapted to
//! the four strategies (`browser`, `account`, `task`, `network`) spec §4.8
//! names explicitly.

use chrono::Duration;
use dashmap::DashMap;
use matrix_accounts::AccountSelector;
use matrix_browser::BrowserPool;
use matrix_types::account::RecoveryTransition;
use matrix_types::error::ErrorClass;
use matrix_types::history::RecoveryLogEntry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Keep only the last N recovery actions per `(error_class, resource_id)`
/// (spec §4.8: "keeps the last 10 per key for diagnostics").
const LOG_RETENTION_PER_KEY: usize = 10;

/// Fixed delay-retry schedule for coordinator-side connectivity failures
/// (spec §4.8 `network`: "{1s, 5s, 15s, 30s, 60s}").
const NETWORK_BACKOFF_SCHEDULE: [u64; 5] = [1, 5, 15, 30, 60];

/// What the Recovery Engine decided to do with a failed attempt.
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// Evict the dead session; the worker should reopen and retry once more
    /// before giving up (spec §4.8 `browser`).
    RebuildSession { window_name: String },
    /// Reschedule the job with the given delay, same or different account
    /// depending on `retry_same_account`.
    RescheduleWithDelay { delay: Duration, retry_same_account: bool },
    /// Mark the job terminal `failed` immediately — no further attempts.
    FailTerminal,
}

pub struct RecoveryEngine {
    account_selector: Arc<AccountSelector>,
    browser_pool: Arc<BrowserPool>,
    log: DashMap<(String, String), VecDeque<RecoveryLogEntry>>,
}

impl RecoveryEngine {
    pub fn new(account_selector: Arc<AccountSelector>, browser_pool: Arc<BrowserPool>) -> Self {
        Self {
            account_selector,
            browser_pool,
            log: DashMap::new(),
        }
    }

    fn record(&self, class: ErrorClass, resource_id: &str, action: &str, success: bool, duration_ms: u64, message: &str) {
        let entry = RecoveryLogEntry::new(format!("{class:?}"), resource_id, action, success, duration_ms, message);
        let key = (format!("{class:?}"), resource_id.to_string());
        let mut deque = self.log.entry(key).or_default();
        deque.push_back(entry);
        while deque.len() > LOG_RETENTION_PER_KEY {
            deque.pop_front();
        }
    }

    pub fn recent_actions(&self, class: ErrorClass, resource_id: &str) -> Vec<RecoveryLogEntry> {
        self.log
            .get(&(format!("{class:?}"), resource_id.to_string()))
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Dispatch on `class` (spec §4.8). `window_name` and `account_id`
    /// identify the resources this failure touched; `attempt` is the job's
    /// attempt count after this failure was recorded.
    pub async fn handle(
        &self,
        class: ErrorClass,
        window_name: &str,
        account_id: Uuid,
        attempt: u32,
        max_attempts: u32,
    ) -> RecoveryAction {
        let start = Instant::now();
        let action = match class {
            ErrorClass::Browser => self.handle_browser(window_name).await,
            ErrorClass::Auth | ErrorClass::RateLimit | ErrorClass::Suspended => {
                self.handle_account(class, account_id).await
            }
            ErrorClass::Validation => RecoveryAction::FailTerminal,
            ErrorClass::Network => self.handle_network(account_id, attempt).await,
            ErrorClass::Resource | ErrorClass::Unknown => self.handle_task(account_id, attempt, max_attempts).await,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let resource_id = match class {
            ErrorClass::Browser => window_name.to_string(),
            ErrorClass::Auth | ErrorClass::RateLimit | ErrorClass::Suspended => account_id.to_string(),
            _ => window_name.to_string(),
        };
        self.record(class, &resource_id, &format!("{action:?}"), true, duration_ms, "dispatched");
        action
    }

    async fn handle_browser(&self, window_name: &str) -> RecoveryAction {
        warn!(window_name, "evicting dead session");
        if let Err(e) = self.browser_pool.evict(window_name).await {
            warn!(window_name, error = %e, "eviction failed");
        }
        RecoveryAction::RebuildSession {
            window_name: window_name.to_string(),
        }
    }

    /// Persist `transition` against the account store, warning (never
    /// panicking) if the store call fails — a failed write here must not
    /// block the job-level outcome the caller has already decided on.
    async fn apply_transition(&self, account_id: Uuid, transition: RecoveryTransition) {
        if let Err(e) = self.account_selector.apply_recovery_transition(account_id, transition).await {
            warn!(%account_id, ?transition, error = %e, "failed to persist account recovery transition");
        }
    }

    async fn handle_account(&self, class: ErrorClass, account_id: Uuid) -> RecoveryAction {
        match class {
            ErrorClass::Suspended => {
                info!(%account_id, "marking account suspended");
                self.apply_transition(account_id, RecoveryTransition::Suspended).await;
                RecoveryAction::FailTerminal
            }
            ErrorClass::RateLimit => {
                info!(%account_id, "applying rate-limit penalty");
                self.apply_transition(account_id, RecoveryTransition::RateLimited).await;
                RecoveryAction::RescheduleWithDelay {
                    delay: Duration::hours(1),
                    retry_same_account: false,
                }
            }
            ErrorClass::Auth => {
                info!(%account_id, "marking account needs_attention");
                self.apply_transition(account_id, RecoveryTransition::NeedsAttention).await;
                RecoveryAction::FailTerminal
            }
            _ => RecoveryAction::FailTerminal,
        }
    }

    async fn handle_network(&self, account_id: Uuid, attempt: u32) -> RecoveryAction {
        self.apply_transition(account_id, RecoveryTransition::Transient).await;
        let idx = (attempt as usize).min(NETWORK_BACKOFF_SCHEDULE.len() - 1);
        RecoveryAction::RescheduleWithDelay {
            delay: Duration::seconds(NETWORK_BACKOFF_SCHEDULE[idx] as i64),
            retry_same_account: true,
        }
    }

    async fn handle_task(&self, account_id: Uuid, attempt: u32, max_attempts: u32) -> RecoveryAction {
        self.apply_transition(account_id, RecoveryTransition::Transient).await;
        if attempt >= max_attempts {
            RecoveryAction::FailTerminal
        } else {
            RecoveryAction::RescheduleWithDelay {
                delay: Duration::seconds(2i64.pow(attempt.min(5))),
                retry_same_account: true,
            }
        }
    }

    pub fn account_selector(&self) -> &Arc<AccountSelector> {
        &self.account_selector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_backoff_follows_fixed_schedule() {
        let engine_schedule = NETWORK_BACKOFF_SCHEDULE;
        assert_eq!(engine_schedule, [1, 5, 15, 30, 60]);
    }
}
