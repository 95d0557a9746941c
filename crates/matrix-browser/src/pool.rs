//! Browser Profile Pool (spec §4.2).
//!
//! Structurally grounded in `riptide_headless::pool::BrowserPoolConfig`/
//! `PooledBrowser` — a config-bounded pool of live resources with health
//! tracking and idle eviction — but the resource here is a remote window
//! controlled entirely through [`crate::client::BrowserControlClient`]
//! rather than a locally-owned `spider_chrome::Browser`, and leasing keys
//! off the stable `window_name` bound 1:1 to an account (spec §4.2: "one
//! window name per account; sessions are never shared across accounts").

use crate::client::{BrowserControlClient, ControlApiError, WindowRef};
use chrono::Utc;
use dashmap::DashMap;
use matrix_types::session::BrowserSession;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session is registered for window {0}")]
    UnknownWindow(String),
    #[error("window {0} is already leased")]
    Busy(String),
    #[error("pool is at max concurrent sessions ({0})")]
    SaturatedPool(usize),
    #[error(transparent)]
    ControlApi(#[from] ControlApiError),
    #[error("timed out leasing window {0}")]
    LeaseTimeout(String),
}

struct Slot {
    session: Mutex<BrowserSession>,
}

/// An exclusive lease on one browser profile's session, released back to the
/// pool on drop regardless of how the holder's future exits (spec §4.2:
/// "a crashed worker must not permanently strand a session").
pub struct SessionLease {
    window_name: String,
    guard: Option<OwnedMutexGuard<BrowserSession>>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session(&self) -> &BrowserSession {
        self.guard.as_ref().expect("lease guard present until drop")
    }

    pub fn session_mut(&mut self) -> &mut BrowserSession {
        self.guard.as_mut().expect("lease guard present until drop")
    }

    pub fn window_name(&self) -> &str {
        &self.window_name
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        // Dropping the `OwnedMutexGuard` releases the per-window exclusivity
        // lock; dropping `_permit` frees one pool-wide concurrency slot.
        // Nothing else to do here — the session itself stays registered.
    }
}

pub struct BrowserPool {
    client: Arc<BrowserControlClient>,
    slots: DashMap<String, Arc<Slot>>,
    concurrency: Arc<Semaphore>,
    max_concurrent: usize,
    lease_timeout: Duration,
}

impl BrowserPool {
    pub fn new(client: Arc<BrowserControlClient>, max_concurrent_sessions: usize, lease_timeout: Duration) -> Self {
        Self {
            client,
            slots: DashMap::new(),
            concurrency: Arc::new(Semaphore::new(max_concurrent_sessions)),
            max_concurrent: max_concurrent_sessions,
            lease_timeout,
        }
    }

    /// Register a known profile so it can later be leased by name. Profiles
    /// are provisioned out of band (spec §4.2 Non-goals: "provisioning new
    /// browser profiles is out of scope"); this just adds it to the pool's
    /// bookkeeping.
    pub fn register(&self, window_name: impl Into<String>) {
        let window_name = window_name.into();
        self.slots.entry(window_name.clone()).or_insert_with(|| {
            Arc::new(Slot {
                session: Mutex::new(BrowserSession::new(window_name)),
            })
        });
    }

    pub fn registered_count(&self) -> usize {
        self.slots.len()
    }

    /// Lease the session bound to `window_name`, opening the remote browser
    /// window if it is not already live (spec §4.2 step 2: "open-if-absent,
    /// reuse otherwise").
    pub async fn lease_by_name(&self, window_name: &str) -> Result<SessionLease, PoolError> {
        let slot = self
            .slots
            .get(window_name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| PoolError::UnknownWindow(window_name.to_string()))?;

        let permit = tokio::time::timeout(self.lease_timeout, Arc::clone(&self.concurrency).acquire_owned())
            .await
            .map_err(|_| PoolError::LeaseTimeout(window_name.to_string()))?
            .expect("semaphore is never closed");

        let mut guard = tokio::time::timeout(self.lease_timeout, Arc::clone(&slot.session).lock_owned())
            .await
            .map_err(|_| PoolError::LeaseTimeout(window_name.to_string()))?;

        if !guard.state.is_live() {
            match self.client.open_window(WindowRef::Name(window_name.to_string())).await {
                Ok(opened) => {
                    guard.mark_open(opened.window_id, opened.ws);
                    info!(window_name, "opened browser window for lease");
                }
                Err(e) => {
                    guard.record_error();
                    return Err(e.into());
                }
            }
        }
        guard.last_leased_at = Some(Utc::now());

        Ok(SessionLease {
            window_name: window_name.to_string(),
            guard: Some(guard),
            _permit: permit,
        })
    }

    /// Health-check every registered window via `describe_window`, marking
    /// unreachable ones `Errored` so the next lease attempt reopens them
    /// (spec §4.2: "periodic health check; a dead window is reopened
    /// transparently on next use").
    pub async fn health_check(&self) {
        for entry in self.slots.iter() {
            let slot = Arc::clone(entry.value());
            let window_name = entry.key().clone();
            let mut guard = slot.session.lock().await;
            let Some(window_id) = guard.window_id.clone() else {
                continue;
            };
            match self.client.describe_window(&window_id).await {
                Ok(desc) if desc.status == "open" => {}
                Ok(_) | Err(_) => {
                    warn!(window_name, "health check found session unhealthy, marking for reopen");
                    guard.record_error();
                }
            }
        }
    }

    /// Force-close and unregister a window, e.g. after repeated auth
    /// failures classify an account as `Suspended` (spec §4.4/§4.8).
    pub async fn evict(&self, window_name: &str) -> Result<(), PoolError> {
        if let Some((_, slot)) = self.slots.remove(window_name) {
            let guard = slot.session.lock().await;
            if let Some(window_id) = &guard.window_id {
                let _ = self.client.close_window(window_id).await;
            }
        }
        Ok(())
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.concurrency.available_permits()
    }

    /// Snapshot counts by session state for `systemStatus` (spec §4.9:
    /// `pool:{total,idle,busy,error}`). A slot currently locked by a lease
    /// holder counts as busy without blocking on it.
    pub fn status_counts(&self) -> PoolStatusCounts {
        let mut counts = PoolStatusCounts {
            total: self.slots.len(),
            ..Default::default()
        };
        for entry in self.slots.iter() {
            match entry.value().session.try_lock() {
                Ok(guard) => match guard.state {
                    matrix_types::session::SessionState::Unopened => {}
                    matrix_types::session::SessionState::Idle => counts.idle += 1,
                    matrix_types::session::SessionState::Busy => counts.busy += 1,
                    matrix_types::session::SessionState::Error => counts.error += 1,
                },
                Err(_) => counts.busy += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStatusCounts {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
}

pub fn session_age(session: &BrowserSession) -> Option<chrono::Duration> {
    session.opened_at.map(|t| Utc::now() - t)
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
const _: fn() = || {
    _assert_send_sync::<BrowserPool>();
};

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_for_tests() -> BrowserPool {
        let client = Arc::new(BrowserControlClient::new("http://127.0.0.1:1", 1, 1).unwrap());
        BrowserPool::new(client, 2, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn leasing_unknown_window_errors() {
        let pool = pool_for_tests();
        let err = pool.lease_by_name("nope").await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownWindow(_)));
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let pool = pool_for_tests();
        pool.register("acct-1");
        pool.register("acct-1");
        assert_eq!(pool.registered_count(), 1);
    }

    #[test]
    fn session_age_is_none_before_open() {
        let session = BrowserSession::new("acct-1".to_string());
        assert!(session_age(&session).is_none());
    }
}
