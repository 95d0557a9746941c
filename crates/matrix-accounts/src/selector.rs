//! Account Selector (spec §4.4).
//!
//! Stateless over the store; the only state this type owns is the
//! in-memory lease set serializing concurrent selection within one
//! coordinator process (spec §4.4 step 3: "single-coordinator deployments
//! rely on the in-memory set"). Grounded structurally in the teacher's
//! `dashmap`-backed registries (e.g. `riptide_workers::worker::WorkerPool`'s
//! worker map) — a concurrent map guards exclusive access without a
//! process-wide lock.

use crate::store::{AccountStore, StoreError};
use dashmap::DashMap;
use matrix_types::account::{Account, RecoveryTransition};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("pinned account {0} is unavailable")]
    PinUnavailable(Uuid),
    #[error("no eligible account found")]
    NoAccount,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Number of `getEligible` candidates to try before giving up (spec §4.4
/// step 2: "fail after N candidates or exhaustion").
const MAX_CANDIDATES: u32 = 10;

pub struct AccountSelector {
    store: Arc<dyn AccountStore>,
    /// account_id -> job_id currently holding the lease.
    leases: DashMap<Uuid, Uuid>,
    health_threshold: u8,
}

impl AccountSelector {
    pub fn new(store: Arc<dyn AccountStore>, health_threshold: u8) -> Self {
        Self {
            store,
            leases: DashMap::new(),
            health_threshold,
        }
    }

    pub fn leased_count(&self) -> usize {
        self.leases.len()
    }

    pub fn is_leased(&self, account_id: Uuid) -> bool {
        self.leases.contains_key(&account_id)
    }

    /// Reserve `account_id` for `job_id` if it is not already leased. This
    /// is the atomic in-memory reservation primitive both pinned and
    /// unpinned selection build on.
    fn try_reserve(&self, account_id: Uuid, job_id: Uuid) -> bool {
        self.leases.entry(account_id).or_insert(job_id);
        self.leases.get(&account_id).map(|v| *v == job_id).unwrap_or(false)
    }

    pub async fn lease(&self, job_id: Uuid, pinned_account_id: Option<Uuid>) -> Result<Account, SelectorError> {
        if let Some(account_id) = pinned_account_id {
            let account = self.store.get(account_id).await?;
            if !account.is_eligible(self.health_threshold) || !self.try_reserve(account_id, job_id) {
                return Err(SelectorError::PinUnavailable(account_id));
            }
            debug!(%job_id, %account_id, "leased pinned account");
            return Ok(account);
        }

        let candidates = self.store.get_eligible(MAX_CANDIDATES, self.health_threshold).await?;
        for account in candidates {
            if self.try_reserve(account.id, job_id) {
                debug!(%job_id, account_id = %account.id, "leased account");
                return Ok(account);
            }
            warn!(account_id = %account.id, "lost reservation race, trying next candidate");
        }
        Err(SelectorError::NoAccount)
    }

    /// Release the lease, applying the health-score update and — only on
    /// success — the daily counter increment (spec §4.4 `release`).
    pub async fn release(&self, account_id: Uuid, job_id: Uuid, success: bool) -> Result<(), SelectorError> {
        if let Some((_, holder)) = self.leases.remove(&account_id) {
            if holder != job_id {
                warn!(%account_id, %job_id, held_by = %holder, "release called by non-holder job");
            }
        }

        self.store.update_health(account_id, success).await?;
        if success {
            self.store.increment_daily(account_id).await?;
        }
        Ok(())
    }

    /// Drop a lease without touching account state — used when a job is
    /// released back to `queued` before any side effect occurred (spec §4.6
    /// step 2: "do not count as attempt").
    pub fn release_uncounted(&self, account_id: Uuid) {
        self.leases.remove(&account_id);
    }

    /// Persist an account-class or transient failure's status/health
    /// transition, independent of lease state (spec §4.8 `handleAccount`).
    pub async fn apply_recovery_transition(&self, account_id: Uuid, transition: RecoveryTransition) -> Result<Account, SelectorError> {
        Ok(self.store.apply_recovery_transition(account_id, transition).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use matrix_types::account::{AccountFilter, AccountUpdate};
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
            self.accounts
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.id == id)
                .cloned()
                .ok_or(StoreError::NotFound(id))
        }
        async fn update(&self, _id: Uuid, _update: AccountUpdate) -> Result<Account, StoreError> {
            unimplemented!()
        }
        async fn delete(&self, _id: Uuid) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn list(&self, _filter: AccountFilter) -> Result<Vec<Account>, StoreError> {
            Ok(self.accounts.lock().unwrap().clone())
        }
        async fn get_eligible(&self, count: u32, threshold: u8) -> Result<Vec<Account>, StoreError> {
            let mut eligible: Vec<Account> = self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.is_eligible(threshold))
                .cloned()
                .collect();
            eligible.truncate(count as usize);
            Ok(eligible)
        }
        async fn update_health(&self, id: Uuid, success: bool) -> Result<Account, StoreError> {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts.iter_mut().find(|a| a.id == id).ok_or(StoreError::NotFound(id))?;
            account.apply_health_update(success);
            Ok(account.clone())
        }
        async fn increment_daily(&self, id: Uuid) -> Result<Account, StoreError> {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts.iter_mut().find(|a| a.id == id).ok_or(StoreError::NotFound(id))?;
            if account.daily_upload_count >= account.daily_upload_limit {
                return Err(StoreError::DailyLimitReached(id));
            }
            account.daily_upload_count += 1;
            Ok(account.clone())
        }
        async fn rollover_daily(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn apply_recovery_transition(&self, id: Uuid, transition: RecoveryTransition) -> Result<Account, StoreError> {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts.iter_mut().find(|a| a.id == id).ok_or(StoreError::NotFound(id))?;
            account.apply_recovery_transition(transition);
            Ok(account.clone())
        }
    }

    fn selector_with(accounts: Vec<Account>) -> AccountSelector {
        let store = Arc::new(FakeStore {
            accounts: StdMutex::new(accounts),
        });
        AccountSelector::new(store, 50)
    }

    #[tokio::test]
    async fn leases_first_eligible_candidate() {
        let account = Account::new("u@example.com", "win-1", vec![]);
        let account_id = account.id;
        let selector = selector_with(vec![account]);

        let job_id = Uuid::new_v4();
        let leased = selector.lease(job_id, None).await.unwrap();
        assert_eq!(leased.id, account_id);
        assert!(selector.is_leased(account_id));
    }

    #[tokio::test]
    async fn second_job_falls_through_leased_account() {
        let account = Account::new("u@example.com", "win-1", vec![]);
        let selector = selector_with(vec![account]);

        let job1 = Uuid::new_v4();
        selector.lease(job1, None).await.unwrap();

        let job2 = Uuid::new_v4();
        let err = selector.lease(job2, None).await.unwrap_err();
        assert!(matches!(err, SelectorError::NoAccount));
    }

    #[tokio::test]
    async fn pin_unavailable_when_not_eligible() {
        let mut account = Account::new("u@example.com", "win-1", vec![]);
        account.health_score = 10;
        let account_id = account.id;
        let selector = selector_with(vec![account]);

        let err = selector.lease(Uuid::new_v4(), Some(account_id)).await.unwrap_err();
        assert!(matches!(err, SelectorError::PinUnavailable(_)));
    }

    #[tokio::test]
    async fn release_frees_the_lease() {
        let account = Account::new("u@example.com", "win-1", vec![]);
        let account_id = account.id;
        let selector = selector_with(vec![account]);

        let job_id = Uuid::new_v4();
        selector.lease(job_id, None).await.unwrap();
        selector.release(account_id, job_id, true).await.unwrap();
        assert!(!selector.is_leased(account_id));
    }
}
