//! Account record (spec §3 "Account").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account lifecycle status. Only `Active` is eligible for selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Limited,
    Suspended,
    NeedsAttention,
    Error,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Default daily upload limit applied to new accounts (spec §6 `account.daily_limit_default`).
pub const DEFAULT_DAILY_LIMIT: u32 = 2;

/// Health score floor below which an account is no longer eligible (spec §6 `account.health_threshold`).
pub const DEFAULT_HEALTH_THRESHOLD: u8 = 50;

/// A platform login bound 1:1 to a browser-profile window name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub login: String,
    /// Symmetric-encrypted credential blob. Never logged, never serialized
    /// into tracing fields.
    pub credentials_ciphertext: Vec<u8>,
    /// Stable 1:1 binding to a browser-profile window name.
    pub window_name: String,
    pub status: AccountStatus,
    /// 0-100 quality signal driving selection (spec §3 "Health score").
    pub health_score: u8,
    pub daily_upload_count: u32,
    pub daily_upload_limit: u32,
    pub last_upload_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account record with defaults (status `active`, health 100).
    pub fn new(login: impl Into<String>, window_name: impl Into<String>, credentials_ciphertext: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            login: login.into(),
            credentials_ciphertext,
            window_name: window_name.into(),
            status: AccountStatus::Active,
            health_score: 100,
            daily_upload_count: 0,
            daily_upload_limit: DEFAULT_DAILY_LIMIT,
            last_upload_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this account currently satisfies selection policy (spec §4.3 `getEligible`).
    pub fn is_eligible(&self, health_threshold: u8) -> bool {
        self.status == AccountStatus::Active
            && self.daily_upload_count < self.daily_upload_limit
            && self.health_score >= health_threshold
    }

    /// Apply the health-score update rule from spec §4.3 `updateHealth`.
    pub fn apply_health_update(&mut self, success: bool) {
        if success {
            self.health_score = self.health_score.saturating_add(2).min(100);
        } else {
            self.health_score = self.health_score.saturating_sub(10);
        }
        self.updated_at = Utc::now();
    }

    /// Apply a rate-limit penalty (spec §4.8: health -20, status -> limited).
    pub fn apply_rate_limit_penalty(&mut self) {
        self.health_score = self.health_score.saturating_sub(20);
        self.status = AccountStatus::Limited;
        self.updated_at = Utc::now();
    }

    /// Apply a transient-failure penalty (spec §4.8: health -5).
    pub fn apply_transient_penalty(&mut self) {
        self.health_score = self.health_score.saturating_sub(5);
        self.updated_at = Utc::now();
    }

    /// Apply the status/health transition the Recovery Engine decided on
    /// for a given error class (spec §4.8 `handleAccount`/`handleTask`).
    pub fn apply_recovery_transition(&mut self, transition: RecoveryTransition) {
        match transition {
            RecoveryTransition::RateLimited => self.apply_rate_limit_penalty(),
            RecoveryTransition::Suspended => {
                self.status = AccountStatus::Suspended;
                self.updated_at = Utc::now();
            }
            RecoveryTransition::NeedsAttention => {
                self.status = AccountStatus::NeedsAttention;
                self.updated_at = Utc::now();
            }
            RecoveryTransition::Transient => self.apply_transient_penalty(),
        }
    }

    /// Daily rollover: zero the counter and restore `limited -> active` accounts
    /// whose only defect was quota (spec §4.3 `rolloverDaily`).
    pub fn rollover(&mut self) {
        self.daily_upload_count = 0;
        if self.status == AccountStatus::Limited {
            self.status = AccountStatus::Active;
        }
        self.updated_at = Utc::now();
    }
}

/// Outcome the Recovery Engine dispatches an account-touching failure to
/// (spec §4.8): which status/health change a persisted store should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTransition {
    RateLimited,
    Suspended,
    NeedsAttention,
    Transient,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub status: Option<AccountStatus>,
    pub health_score: Option<u8>,
    pub daily_upload_limit: Option<u32>,
    pub credentials_ciphertext: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    pub status: Option<AccountStatus>,
    pub window_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_defaults() {
        let a = Account::new("user@example.com", "profile-1", vec![1, 2, 3]);
        assert_eq!(a.status, AccountStatus::Active);
        assert_eq!(a.health_score, 100);
        assert_eq!(a.daily_upload_limit, DEFAULT_DAILY_LIMIT);
        assert!(a.is_eligible(DEFAULT_HEALTH_THRESHOLD));
    }

    #[test]
    fn health_update_caps_at_bounds() {
        let mut a = Account::new("u", "w", vec![]);
        for _ in 0..5 {
            a.apply_health_update(true);
        }
        assert_eq!(a.health_score, 100);

        a.health_score = 5;
        a.apply_health_update(false);
        assert_eq!(a.health_score, 0);
    }

    #[test]
    fn daily_limit_makes_account_ineligible() {
        let mut a = Account::new("u", "w", vec![]);
        a.daily_upload_count = a.daily_upload_limit;
        assert!(!a.is_eligible(DEFAULT_HEALTH_THRESHOLD));
    }

    #[test]
    fn rollover_resets_count_and_restores_limited() {
        let mut a = Account::new("u", "w", vec![]);
        a.daily_upload_count = 2;
        a.status = AccountStatus::Limited;
        a.rollover();
        assert_eq!(a.daily_upload_count, 0);
        assert_eq!(a.status, AccountStatus::Active);
    }

    #[test]
    fn rollover_does_not_touch_suspended() {
        let mut a = Account::new("u", "w", vec![]);
        a.status = AccountStatus::Suspended;
        a.rollover();
        assert_eq!(a.status, AccountStatus::Suspended);
    }

    #[test]
    fn recovery_transition_rate_limited_matches_penalty() {
        let mut a = Account::new("u", "w", vec![]);
        a.apply_recovery_transition(RecoveryTransition::RateLimited);
        assert_eq!(a.status, AccountStatus::Limited);
        assert_eq!(a.health_score, 80);
    }

    #[test]
    fn recovery_transition_auth_marks_needs_attention() {
        let mut a = Account::new("u", "w", vec![]);
        a.apply_recovery_transition(RecoveryTransition::NeedsAttention);
        assert_eq!(a.status, AccountStatus::NeedsAttention);
        assert_eq!(a.health_score, 100);
    }
}
