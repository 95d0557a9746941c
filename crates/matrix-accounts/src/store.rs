//! Account Store (spec §4.3): Postgres-backed, JSONB-as-document.
//!
//! Grounded in `riptide_persistence::adapters::PostgresRepository` — entities
//! stored as a JSONB blob plus a handful of indexed columns, with an
//! anti-corruption layer translating between SQL rows and domain types. The
//! generic `Repository<T>` there is specialized here to `Account` directly
//! since several operations (`getEligible`, `updateHealth`,
//! `incrementDaily`, `rolloverDaily`) need account-specific SQL that a fully
//! generic repository can't express.
//!
//! ```sql
//! CREATE TABLE accounts (
//!     id UUID PRIMARY KEY,
//!     window_name TEXT NOT NULL UNIQUE,
//!     data JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX idx_accounts_data ON accounts USING gin(data);
//! ```

use async_trait::async_trait;
use matrix_types::account::{Account, AccountFilter, AccountStatus, AccountUpdate, RecoveryTransition};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    NotFound(Uuid),
    #[error("account {0} is already at its daily limit")]
    DailyLimitReached(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create(&self, account: &Account) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Account, StoreError>;
    async fn update(&self, id: Uuid, update: AccountUpdate) -> Result<Account, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
    async fn list(&self, filter: AccountFilter) -> Result<Vec<Account>, StoreError>;
    async fn get_eligible(&self, count: u32, health_threshold: u8) -> Result<Vec<Account>, StoreError>;
    async fn update_health(&self, id: Uuid, success: bool) -> Result<Account, StoreError>;
    async fn increment_daily(&self, id: Uuid) -> Result<Account, StoreError>;
    async fn rollover_daily(&self) -> Result<u64, StoreError>;
    /// Persist the status/health transition the Recovery Engine decided on
    /// for an account-class or transient failure (spec §4.8).
    async fn apply_recovery_transition(&self, id: Uuid, transition: RecoveryTransition) -> Result<Account, StoreError>;
}

pub struct PostgresAccountStore {
    pool: Arc<PgPool>,
}

impl PostgresAccountStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, StoreError> {
        let data: serde_json::Value = row.try_get("data")?;
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    #[instrument(skip(self, account), fields(account_id = %account.id))]
    async fn create(&self, account: &Account) -> Result<(), StoreError> {
        let data = serde_json::to_value(account)?;
        sqlx::query(
            "INSERT INTO accounts (id, window_name, data, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(account.id)
        .bind(&account.window_name)
        .bind(data)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %id))]
    async fn get(&self, id: Uuid) -> Result<Account, StoreError> {
        let row = sqlx::query("SELECT data FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Self::row_to_account(&row)
    }

    #[instrument(skip(self, update), fields(account_id = %id))]
    async fn update(&self, id: Uuid, update: AccountUpdate) -> Result<Account, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let mut account = Self::row_to_account(&row)?;

        if let Some(status) = update.status {
            account.status = status;
        }
        if let Some(health) = update.health_score {
            account.health_score = health;
        }
        if let Some(limit) = update.daily_upload_limit {
            account.daily_upload_limit = limit;
        }
        if let Some(creds) = update.credentials_ciphertext {
            account.credentials_ciphertext = creds;
        }
        account.updated_at = chrono::Utc::now();

        let data = serde_json::to_value(&account)?;
        sqlx::query("UPDATE accounts SET data = $1, updated_at = $2 WHERE id = $3")
            .bind(data)
            .bind(account.updated_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("account updated");
        Ok(account)
    }

    #[instrument(skip(self), fields(account_id = %id))]
    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn list(&self, filter: AccountFilter) -> Result<Vec<Account>, StoreError> {
        let mut sql = "SELECT data FROM accounts WHERE TRUE".to_string();
        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND data->>'status' = '{}'", status_key(status)));
        }
        if let Some(window_name) = &filter.window_name {
            sql.push_str(&format!(" AND window_name = '{}'", window_name.replace('\'', "''")));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let rows = sqlx::query(&sql).fetch_all(self.pool.as_ref()).await?;
        rows.iter().map(Self::row_to_account).collect()
    }

    /// `status = active AND daily_upload_count < daily_upload_limit AND
    /// health_score >= threshold`, ordered by (health desc, last_upload_at
    /// asc nulls-first) — spec §4.3 `getEligible`.
    async fn get_eligible(&self, count: u32, health_threshold: u8) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM accounts \
             WHERE data->>'status' = 'active' \
               AND (data->>'daily_upload_count')::int < (data->>'daily_upload_limit')::int \
               AND (data->>'health_score')::int >= $1 \
             ORDER BY (data->>'health_score')::int DESC, data->>'last_upload_at' ASC NULLS FIRST \
             LIMIT $2",
        )
        .bind(health_threshold as i32)
        .bind(count as i64)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(Self::row_to_account).collect()
    }

    /// `+2 capped at 100` on success, `-10 floored at 0` on failure — atomic
    /// via row-level lock (spec §4.3 `updateHealth`).
    async fn update_health(&self, id: Uuid, success: bool) -> Result<Account, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let mut account = Self::row_to_account(&row)?;
        account.apply_health_update(success);

        let data = serde_json::to_value(&account)?;
        sqlx::query("UPDATE accounts SET data = $1, updated_at = $2 WHERE id = $3")
            .bind(data)
            .bind(account.updated_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(account)
    }

    /// Atomic; rejects with [`StoreError::DailyLimitReached`] if the account
    /// is already saturated (spec §4.3 `incrementDaily`).
    async fn increment_daily(&self, id: Uuid) -> Result<Account, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let mut account = Self::row_to_account(&row)?;

        if account.daily_upload_count >= account.daily_upload_limit {
            return Err(StoreError::DailyLimitReached(id));
        }
        account.daily_upload_count += 1;
        account.last_upload_at = Some(chrono::Utc::now());
        account.updated_at = chrono::Utc::now();

        let data = serde_json::to_value(&account)?;
        sqlx::query("UPDATE accounts SET data = $1, updated_at = $2 WHERE id = $3")
            .bind(data)
            .bind(account.updated_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(account)
    }

    /// Zeroes `daily_upload_count` for every account and restores
    /// `limited -> active` accounts whose only defect was quota (spec §4.3
    /// `rolloverDaily`). Returns the number of rows touched.
    async fn rollover_daily(&self) -> Result<u64, StoreError> {
        let rows = sqlx::query("SELECT id, data FROM accounts").fetch_all(self.pool.as_ref()).await?;
        let mut touched = 0u64;
        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let data: serde_json::Value = row.try_get("data")?;
            let mut account: Account = serde_json::from_value(data)?;
            account.rollover();
            let data = serde_json::to_value(&account)?;
            sqlx::query("UPDATE accounts SET data = $1, updated_at = $2 WHERE id = $3")
                .bind(data)
                .bind(account.updated_at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            touched += 1;
        }
        tx.commit().await?;
        Ok(touched)
    }

    /// Fetch-under-lock, apply [`Account::apply_recovery_transition`], and
    /// save — the same row-lock shape as `update_health` (spec §4.8: the
    /// Recovery Engine's account-class dispatch must actually persist).
    #[instrument(skip(self), fields(account_id = %id))]
    async fn apply_recovery_transition(&self, id: Uuid, transition: RecoveryTransition) -> Result<Account, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let mut account = Self::row_to_account(&row)?;
        account.apply_recovery_transition(transition);

        let data = serde_json::to_value(&account)?;
        sqlx::query("UPDATE accounts SET data = $1, updated_at = $2 WHERE id = $3")
            .bind(data)
            .bind(account.updated_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("account recovery transition applied");
        Ok(account)
    }
}

fn status_key(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "active",
        AccountStatus::Limited => "limited",
        AccountStatus::Suspended => "suspended",
        AccountStatus::NeedsAttention => "needs_attention",
        AccountStatus::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_key_matches_serde_rename() {
        assert_eq!(status_key(AccountStatus::NeedsAttention), "needs_attention");
        assert_eq!(status_key(AccountStatus::Active), "active");
    }
}
