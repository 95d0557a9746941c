//! History Store (spec §3 "HistoryRecord", §4.6 step 6/7): an append-only
//! outcome log, one row per upload attempt. Same JSONB-as-document shape as
//! [`crate::store::PostgresAccountStore`], since the record itself never
//! changes shape once written and an append-only table has no need for the
//! account store's `FOR UPDATE` contention handling.
//!
//! ```sql
//! CREATE TABLE upload_history (
//!     id UUID PRIMARY KEY,
//!     job_id UUID NOT NULL,
//!     account_id UUID NOT NULL,
//!     data JSONB NOT NULL,
//!     recorded_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX idx_upload_history_account ON upload_history (account_id, recorded_at DESC);
//! ```

use async_trait::async_trait;
use matrix_types::history::HistoryRecord;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record(&self, entry: HistoryRecord) -> Result<(), HistoryError>;
    async fn recent_for_account(&self, account_id: Uuid, limit: u32) -> Result<Vec<HistoryRecord>, HistoryError>;
}

pub struct PostgresHistoryStore {
    pool: Arc<PgPool>,
}

impl PostgresHistoryStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, account_id = %entry.account_id))]
    async fn record(&self, entry: HistoryRecord) -> Result<(), HistoryError> {
        let data = serde_json::to_value(&entry)?;
        sqlx::query("INSERT INTO upload_history (id, job_id, account_id, data, recorded_at) VALUES ($1, $2, $3, $4, $5)")
            .bind(entry.id)
            .bind(entry.job_id)
            .bind(entry.account_id)
            .bind(data)
            .bind(entry.recorded_at)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn recent_for_account(&self, account_id: Uuid, limit: u32) -> Result<Vec<HistoryRecord>, HistoryError> {
        let rows = sqlx::query("SELECT data FROM upload_history WHERE account_id = $1 ORDER BY recorded_at DESC LIMIT $2")
            .bind(account_id)
            .bind(limit as i64)
            .fetch_all(self.pool.as_ref())
            .await?;
        rows.iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }
}
