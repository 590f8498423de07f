//! Shared sliding-window store backed by SQLite.
//!
//! Each admitted request is one `(user_id, ts_ms)` row; the prune + count +
//! append sequence runs inside a transaction. Concurrent writers from other
//! processes can make the commit fail with a busy/serialization error, in
//! which case the whole sequence is retried from scratch.

use super::{Admission, UserRateLimitStore, retry_after};
use crate::types::QueueError;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_request_log (
    user_id TEXT NOT NULL,
    ts_ms INTEGER NOT NULL
)
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_user_request_log ON user_request_log (user_id, ts_ms)";

const MAX_ATTEMPTS: u32 = 3;

pub struct SqliteRateLimitStore {
    database_url: String,
    pool: Mutex<Option<SqlitePool>>,
}

impl SqliteRateLimitStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool: Mutex::new(None),
        }
    }

    async fn pool(&self) -> Result<SqlitePool, QueueError> {
        self.pool
            .lock()
            .await
            .clone()
            .ok_or_else(|| QueueError::RateLimitStore("store is not connected".into()))
    }

    async fn try_check_and_add(
        pool: &SqlitePool,
        user_id: &str,
        limit: u32,
        now_ms: i64,
        window_seconds: f64,
    ) -> Result<Admission, sqlx::Error> {
        let cutoff = now_ms - (window_seconds * 1000.0) as i64;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM user_request_log WHERE user_id = ? AND ts_ms < ?")
            .bind(user_id)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            "SELECT COUNT(*), MIN(ts_ms) FROM user_request_log WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        let count: i64 = row.get(0);
        let oldest: Option<i64> = row.get(1);

        if count >= limit as i64 {
            let oldest = oldest.unwrap_or(now_ms);
            tx.rollback().await?;
            return Ok(Admission::denied(retry_after(oldest, now_ms, window_seconds)));
        }

        sqlx::query("INSERT INTO user_request_log (user_id, ts_ms) VALUES (?, ?)")
            .bind(user_id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Admission::granted())
    }
}

#[async_trait]
impl UserRateLimitStore for SqliteRateLimitStore {
    async fn connect(&self) -> Result<(), QueueError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await
            .map_err(|e| QueueError::RateLimitStore(e.to_string()))?;

        for statement in [CREATE_TABLE, CREATE_INDEX] {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| QueueError::RateLimitStore(e.to_string()))?;
        }

        debug!(url = %self.database_url, "Rate limit database ready");
        *self.pool.lock().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn check_and_add_request(
        &self,
        user_id: &str,
        limit: u32,
        now_ms: i64,
        window_seconds: f64,
    ) -> Result<Admission, QueueError> {
        let pool = self.pool().await?;

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match Self::try_check_and_add(&pool, user_id, limit, now_ms, window_seconds).await {
                Ok(admission) => return Ok(admission),
                Err(e) => {
                    warn!(user_id = %user_id, attempt, error = %e, "Rate limit transaction failed");
                    last_error = Some(e);
                }
            }
        }

        Err(QueueError::RateLimitStore(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "retries exhausted".into()),
        ))
    }
}
