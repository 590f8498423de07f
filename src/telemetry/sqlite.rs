//! Relational telemetry sink backed by SQLite.
//!
//! The table is created on connect if absent; inserts are parameterized.

use super::{TelemetryRecord, TelemetryStore};
use crate::types::QueueError;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::debug;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS llm_telemetry (
    req_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    req_payload TEXT NOT NULL,
    req_type TEXT NOT NULL,
    deployment_name TEXT,
    request_received_at INTEGER,
    request_queued_at INTEGER,
    request_dequeued_at INTEGER,
    response_queued_at INTEGER,
    response_dequeued_at INTEGER,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    embedding_tokens INTEGER,
    error_message TEXT
)
"#;

const INSERT_ROW: &str = r#"
INSERT INTO llm_telemetry (
    req_id, user_id, req_payload, req_type, deployment_name,
    request_received_at, request_queued_at, request_dequeued_at,
    response_queued_at, response_dequeued_at,
    prompt_tokens, completion_tokens, embedding_tokens, error_message
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

pub struct SqliteTelemetryStore {
    database_url: String,
    pool: Mutex<Option<SqlitePool>>,
}

impl SqliteTelemetryStore {
    /// `database_url` in sqlx form, e.g. `sqlite://telemetry.db?mode=rwc`
    /// or `sqlite::memory:`.
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
            .ok_or_else(|| QueueError::TelemetryStore("store is not connected".into()))
    }
}

#[async_trait]
impl TelemetryStore for SqliteTelemetryStore {
    async fn connect(&self) -> Result<(), QueueError> {
        // A single connection keeps the writer serial and makes in-memory
        // databases behave (each extra connection would get its own DB).
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await
            .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;

        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;

        debug!(url = %self.database_url, "Telemetry database ready");
        *self.pool.lock().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn insert(&self, record: &TelemetryRecord) -> Result<(), QueueError> {
        let pool = self.pool().await?;
        sqlx::query(INSERT_ROW)
            .bind(record.req_id.to_string())
            .bind(&record.user_id)
            .bind(&record.req_payload)
            .bind(&record.req_type)
            .bind(&record.deployment_name)
            .bind(record.request_received_at)
            .bind(record.request_queued_at)
            .bind(record.request_dequeued_at)
            .bind(record.response_queued_at)
            .bind(record.response_dequeued_at)
            .bind(record.prompt_tokens)
            .bind(record.completion_tokens)
            .bind(record.embedding_tokens)
            .bind(&record.error_message)
            .execute(&pool)
            .await
            .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn creates_table_and_inserts_rows() {
        let store = SqliteTelemetryStore::new("sqlite::memory:");
        store.connect().await.unwrap();

        let mut record = TelemetryRecord::new(42, "u1", "chat", &serde_json::json!({"q": "hi"}));
        record.deployment_name = "gpt4".to_string();
        record.prompt_tokens = 10;
        record.completion_tokens = 5;
        store.insert(&record).await.unwrap();

        let pool = store.pool().await.unwrap();
        let row = sqlx::query("SELECT req_id, user_id, prompt_tokens, embedding_tokens, error_message FROM llm_telemetry")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>(0), "42");
        assert_eq!(row.get::<String, _>(1), "u1");
        assert_eq!(row.get::<i64, _>(2), 10);
        assert_eq!(row.get::<i64, _>(3), -1);
        assert_eq!(row.get::<String, _>(4), super::super::NO_ERROR);

        store.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn insert_before_connect_fails() {
        let store = SqliteTelemetryStore::new("sqlite::memory:");
        let record = TelemetryRecord::new(1, "u1", "chat", &serde_json::json!(null));
        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, QueueError::TelemetryStore(_)));
    }

    #[tokio::test]
    async fn connect_is_idempotent_on_schema() {
        let store = SqliteTelemetryStore::new("sqlite::memory:");
        store.connect().await.unwrap();
        // Re-running the DDL must not fail.
        let pool = store.pool().await.unwrap();
        sqlx::query(CREATE_TABLE).execute(&pool).await.unwrap();
    }
}
