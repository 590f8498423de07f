//! Per-request telemetry records and the pluggable sinks that persist them.
//!
//! Records are written fire-and-forget by a background worker; the row layout
//! is stable so downstream consumers can parse it bit-exactly. Missing
//! numeric values are `-1`; missing strings use fixed sentinels.

mod csv;
mod sqlite;

pub use csv::CsvTelemetryStore;
pub use sqlite::SqliteTelemetryStore;

use crate::types::QueueError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel for records admitted without a user id.
pub const NO_USER_ID: &str = "NO_USER_ID";
/// Sentinel for successful records.
pub const NO_ERROR: &str = "NO ERROR";
/// Sentinel until a controller names the deployment it used.
pub const DEFAULT_DEPLOYMENT_NAME: &str = "DEFAULT DEPLOYMENT NAME";
/// Sentinel for unpopulated instants and token counters.
pub const MISSING_VALUE: i64 = -1;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One row per request lifecycle.
///
/// Populated instants always satisfy
/// `received <= queued <= dequeued <= response_queued <= response_dequeued`.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub req_id: u64,
    pub user_id: String,
    pub req_payload: String,
    pub req_type: String,
    pub deployment_name: String,
    pub request_received_at: i64,
    pub request_queued_at: i64,
    pub request_dequeued_at: i64,
    pub response_queued_at: i64,
    pub response_dequeued_at: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub embedding_tokens: i64,
    pub error_message: String,
}

impl TelemetryRecord {
    /// Column names in row order. Shared by every store variant.
    pub const COLUMNS: [&'static str; 14] = [
        "req_id",
        "user_id",
        "req_payload",
        "req_type",
        "deployment_name",
        "request_received_at",
        "request_queued_at",
        "request_dequeued_at",
        "response_queued_at",
        "response_dequeued_at",
        "prompt_tokens",
        "completion_tokens",
        "embedding_tokens",
        "error_message",
    ];

    pub fn new(req_id: u64, user_id: &str, req_type: &str, payload: &serde_json::Value) -> Self {
        Self {
            req_id,
            user_id: if user_id.is_empty() {
                NO_USER_ID.to_string()
            } else {
                user_id.to_string()
            },
            req_payload: payload.to_string(),
            req_type: req_type.to_string(),
            deployment_name: DEFAULT_DEPLOYMENT_NAME.to_string(),
            request_received_at: now_ms(),
            request_queued_at: MISSING_VALUE,
            request_dequeued_at: MISSING_VALUE,
            response_queued_at: MISSING_VALUE,
            response_dequeued_at: MISSING_VALUE,
            prompt_tokens: MISSING_VALUE,
            completion_tokens: MISSING_VALUE,
            embedding_tokens: MISSING_VALUE,
            error_message: NO_ERROR.to_string(),
        }
    }

    pub fn set_error(&mut self, message: &str) {
        self.error_message = message.to_string();
    }

    /// Mark the record as timed out unless a real error already claimed it.
    pub fn mark_timeout(&mut self) {
        if self.error_message == NO_ERROR {
            self.error_message = "timeout".to_string();
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_message != NO_ERROR
    }
}

/// Append-only sink for telemetry records. Implementations must tolerate
/// concurrent `insert` calls.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn connect(&self) -> Result<(), QueueError>;
    async fn disconnect(&self) -> Result<(), QueueError>;
    async fn insert(&self, record: &TelemetryRecord) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_uses_sentinels() {
        let record = TelemetryRecord::new(7, "", "chat", &serde_json::json!({"q": "hi"}));
        assert_eq!(record.user_id, NO_USER_ID);
        assert_eq!(record.deployment_name, DEFAULT_DEPLOYMENT_NAME);
        assert_eq!(record.error_message, NO_ERROR);
        assert_eq!(record.request_queued_at, MISSING_VALUE);
        assert_eq!(record.prompt_tokens, MISSING_VALUE);
        assert!(record.request_received_at > 0);
        assert!(!record.is_error());
    }

    #[test]
    fn mark_timeout_does_not_overwrite_errors() {
        let mut record = TelemetryRecord::new(1, "u1", "chat", &serde_json::json!(null));
        record.set_error("upstream 500");
        record.mark_timeout();
        assert_eq!(record.error_message, "upstream 500");

        let mut clean = TelemetryRecord::new(2, "u1", "chat", &serde_json::json!(null));
        clean.mark_timeout();
        assert_eq!(clean.error_message, "timeout");
        assert!(clean.is_error());
    }
}
