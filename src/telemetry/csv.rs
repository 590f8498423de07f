//! Append-only delimited-file telemetry sink.
//!
//! One record per row, header written when the file is first created. Writes
//! are serialized behind a mutex so concurrent inserts never interleave rows.

use super::{TelemetryRecord, TelemetryStore};
use crate::types::QueueError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub struct CsvTelemetryStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl CsvTelemetryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    fn format_row(record: &TelemetryRecord) -> String {
        let fields = [
            record.req_id.to_string(),
            escape(&record.user_id),
            escape(&record.req_payload),
            escape(&record.req_type),
            escape(&record.deployment_name),
            record.request_received_at.to_string(),
            record.request_queued_at.to_string(),
            record.request_dequeued_at.to_string(),
            record.response_queued_at.to_string(),
            record.response_dequeued_at.to_string(),
            record.prompt_tokens.to_string(),
            record.completion_tokens.to_string(),
            record.embedding_tokens.to_string(),
            escape(&record.error_message),
        ];
        let mut row = fields.join(",");
        row.push('\n');
        row
    }
}

/// Quote a field if it contains the delimiter, a quote, or a newline.
fn escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[async_trait]
impl TelemetryStore for CsvTelemetryStore {
    async fn connect(&self) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| QueueError::TelemetryStore(e.to_string()))?
            .len();
        if len == 0 {
            let mut header = TelemetryRecord::COLUMNS.join(",");
            header.push('\n');
            file.write_all(header.as_bytes())
                .await
                .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;
        }

        debug!(path = %self.path.display(), "Telemetry file opened");
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush()
                .await
                .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;
        }
        Ok(())
    }

    async fn insert(&self, record: &TelemetryRecord) -> Result<(), QueueError> {
        let row = Self::format_row(record);
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| QueueError::TelemetryStore("store is not connected".into()))?;
        file.write_all(row.as_bytes())
            .await
            .map_err(|e| QueueError::TelemetryStore(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| QueueError::TelemetryStore(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(req_id: u64) -> TelemetryRecord {
        let mut record =
            TelemetryRecord::new(req_id, "u1", "chat", &serde_json::json!({"q": "a,b"}));
        record.prompt_tokens = 10;
        record.completion_tokens = 5;
        record
    }

    #[tokio::test]
    async fn writes_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.csv");
        let store = CsvTelemetryStore::new(&path);

        store.connect().await.unwrap();
        store.insert(&sample_record(1)).await.unwrap();
        store.insert(&sample_record(2)).await.unwrap();
        store.disconnect().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("req_id,user_id,req_payload,"));
        assert!(lines[1].starts_with("1,u1,"));
        assert!(lines[2].starts_with("2,u1,"));
    }

    #[tokio::test]
    async fn reconnect_does_not_duplicate_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.csv");

        let store = CsvTelemetryStore::new(&path);
        store.connect().await.unwrap();
        store.insert(&sample_record(1)).await.unwrap();
        store.disconnect().await.unwrap();

        let store = CsvTelemetryStore::new(&path);
        store.connect().await.unwrap();
        store.insert(&sample_record(2)).await.unwrap();
        store.disconnect().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("req_id,user_id").count(), 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn insert_before_connect_fails() {
        let store = CsvTelemetryStore::new("/tmp/never-created.csv");
        let err = store.insert(&sample_record(1)).await.unwrap_err();
        assert!(matches!(err, QueueError::TelemetryStore(_)));
    }

    #[test]
    fn escapes_embedded_delimiters() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
