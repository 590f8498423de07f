//! Per-user sliding-window admission limits.
//!
//! The store adapter owns the window state; [`UserRateLimiter`] binds a store
//! to the static policy from config. The prune + count + append sequence is
//! atomic per user in every store variant.

mod memory;
mod sqlite;

pub use memory::MemoryRateLimitStore;
pub use sqlite::SqliteRateLimitStore;

use crate::telemetry::now_ms;
use crate::types::QueueError;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub admitted: bool,
    /// Seconds until the oldest in-window request ages out. Only set on
    /// rejection.
    pub retry_after_seconds: Option<f64>,
}

impl Admission {
    pub fn granted() -> Self {
        Self {
            admitted: true,
            retry_after_seconds: None,
        }
    }

    pub fn denied(retry_after_seconds: f64) -> Self {
        Self {
            admitted: false,
            retry_after_seconds: Some(retry_after_seconds.max(0.0)),
        }
    }
}

/// Thread-safe per-user sliding-window counter.
#[async_trait]
pub trait UserRateLimitStore: Send + Sync {
    async fn connect(&self) -> Result<(), QueueError>;
    async fn disconnect(&self) -> Result<(), QueueError>;

    /// Prune entries older than the window, then either admit (appending
    /// `now_ms`) or reject with a retry hint derived from the oldest entry.
    async fn check_and_add_request(
        &self,
        user_id: &str,
        limit: u32,
        now_ms: i64,
        window_seconds: f64,
    ) -> Result<Admission, QueueError>;
}

/// Retry hint: how long until the oldest in-window entry leaves the window.
pub(crate) fn retry_after(oldest_ms: i64, now_ms: i64, window_seconds: f64) -> f64 {
    window_seconds - (now_ms - oldest_ms) as f64 / 1000.0
}

/// Facade combining a store with the static `(max_requests, window)` policy.
pub struct UserRateLimiter {
    store: Arc<dyn UserRateLimitStore>,
    max_requests: u32,
    window_seconds: f64,
}

impl UserRateLimiter {
    pub fn new(store: Arc<dyn UserRateLimitStore>, max_requests: u32, window_seconds: f64) -> Self {
        Self {
            store,
            max_requests,
            window_seconds,
        }
    }

    pub async fn check(&self, user_id: &str) -> Result<Admission, QueueError> {
        self.store
            .check_and_add_request(user_id, self.max_requests, now_ms(), self.window_seconds)
            .await
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }
}
