//! In-memory sliding-window store.
//!
//! Timestamps per user are kept sorted for free: the clock is monotone and
//! entries are append-only. The map lock serializes the prune + count +
//! append sequence; nothing suspends while it is held.

use super::{Admission, UserRateLimitStore, retry_after};
use crate::types::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRateLimitStore for MemoryRateLimitStore {
    async fn connect(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        self.windows.lock().unwrap().clear();
        Ok(())
    }

    async fn check_and_add_request(
        &self,
        user_id: &str,
        limit: u32,
        now_ms: i64,
        window_seconds: f64,
    ) -> Result<Admission, QueueError> {
        let cutoff = now_ms - (window_seconds * 1000.0) as i64;

        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(user_id.to_string()).or_default();

        while let Some(&oldest) = window.front() {
            if oldest < cutoff {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= limit as usize {
            let oldest = window.front().copied().unwrap_or(now_ms);
            return Ok(Admission::denied(retry_after(oldest, now_ms, window_seconds)));
        }

        window.push_back(now_ms);
        Ok(Admission::granted())
    }
}
