//! Two-queue FIFO scheduler with bounded capacity and per-request TTL.
//!
//! A request sits in `new` from admission until its first dispatch attempt.
//! If resources are unavailable at that point it moves to `waiting`, which
//! the dispatch loop always prefers. The capacity budget covers both queues
//! plus in-flight requests, so re-queueing never admits beyond the cap.

use crate::telemetry::TelemetryRecord;
use crate::types::ModelPreferences;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// A request owned by the scheduler while enqueued, then by the dispatch
/// loop. `req_id` is unique among live requests and totally orders them.
#[derive(Debug)]
pub struct ScheduledRequest {
    pub req_id: u64,
    pub req_type: String,
    pub payload: serde_json::Value,
    pub preferences: ModelPreferences,
    pub telemetry: TelemetryRecord,
    pub deadline: Instant,
}

#[derive(Default)]
struct State {
    new: VecDeque<ScheduledRequest>,
    waiting: VecDeque<ScheduledRequest>,
    in_flight: HashSet<u64>,
}

impl State {
    fn live_count(&self) -> usize {
        self.new.len() + self.waiting.len() + self.in_flight.len()
    }
}

pub struct Scheduler {
    max_queue_size: usize,
    state: Mutex<State>,
}

impl Scheduler {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            state: Mutex::new(State::default()),
        }
    }

    /// Enqueue a fresh admission. Returns the request back when the live
    /// count (both queues plus in-flight) is already at capacity.
    pub fn offer_new(&self, request: ScheduledRequest) -> Result<(), ScheduledRequest> {
        let mut state = self.state.lock().unwrap();
        if state.live_count() >= self.max_queue_size {
            return Err(request);
        }
        state.new.push_back(request);
        Ok(())
    }

    /// Park a dequeued request. It was already counted, so this never fails.
    pub fn offer_waiting(&self, request: ScheduledRequest) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&request.req_id);
        state.waiting.push_back(request);
    }

    /// Put a just-taken waiting request back at the head, keeping its spot.
    pub fn restore_waiting(&self, request: ScheduledRequest) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&request.req_id);
        state.waiting.push_front(request);
    }

    /// Pop the new-queue head for dispatch. The id stays counted as
    /// in-flight until `finish`, `offer_waiting`, or `restore_waiting`.
    pub fn pop_new(&self) -> Option<ScheduledRequest> {
        let mut state = self.state.lock().unwrap();
        let request = state.new.pop_front()?;
        state.in_flight.insert(request.req_id);
        Some(request)
    }

    /// Take a specific waiting request for dispatch.
    pub fn take_waiting(&self, req_id: u64) -> Option<ScheduledRequest> {
        let mut state = self.state.lock().unwrap();
        let idx = state.waiting.iter().position(|r| r.req_id == req_id)?;
        let request = state.waiting.remove(idx)?;
        state.in_flight.insert(request.req_id);
        Some(request)
    }

    /// Preferences of the new-queue head plus every waiting request in FIFO
    /// order, for the dispatch loop's serve-or-block decision.
    pub fn peek_heads(&self) -> (Option<ModelPreferences>, Vec<(u64, ModelPreferences)>) {
        let state = self.state.lock().unwrap();
        let new_head = state.new.front().map(|r| r.preferences.clone());
        let waiting = state
            .waiting
            .iter()
            .map(|r| (r.req_id, r.preferences.clone()))
            .collect();
        (new_head, waiting)
    }

    /// Remove a queued request by id. Idempotent; in-flight requests are not
    /// touched.
    pub fn cancel(&self, req_id: u64) -> Option<ScheduledRequest> {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.new.iter().position(|r| r.req_id == req_id) {
            return state.new.remove(idx);
        }
        if let Some(idx) = state.waiting.iter().position(|r| r.req_id == req_id) {
            return state.waiting.remove(idx);
        }
        None
    }

    /// Mark an in-flight request as done, freeing its capacity slot.
    pub fn finish(&self, req_id: u64) -> bool {
        self.state.lock().unwrap().in_flight.remove(&req_id)
    }

    /// Remove and return every queued request past its deadline.
    pub fn take_expired(&self, now: Instant) -> Vec<ScheduledRequest> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut expired = Vec::new();
        for queue in [&mut state.new, &mut state.waiting] {
            let mut kept = VecDeque::with_capacity(queue.len());
            for request in queue.drain(..) {
                if now > request.deadline {
                    expired.push(request);
                } else {
                    kept.push_back(request);
                }
            }
            *queue = kept;
        }
        expired
    }

    /// Empty both queues, e.g. to fail leftovers at shutdown.
    pub fn drain_queued(&self) -> Vec<ScheduledRequest> {
        let mut state = self.state.lock().unwrap();
        let mut drained: Vec<ScheduledRequest> = state.new.drain(..).collect();
        drained.extend(state.waiting.drain(..));
        drained
    }

    pub fn has_work(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.new.is_empty() || !state.waiting.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live_count()
    }

    pub fn is_idle(&self) -> bool {
        self.live_count() == 0
    }

    /// `(new, waiting, in_flight)` depths for introspection and metrics.
    pub fn depths(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.new.len(), state.waiting.len(), state.in_flight.len())
    }
}
