//! # llmq
//!
//! Admission control and dispatch queue for LLM backends. Accepts concurrent
//! inference requests, enforces per-user rate limits, and balances dispatch
//! across backend deployments under per-minute budgets.
//!
//! This crate provides:
//! - **RequestQueue**: single submission entrypoint with typed failures
//! - **Scheduler**: bounded new/waiting FIFO queues with TTL
//! - **LoadBalancer**: per-deployment budgets and error quarantine
//! - **Stores**: pluggable telemetry sinks and user-rate-limit windows
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           llmq                               │
//! │  submit(req_type, user_id, payload, prefs)                   │
//! │        │                                                     │
//! │  ┌─────▼─────────────────────────────────────────────────┐   │
//! │  │ Admission                                             │   │
//! │  │ - user id, controller, preference checks              │   │
//! │  │ - per-user sliding-window rate limit                  │   │
//! │  └─────┬─────────────────────────────────────────────────┘   │
//! │  ┌─────▼─────────────────────────────────────────────────┐   │
//! │  │ Scheduler: new ─▶ (waiting)? ─▶ dispatch    TTL sweep │   │
//! │  └─────┬─────────────────────────────────────────────────┘   │
//! │  ┌─────▼─────────────────────────────────────────────────┐   │
//! │  │ Resource checker / load balancers                     │   │
//! │  │ - reqs/min + tokens/min windows, quarantine           │   │
//! │  └─────┬─────────────────────────────────────────────────┘   │
//! │        ▼                                                     │
//! │  RequestController::process(payload, reservations, record)   │
//! │        │                                                     │
//! │        ├──▶ caller (oneshot response channel)                │
//! │        └──▶ telemetry worker ──▶ CSV / SQLite sink           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A queue is wired explicitly per process: construct it with
//! [`RequestQueue::new`], start it with [`RequestQueue::initiate`], and stop
//! it with [`RequestQueue::graceful_shutdown`]. There are no hidden
//! singletons.

mod balancer;
mod config;
mod controller;
mod limiter;
pub mod metrics;
mod queue;
mod resources;
mod scheduler;
mod telemetry;
mod types;

pub use config::{
    DeploymentConfig, OutputKind, QueueConfig, SchedulerLimitConfig, UserLimitConfig,
};
pub use controller::{ControllerError, RequestController};
pub use limiter::{
    Admission, MemoryRateLimitStore, SqliteRateLimitStore, UserRateLimitStore, UserRateLimiter,
};
pub use queue::{QueueDepths, RequestQueue};
pub use telemetry::{
    CsvTelemetryStore, SqliteTelemetryStore, TelemetryRecord, TelemetryStore,
    DEFAULT_DEPLOYMENT_NAME, MISSING_VALUE, NO_ERROR, NO_USER_ID,
};
pub use types::{
    DeploymentKind, ModelPreferences, QueueError, Reservation, SubmitStatus,
};
