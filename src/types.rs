//! Shared domain types used across the codebase.

use serde::{Deserialize, Serialize};

/// Errors surfaced to callers of [`RequestQueue::submit`](crate::RequestQueue::submit)
/// and the lifecycle methods.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("user id is required")]
    UserIdMissing,

    #[error("user rate limit exceeded, retry after {retry_after:.1}s")]
    RateLimited { retry_after: f64 },

    #[error("scheduler queue is full")]
    QueueFull,

    #[error("request timed out in queue")]
    Timeout,

    #[error("no deployment can satisfy the request: {0}")]
    ResourceUnavailable(String),

    #[error("no controller registered for request type: {0}")]
    UnknownRequestType(String),

    #[error("backend error: {0}")]
    Llm(String),

    #[error("rate limit store error: {0}")]
    RateLimitStore(String),

    #[error("telemetry store error: {0}")]
    TelemetryStore(String),

    #[error("queue is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Coarse status for callers that only branch on the outcome class.
    pub fn status(&self) -> SubmitStatus {
        match self {
            QueueError::UserIdMissing => SubmitStatus::MissingUserId,
            QueueError::RateLimited { .. } => SubmitStatus::RateLimited,
            QueueError::QueueFull => SubmitStatus::QueueFull,
            QueueError::Timeout => SubmitStatus::Timeout,
            QueueError::Llm(_) => SubmitStatus::LlmError,
            QueueError::ResourceUnavailable(_)
            | QueueError::UnknownRequestType(_)
            | QueueError::RateLimitStore(_)
            | QueueError::TelemetryStore(_)
            | QueueError::ShuttingDown
            | QueueError::Internal(_) => SubmitStatus::ResourceError,
        }
    }
}

/// Outcome classes for a submission, one per distinguishable failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Ok,
    RateLimited,
    QueueFull,
    Timeout,
    MissingUserId,
    LlmError,
    ResourceError,
}

/// Which balancer class a deployment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Llm,
    Embedding,
}

/// A capacity unit taken against one deployment's per-minute budget.
/// Handed to the controller so it knows which deployment(s) to call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub kind: DeploymentKind,
    pub deployment_id: String,
}

/// Model requirements attached to a submission.
///
/// At least one of `require_llm` / `require_embedding` must be set or the
/// submission fails admission. When a specific deployment id is named,
/// selection is restricted to that deployment; the request is parked until
/// it frees rather than silently reassigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPreferences {
    #[serde(default = "default_true")]
    pub require_llm: bool,

    #[serde(default)]
    pub require_embedding: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_llm_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_embedding_id: Option<String>,

    /// Expected LLM calls for this request. May be fractional; capacity is
    /// always reserved in whole units and token accounting trues up later.
    #[serde(default = "default_one_call")]
    pub llm_calls_per_req: f64,

    /// Expected embedding calls for this request.
    #[serde(default)]
    pub embedding_calls_per_req: f64,
}

impl Default for ModelPreferences {
    fn default() -> Self {
        Self {
            require_llm: true,
            require_embedding: false,
            specific_llm_id: None,
            specific_embedding_id: None,
            llm_calls_per_req: 1.0,
            embedding_calls_per_req: 0.0,
        }
    }
}

impl ModelPreferences {
    /// Request-capacity units to reserve on the LLM balancer.
    pub fn llm_units(&self) -> u64 {
        (self.llm_calls_per_req.ceil() as u64).max(1)
    }

    /// Request-capacity units to reserve on the embedding balancer.
    pub fn embedding_units(&self) -> u64 {
        (self.embedding_calls_per_req.ceil() as u64).max(1)
    }
}

fn default_true() -> bool {
    true
}

fn default_one_call() -> f64 {
    1.0
}
