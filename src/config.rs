//! Configuration for the request queue.

use crate::types::DeploymentKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backend deployments to balance across. Deployments with
    /// `output_kind = "embeddings"` form the embedding pool; the rest form
    /// the LLM pool.
    pub llm_deployments: Vec<DeploymentConfig>,

    /// Per-user admission limits
    #[serde(default)]
    pub user_limits: UserLimitConfig,

    /// Scheduler capacity and request TTL
    #[serde(default)]
    pub scheduler_limits: SchedulerLimitConfig,
}

/// Configuration for a single backend deployment.
///
/// ```json
/// {
///   "id": "gpt4-eastus",
///   "output_kind": "chat",
///   "reqs_per_min": 60,
///   "tokens_per_min": 60000,
///   "error_backoff_seconds": 30
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Unique deployment id, referenced by specific-model preferences
    pub id: String,

    /// What the deployment produces
    pub output_kind: OutputKind,

    /// Requests-per-minute budget
    pub reqs_per_min: u64,

    /// Tokens-per-minute budget
    pub tokens_per_min: u64,

    /// How long the deployment is quarantined after a backend error
    #[serde(default = "default_error_backoff")]
    pub error_backoff_seconds: f64,

    /// Provider-specific fields (endpoint, api version, key env var, ...)
    /// passed through to the request controller untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Output kind of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Completion,
    Chat,
    Embeddings,
}

impl OutputKind {
    /// Which balancer pool this output kind belongs to.
    pub fn deployment_kind(&self) -> DeploymentKind {
        match self {
            OutputKind::Completion | OutputKind::Chat => DeploymentKind::Llm,
            OutputKind::Embeddings => DeploymentKind::Embedding,
        }
    }
}

/// Per-user sliding-window limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests_in_window: u32,

    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,
}

impl Default for UserLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_in_window: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

/// Scheduler capacity and TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerLimitConfig {
    /// How long a request may live from admission to response
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: f64,

    /// Maximum live requests (queued + waiting + in flight)
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for SchedulerLimitConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

fn default_error_backoff() -> f64 {
    30.0
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_seconds() -> f64 {
    60.0
}

fn default_ttl_seconds() -> f64 {
    300.0
}

fn default_max_queue_size() -> usize {
    1000
}

impl QueueConfig {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate configuration, warning about common misconfigurations.
    pub fn validate(&self) {
        use tracing::warn;

        if self.llm_deployments.is_empty() {
            warn!("No deployments configured; every submission will be rejected");
        }

        let mut seen = std::collections::HashSet::new();
        for deployment in &self.llm_deployments {
            if !seen.insert(deployment.id.as_str()) {
                warn!(
                    id = %deployment.id,
                    "Duplicate deployment id; only budget tracking for the first entry applies"
                );
            }
            if deployment.reqs_per_min == 0 {
                warn!(
                    id = %deployment.id,
                    "Deployment has a zero request budget and can never be selected"
                );
            }
        }

        if self.scheduler_limits.ttl_seconds <= 0.0 {
            warn!("Non-positive scheduler TTL; requests will expire immediately");
        }
        if self.user_limits.window_seconds <= 0.0 {
            warn!("Non-positive rate limit window; user limits are effectively disabled");
        }
    }
}
