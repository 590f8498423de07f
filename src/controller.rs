//! Request controller contract.
//!
//! Controllers own the actual backend calls. The queue hands them the
//! payload, the deployments reserved for the request, and the telemetry
//! record; controllers fill in the deployment name and token counts before
//! returning. Any controller failure is classified as a backend fault.

use crate::telemetry::TelemetryRecord;
use crate::types::Reservation;
use async_trait::async_trait;

/// Errors raised by a request controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Upstream deployment fault; quarantines the deployment(s).
    #[error("{0}")]
    Llm(String),

    /// Anything else. Treated like a backend fault with the message kept.
    #[error("{0}")]
    Other(String),
}

/// Executes one request against the reserved deployment(s).
///
/// Controllers may suspend on network I/O; the queue runs each call as its
/// own task. Before returning, a controller must set
/// `telemetry.deployment_name` and the token counters it consumed.
#[async_trait]
pub trait RequestController: Send + Sync {
    async fn process(
        &self,
        payload: &serde_json::Value,
        reserved: &[Reservation],
        telemetry: &mut TelemetryRecord,
    ) -> Result<serde_json::Value, ControllerError>;
}
