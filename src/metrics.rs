//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple queues share a process); recording still routes to whichever
/// recorder won the race.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!("llmq_requests_total", "Total submissions accepted for scheduling");
    describe_counter!(
        "llmq_rejected_total",
        "Submissions rejected at admission, labeled by reason"
    );
    describe_counter!("llmq_dispatch_total", "Requests handed to an execution task");
    describe_gauge!(
        "llmq_queue_depth",
        "Live requests per stage (new, waiting, in_flight)"
    );
    describe_histogram!(
        "llmq_request_duration_seconds",
        "End-to-end request duration from admission to response handoff"
    );
    describe_counter!(
        "llmq_deployment_errors_total",
        "Backend faults that quarantined a deployment"
    );
    describe_counter!(
        "llmq_telemetry_failures_total",
        "Telemetry records dropped because the sink failed or backed up"
    );
}
