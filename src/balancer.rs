//! Per-deployment budget tracking and selection.
//!
//! Each deployment carries a 60-second sliding window of reserved request
//! units and one of observed token usage, plus an error quarantine deadline.
//! Windows are ordered `(timestamp, cost)` deques pruned lazily on access.
//! Selection is weighted least-loaded: most free request capacity first,
//! then most free token capacity, then lexicographic id.

use crate::config::DeploymentConfig;
use crate::types::DeploymentKind;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

struct DeploymentState {
    id: String,
    reqs_per_min: u64,
    tokens_per_min: u64,
    error_backoff: Duration,
    /// Reserved request units in the last 60s. Reservations age out exactly
    /// like observed counts.
    requests: VecDeque<(Instant, u64)>,
    /// Observed token usage in the last 60s, trued up after each call.
    tokens: VecDeque<(Instant, u64)>,
    quarantined_until: Option<Instant>,
}

impl DeploymentState {
    fn new(config: &DeploymentConfig) -> Self {
        Self {
            id: config.id.clone(),
            reqs_per_min: config.reqs_per_min,
            tokens_per_min: config.tokens_per_min,
            error_backoff: Duration::from_secs_f64(config.error_backoff_seconds.max(0.0)),
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
            quarantined_until: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(WINDOW);
        let Some(cutoff) = cutoff else { return };
        while let Some(&(at, _)) = self.requests.front() {
            if at < cutoff {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(at, _)) = self.tokens.front() {
            if at < cutoff {
                self.tokens.pop_front();
            } else {
                break;
            }
        }
    }

    fn rolling_requests(&self) -> u64 {
        self.requests.iter().map(|&(_, cost)| cost).sum()
    }

    fn rolling_tokens(&self) -> u64 {
        self.tokens.iter().map(|&(_, cost)| cost).sum()
    }

    fn is_quarantined(&self, now: Instant) -> bool {
        self.quarantined_until.is_some_and(|until| now < until)
    }

    /// Available iff not quarantined, `units` more requests fit the request
    /// budget, and the token budget has headroom left.
    fn accepts(&self, units: u64, now: Instant) -> bool {
        !self.is_quarantined(now)
            && self.rolling_requests() + units <= self.reqs_per_min
            && self.rolling_tokens() < self.tokens_per_min
    }

    /// `(free request capacity, free token capacity)`, the selection weight.
    fn headroom(&self) -> (u64, u64) {
        (
            self.reqs_per_min.saturating_sub(self.rolling_requests()),
            self.tokens_per_min.saturating_sub(self.rolling_tokens()),
        )
    }
}

/// Load balancer over the deployments of one kind.
pub struct LoadBalancer {
    kind: DeploymentKind,
    deployments: Mutex<Vec<DeploymentState>>,
}

impl LoadBalancer {
    pub fn new(kind: DeploymentKind, configs: &[DeploymentConfig]) -> Self {
        Self {
            kind,
            deployments: Mutex::new(configs.iter().map(DeploymentState::new).collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.lock().unwrap().is_empty()
    }

    pub fn contains(&self, deployment_id: &str) -> bool {
        self.deployments
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.id == deployment_id)
    }

    /// True iff any (or the named) deployment could take `units` right now.
    pub fn has_available(&self, units: u64, preferred: Option<&str>) -> bool {
        let mut deployments = self.deployments.lock().unwrap();
        let now = Instant::now();
        deployments.iter_mut().any(|d| {
            if let Some(preferred) = preferred
                && d.id != preferred
            {
                return false;
            }
            d.prune(now);
            d.accepts(units, now)
        })
    }

    /// Reserve `units` of request capacity on the best available deployment.
    pub fn reserve(&self, units: u64, preferred: Option<&str>) -> Option<String> {
        let mut deployments = self.deployments.lock().unwrap();
        let now = Instant::now();
        for d in deployments.iter_mut() {
            d.prune(now);
        }

        let mut best: Option<usize> = None;
        for (i, d) in deployments.iter().enumerate() {
            if let Some(preferred) = preferred
                && d.id != preferred
            {
                continue;
            }
            if !d.accepts(units, now) {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let (a, b) = (&deployments[i], &deployments[j]);
                    if a.headroom() > b.headroom()
                        || (a.headroom() == b.headroom() && a.id < b.id)
                    {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }

        let chosen = &mut deployments[best?];
        chosen.requests.push_back((now, units));
        debug!(
            pool = ?self.kind,
            deployment = %chosen.id,
            units,
            rolling = chosen.rolling_requests(),
            "Reserved request capacity"
        );
        Some(chosen.id.clone())
    }

    /// Return an unused reservation. Only called to roll back an
    /// all-or-nothing reserve that could not complete.
    pub fn release(&self, deployment_id: &str, units: u64) {
        let mut deployments = self.deployments.lock().unwrap();
        if let Some(d) = deployments.iter_mut().find(|d| d.id == deployment_id)
            && let Some(idx) = d.requests.iter().rposition(|&(_, cost)| cost == units)
        {
            d.requests.remove(idx);
        }
    }

    /// True up token usage after a completed call.
    pub fn record_usage(&self, deployment_id: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let mut deployments = self.deployments.lock().unwrap();
        if let Some(d) = deployments.iter_mut().find(|d| d.id == deployment_id) {
            let now = Instant::now();
            d.prune(now);
            d.tokens.push_back((now, tokens));
        }
    }

    /// Quarantine the deployment for its configured backoff.
    pub fn register_error(&self, deployment_id: &str) {
        let mut deployments = self.deployments.lock().unwrap();
        if let Some(d) = deployments.iter_mut().find(|d| d.id == deployment_id) {
            d.quarantined_until = Some(Instant::now() + d.error_backoff);
            warn!(
                pool = ?self.kind,
                deployment = %d.id,
                backoff = ?d.error_backoff,
                "Deployment quarantined after backend error"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: &str, reqs: u64, tokens: u64, backoff: f64) -> DeploymentConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "output_kind": "chat",
            "reqs_per_min": reqs,
            "tokens_per_min": tokens,
            "error_backoff_seconds": backoff,
        }))
        .unwrap()
    }

    fn balancer(configs: &[DeploymentConfig]) -> LoadBalancer {
        LoadBalancer::new(DeploymentKind::Llm, configs)
    }

    #[test]
    fn least_loaded_wins_with_lexicographic_tie_break() {
        let lb = balancer(&[
            deployment("b", 60, 60_000, 1.0),
            deployment("a", 60, 60_000, 1.0),
        ]);

        // Equal headroom: lexicographic smallest id.
        assert_eq!(lb.reserve(1, None).unwrap(), "a");
        // "a" now has one unit in flight, so "b" has more headroom.
        assert_eq!(lb.reserve(1, None).unwrap(), "b");
    }

    #[test]
    fn token_headroom_breaks_request_ties() {
        let lb = balancer(&[
            deployment("a", 60, 60_000, 1.0),
            deployment("b", 60, 60_000, 1.0),
        ]);
        lb.record_usage("a", 30_000);

        assert_eq!(lb.reserve(1, None).unwrap(), "b");
    }

    #[test]
    fn request_budget_is_enforced() {
        let lb = balancer(&[deployment("a", 2, 60_000, 1.0)]);

        assert!(lb.reserve(1, None).is_some());
        assert!(lb.reserve(1, None).is_some());
        assert!(lb.reserve(1, None).is_none());
        assert!(!lb.has_available(1, None));
    }

    #[test]
    fn multi_unit_reservations_count_fully() {
        let lb = balancer(&[deployment("a", 3, 60_000, 1.0)]);

        assert!(lb.reserve(2, None).is_some());
        assert!(lb.reserve(2, None).is_none());
        assert!(lb.reserve(1, None).is_some());
    }

    #[test]
    fn release_returns_capacity() {
        let lb = balancer(&[deployment("a", 1, 60_000, 1.0)]);

        assert!(lb.reserve(1, None).is_some());
        assert!(!lb.has_available(1, None));
        lb.release("a", 1);
        assert!(lb.has_available(1, None));
    }

    #[test]
    fn exhausted_token_budget_blocks_selection() {
        let lb = balancer(&[deployment("a", 60, 100, 1.0)]);

        assert!(lb.has_available(1, None));
        lb.record_usage("a", 100);
        assert!(!lb.has_available(1, None));
    }

    #[test]
    fn preferred_id_restricts_selection() {
        let lb = balancer(&[
            deployment("a", 1, 60_000, 1.0),
            deployment("b", 60, 60_000, 1.0),
        ]);

        assert_eq!(lb.reserve(1, Some("a")).unwrap(), "a");
        // "a" is exhausted; preferring it fails even though "b" is free.
        assert!(lb.reserve(1, Some("a")).is_none());
        assert!(!lb.has_available(1, Some("a")));
        assert!(lb.has_available(1, Some("b")));
    }

    #[test]
    fn quarantine_excludes_then_expires() {
        let lb = balancer(&[deployment("a", 60, 60_000, 0.05)]);

        lb.register_error("a");
        assert!(!lb.has_available(1, None));
        assert!(lb.reserve(1, None).is_none());

        std::thread::sleep(Duration::from_millis(80));
        assert!(lb.has_available(1, None));
        assert_eq!(lb.reserve(1, None).unwrap(), "a");
    }

    #[test]
    fn quarantined_peer_routes_to_healthy_deployment() {
        let lb = balancer(&[
            deployment("a", 60, 60_000, 10.0),
            deployment("b", 60, 60_000, 10.0),
        ]);

        lb.register_error("a");
        assert_eq!(lb.reserve(1, None).unwrap(), "b");
        assert_eq!(lb.reserve(1, None).unwrap(), "b");
    }

    #[test]
    fn contains_reports_configured_ids() {
        let lb = balancer(&[deployment("a", 1, 1, 1.0)]);
        assert!(lb.contains("a"));
        assert!(!lb.contains("z"));
        assert!(!lb.is_empty());
    }
}
