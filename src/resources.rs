//! Availability checks across the LLM and embedding balancer pools.
//!
//! `try_reserve` is all-or-nothing: when a request needs both pools and only
//! one has capacity, nothing stays reserved.

use crate::balancer::LoadBalancer;
use crate::config::DeploymentConfig;
use crate::telemetry::TelemetryRecord;
use crate::types::{DeploymentKind, ModelPreferences, QueueError, Reservation};

pub struct ResourceChecker {
    llm: LoadBalancer,
    embedding: LoadBalancer,
}

impl ResourceChecker {
    /// Split one deployment list into the LLM and embedding pools.
    pub fn new(deployments: &[DeploymentConfig]) -> Self {
        let (embedding, llm): (Vec<_>, Vec<_>) = deployments
            .iter()
            .cloned()
            .partition(|d| d.output_kind.deployment_kind() == DeploymentKind::Embedding);

        Self {
            llm: LoadBalancer::new(DeploymentKind::Llm, &llm),
            embedding: LoadBalancer::new(DeploymentKind::Embedding, &embedding),
        }
    }

    /// Admission-time check: the preferences must be satisfiable by the
    /// configuration at all, independent of current load.
    pub fn can_admit(&self, prefs: &ModelPreferences) -> Result<(), QueueError> {
        if !prefs.require_llm && !prefs.require_embedding {
            return Err(QueueError::ResourceUnavailable(
                "request requires neither an LLM nor an embedding model".into(),
            ));
        }

        if prefs.require_llm {
            if self.llm.is_empty() {
                return Err(QueueError::ResourceUnavailable(
                    "no LLM deployments configured".into(),
                ));
            }
            if let Some(id) = &prefs.specific_llm_id
                && !self.llm.contains(id)
            {
                return Err(QueueError::ResourceUnavailable(format!(
                    "unknown LLM deployment: {id}"
                )));
            }
        }

        if prefs.require_embedding {
            if self.embedding.is_empty() {
                return Err(QueueError::ResourceUnavailable(
                    "no embedding deployments configured".into(),
                ));
            }
            if let Some(id) = &prefs.specific_embedding_id
                && !self.embedding.contains(id)
            {
                return Err(QueueError::ResourceUnavailable(format!(
                    "unknown embedding deployment: {id}"
                )));
            }
        }

        Ok(())
    }

    /// True iff every required pool could serve the request right now.
    pub fn can_serve(&self, prefs: &ModelPreferences) -> bool {
        if prefs.require_llm
            && !self
                .llm
                .has_available(prefs.llm_units(), prefs.specific_llm_id.as_deref())
        {
            return false;
        }
        if prefs.require_embedding
            && !self
                .embedding
                .has_available(prefs.embedding_units(), prefs.specific_embedding_id.as_deref())
        {
            return false;
        }
        prefs.require_llm || prefs.require_embedding
    }

    /// Reserve capacity on every required pool, or nothing.
    pub fn try_reserve(&self, prefs: &ModelPreferences) -> Option<Vec<Reservation>> {
        let mut reservations = Vec::new();

        if prefs.require_llm {
            let id = self
                .llm
                .reserve(prefs.llm_units(), prefs.specific_llm_id.as_deref())?;
            reservations.push(Reservation {
                kind: DeploymentKind::Llm,
                deployment_id: id,
            });
        }

        if prefs.require_embedding {
            match self
                .embedding
                .reserve(prefs.embedding_units(), prefs.specific_embedding_id.as_deref())
            {
                Some(id) => reservations.push(Reservation {
                    kind: DeploymentKind::Embedding,
                    deployment_id: id,
                }),
                None => {
                    self.rollback(&reservations, prefs);
                    return None;
                }
            }
        }

        if reservations.is_empty() {
            return None;
        }
        Some(reservations)
    }

    fn rollback(&self, reservations: &[Reservation], prefs: &ModelPreferences) {
        for r in reservations {
            match r.kind {
                DeploymentKind::Llm => self.llm.release(&r.deployment_id, prefs.llm_units()),
                DeploymentKind::Embedding => {
                    self.embedding.release(&r.deployment_id, prefs.embedding_units())
                }
            }
        }
    }

    /// True up per-deployment token usage from the finished record.
    pub fn record_usage(&self, reservations: &[Reservation], record: &TelemetryRecord) {
        for r in reservations {
            match r.kind {
                DeploymentKind::Llm => {
                    let tokens = record.prompt_tokens.max(0) + record.completion_tokens.max(0);
                    self.llm.record_usage(&r.deployment_id, tokens as u64);
                }
                DeploymentKind::Embedding => {
                    let tokens = record.embedding_tokens.max(0);
                    self.embedding.record_usage(&r.deployment_id, tokens as u64);
                }
            }
        }
    }

    /// Quarantine every deployment involved in a failed call.
    pub fn register_error(&self, reservations: &[Reservation]) {
        for r in reservations {
            match r.kind {
                DeploymentKind::Llm => self.llm.register_error(&r.deployment_id),
                DeploymentKind::Embedding => self.embedding.register_error(&r.deployment_id),
            }
        }
    }
}
