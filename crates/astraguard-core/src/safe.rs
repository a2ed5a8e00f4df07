//! Safe-mode responder.
//!
//! Produces a fixed conservative verdict without calling any collaborator.
//! Either treats every sample as anomalous, or replays the last model
//! verdict recorded for the node.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{AnomalyVerdict, NodeId, TelemetrySample, VerdictSource};

/// Verdict policy while in SAFE mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeVerdictPolicy {
    /// Flag every sample for operator attention
    #[default]
    TreatAsAnomalous,

    /// Replay the last model verdict for the node, if one exists
    LastKnownGood,
}

/// Responder for SAFE mode.
pub struct SafeResponder {
    policy: SafeVerdictPolicy,
    last_good: RwLock<HashMap<NodeId, AnomalyVerdict>>,
}

impl SafeResponder {
    pub fn new(policy: SafeVerdictPolicy) -> Self {
        Self {
            policy,
            last_good: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SafeVerdictPolicy {
        self.policy
    }

    /// Remember a model verdict as the node's last known good answer.
    pub fn remember(&self, verdict: &AnomalyVerdict) {
        if verdict.source != VerdictSource::Model {
            return;
        }
        self.last_good
            .write()
            .insert(verdict.node_id.clone(), verdict.clone());
    }

    /// Produce the conservative verdict for a sample.
    pub fn respond(&self, sample: &TelemetrySample, now: DateTime<Utc>) -> AnomalyVerdict {
        if self.policy == SafeVerdictPolicy::LastKnownGood {
            if let Some(previous) = self.last_good.read().get(&sample.node_id) {
                return AnomalyVerdict {
                    source: VerdictSource::LastKnownGood,
                    notes: vec![format!(
                        "replayed model verdict from {}",
                        previous.evaluated_at.to_rfc3339()
                    )],
                    evaluated_at: now,
                    ..previous.clone()
                };
            }
        }

        AnomalyVerdict {
            node_id: sample.node_id.clone(),
            is_anomalous: true,
            score: 1.0,
            confidence: 0.0,
            source: VerdictSource::Safe,
            notes: vec!["safe mode: treated as anomalous".to_string()],
            evaluated_at: now,
        }
    }
}

impl Default for SafeResponder {
    fn default() -> Self {
        Self::new(SafeVerdictPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_verdict(node: &str, anomalous: bool) -> AnomalyVerdict {
        AnomalyVerdict {
            node_id: NodeId::new(node),
            is_anomalous: anomalous,
            score: 0.12,
            confidence: 0.93,
            source: VerdictSource::Model,
            notes: vec![],
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn test_treat_as_anomalous() {
        let responder = SafeResponder::default();
        responder.remember(&model_verdict("sat-1", false));

        let verdict = responder.respond(&TelemetrySample::new("sat-1"), Utc::now());
        assert!(verdict.is_anomalous);
        assert_eq!(verdict.source, VerdictSource::Safe);
    }

    #[test]
    fn test_last_known_good_replays_model_verdict() {
        let responder = SafeResponder::new(SafeVerdictPolicy::LastKnownGood);
        responder.remember(&model_verdict("sat-1", false));

        let verdict = responder.respond(&TelemetrySample::new("sat-1"), Utc::now());
        assert!(!verdict.is_anomalous);
        assert_eq!(verdict.source, VerdictSource::LastKnownGood);
        assert_eq!(verdict.score, 0.12);
    }

    #[test]
    fn test_last_known_good_without_history_is_conservative() {
        let responder = SafeResponder::new(SafeVerdictPolicy::LastKnownGood);
        responder.remember(&model_verdict("sat-1", false));

        let verdict = responder.respond(&TelemetrySample::new("sat-2"), Utc::now());
        assert!(verdict.is_anomalous);
        assert_eq!(verdict.source, VerdictSource::Safe);
    }

    #[test]
    fn test_only_model_verdicts_are_remembered() {
        let responder = SafeResponder::new(SafeVerdictPolicy::LastKnownGood);
        let mut heuristic = model_verdict("sat-1", false);
        heuristic.source = VerdictSource::Heuristic;
        responder.remember(&heuristic);

        let verdict = responder.respond(&TelemetrySample::new("sat-1"), Utc::now());
        assert_eq!(verdict.source, VerdictSource::Safe);
    }
}
