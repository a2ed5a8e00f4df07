//! Collaborator capabilities consumed by the resilience core.
//!
//! The core never talks to a network or a model directly: it only decides
//! when to call these traits and how to interpret their failures. Every
//! failure is reported as a [`DependencyError`] carrying an
//! [`ErrorClass`](crate::error::ErrorClass).

pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use astraguard_core::{NodeId, TelemetrySample};

use crate::consensus::{Vote, VoteRequest};
use crate::error::DependencyError;

pub use store::{CoordinationStore, MemoryStore, PublisherConfig, StatePublisher, StoreError};

/// Model output for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    /// Anomaly score (0.0 - 1.0)
    pub score: f64,

    pub is_anomalous: bool,

    /// Model's own confidence, if it reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Remote anomaly-detection model.
#[async_trait]
pub trait DetectionModel: Send + Sync {
    /// Name used in logs and verdict notes.
    fn name(&self) -> &str {
        "model"
    }

    /// Score one sample.
    ///
    /// Malformed input must be reported as `InvalidInput` so it never
    /// counts against the model's circuit.
    async fn score(&self, sample: &TelemetrySample) -> Result<ModelScore, DependencyError>;

    /// Cheap liveness check used by recovery probes.
    async fn health_check(&self) -> Result<(), DependencyError>;
}

/// Transport for consensus vote requests.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Ask one peer for its vote. The transport does not retry.
    async fn send_vote_request(
        &self,
        peer: &NodeId,
        request: &VoteRequest,
    ) -> Result<Vote, DependencyError>;
}
