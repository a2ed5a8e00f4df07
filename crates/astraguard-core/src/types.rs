//! Core types shared by the deterministic scorers and the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SampleError;

/// Identifier of a telemetry-producing node (spacecraft, sensor unit, peer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a dependency tracked by the resilience core
/// (e.g. `model`, `store`, `peer:node-2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Component id used for the breaker and health track of a cluster peer.
    pub fn peer(node: &NodeId) -> Self {
        Self(format!("peer:{}", node))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Operating mode of the fallback cascade.
///
/// Ordered from most capable to most conservative: `Primary < Heuristic < Safe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    /// Model-backed detection
    Primary,

    /// Local threshold scoring
    Heuristic,

    /// Fixed conservative verdicts, no collaborator calls
    Safe,
}

impl OperatingMode {
    /// The next more conservative mode, if any.
    pub fn downgraded(self) -> Option<Self> {
        match self {
            Self::Primary => Some(Self::Heuristic),
            Self::Heuristic => Some(Self::Safe),
            Self::Safe => None,
        }
    }

    /// The next more capable mode, if any.
    pub fn upgraded(self) -> Option<Self> {
        match self {
            Self::Primary => None,
            Self::Heuristic => Some(Self::Primary),
            Self::Safe => Some(Self::Heuristic),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "PRIMARY"),
            Self::Heuristic => write!(f, "HEURISTIC"),
            Self::Safe => write!(f, "SAFE"),
        }
    }
}

/// A single telemetry reading from a node.
///
/// All measurement fields are optional; scorers substitute documented
/// defaults for missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Node that produced the reading
    pub node_id: NodeId,

    /// When the reading was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Bus voltage (V)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,

    /// Board temperature (°C)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Angular rate (rad/s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyro: Option<f64>,

    /// Bus current (A)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,

    /// Reaction wheel speed (krpm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wheel_speed: Option<f64>,
}

impl TelemetrySample {
    /// Create an empty sample for a node.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: None,
            voltage: None,
            temperature: None,
            gyro: None,
            current: None,
            wheel_speed: None,
        }
    }

    pub fn with_voltage(mut self, value: f64) -> Self {
        self.voltage = Some(value);
        self
    }

    pub fn with_temperature(mut self, value: f64) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn with_gyro(mut self, value: f64) -> Self {
        self.gyro = Some(value);
        self
    }

    pub fn with_current(mut self, value: f64) -> Self {
        self.current = Some(value);
        self
    }

    pub fn with_wheel_speed(mut self, value: f64) -> Self {
        self.wheel_speed = Some(value);
        self
    }

    /// Measurement fields by name, in a fixed order.
    pub fn fields(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("voltage", self.voltage),
            ("temperature", self.temperature),
            ("gyro", self.gyro),
            ("current", self.current),
            ("wheel_speed", self.wheel_speed),
        ]
    }

    /// Reject samples that no scorer could interpret.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.node_id.as_str().trim().is_empty() {
            return Err(SampleError::MissingNodeId);
        }

        for (field, value) in self.fields() {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(SampleError::NonFinite { field, value: v });
                }
            }
        }

        Ok(())
    }
}

/// Which detection strategy produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Remote anomaly-detection model
    Model,

    /// Local threshold scorer
    Heuristic,

    /// Fixed conservative policy
    Safe,

    /// Replay of the last model verdict for the node
    LastKnownGood,
}

/// Anomaly decision for a single sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    /// Node the verdict applies to
    pub node_id: NodeId,

    /// Whether the sample is treated as anomalous
    pub is_anomalous: bool,

    /// Anomaly score (0.0 - 1.0)
    pub score: f64,

    /// Confidence in the verdict (0.0 - 1.0)
    pub confidence: f64,

    /// Strategy that produced the verdict
    pub source: VerdictSource,

    /// Human-readable notes (violated bands, defaults used, policy)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,

    /// When the verdict was produced
    pub evaluated_at: DateTime<Utc>,
}
