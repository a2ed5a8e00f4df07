//! # astraguard-core
//!
//! Deterministic telemetry verdicts for AstraGuard.
//!
//! This crate holds the parts of anomaly evaluation that never touch a
//! collaborator:
//! - Telemetry sample and verdict types
//! - The heuristic scorer used in HEURISTIC mode
//! - The safe responder used in SAFE mode
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same sample and config always produce the same verdict
//! 2. **No I/O**: Nothing here awaits, sleeps or calls out
//! 3. **Never fails on valid input**: Missing fields use documented defaults
//!
//! ## Example
//!
//! ```rust,ignore
//! use astraguard_core::{heuristic_verdict, TelemetrySample};
//!
//! let sample = TelemetrySample::new("sat-4").with_voltage(3.1).with_temperature(71.0);
//! let verdict = heuristic_verdict(&sample)?;
//! assert!(verdict.is_anomalous);
//! ```

pub mod heuristic;
pub mod safe;
pub mod types;

pub use heuristic::{Band, HeuristicAssessment, HeuristicConfig, HeuristicScorer};
pub use safe::{SafeResponder, SafeVerdictPolicy};
pub use types::{
    AnomalyVerdict, ComponentId, NodeId, OperatingMode, TelemetrySample, VerdictSource,
};

use thiserror::Error;

/// Errors for samples that cannot be evaluated.
///
/// These are the caller's fault: they are never retried and never count
/// against a dependency.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("Sample has no node id")]
    MissingNodeId,

    #[error("Field {field} is not finite: {value}")]
    NonFinite { field: &'static str, value: f64 },

    #[error("Sample rejected by detection model: {0}")]
    Rejected(String),
}

/// Score a sample with the default heuristic configuration.
pub fn heuristic_verdict(sample: &TelemetrySample) -> Result<AnomalyVerdict, SampleError> {
    sample.validate()?;
    Ok(HeuristicScorer::default().verdict(sample, chrono::Utc::now()))
}
