//! Heuristic scorer: local threshold-based anomaly scoring.
//!
//! Used when the remote model is unavailable. Each telemetry field is
//! compared against a nominal band; deviation outside the band is scaled
//! by the field's tolerance and combined by weight.
//!
//! The scorer never fails. A missing field is scored at its band midpoint
//! (i.e. nominal) and lowers the confidence of the verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AnomalyVerdict, TelemetrySample, VerdictSource};

/// Nominal operating band for one telemetry field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Lowest nominal value
    pub low: f64,

    /// Highest nominal value
    pub high: f64,

    /// Distance outside the band that counts as a full deviation
    pub tolerance: f64,

    /// Relative weight in the combined score
    pub weight: f64,
}

impl Band {
    pub const fn new(low: f64, high: f64, tolerance: f64, weight: f64) -> Self {
        Self {
            low,
            high,
            tolerance,
            weight,
        }
    }

    /// Value substituted when the field is missing.
    pub fn midpoint(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    /// Deviation in `[0.0, 1.0]`: 0 inside the band, 1 at or beyond one tolerance.
    pub fn deviation(&self, value: f64) -> f64 {
        let distance = if value < self.low {
            self.low - value
        } else if value > self.high {
            value - self.high
        } else {
            return 0.0;
        };

        (distance / self.tolerance).min(1.0)
    }
}

/// Heuristic scorer configuration.
///
/// Defaults follow the nominal ranges of the CubeSat telemetry the fleet
/// produces (healthy voltage 7-9 V, temperature 20-50 °C, current 0.5-2 A).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub voltage: Band,
    pub temperature: Band,
    pub gyro: Band,
    pub current: Band,
    pub wheel_speed: Band,

    /// Weighted score at or above which a sample is anomalous
    pub anomaly_threshold: f64,

    /// Confidence when every field is present
    pub base_confidence: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            voltage: Band::new(7.0, 9.0, 2.0, 0.3),
            temperature: Band::new(20.0, 50.0, 15.0, 0.3),
            gyro: Band::new(-0.2, 0.2, 0.3, 0.1),
            current: Band::new(0.5, 2.0, 1.5, 0.2),
            wheel_speed: Band::new(0.0, 10.0, 5.0, 0.1),
            anomaly_threshold: 0.35,
            base_confidence: 0.6,
        }
    }
}

impl HeuristicConfig {
    fn bands(&self) -> [(&'static str, &Band); 5] {
        [
            ("voltage", &self.voltage),
            ("temperature", &self.temperature),
            ("gyro", &self.gyro),
            ("current", &self.current),
            ("wheel_speed", &self.wheel_speed),
        ]
    }

    /// Check that bands and thresholds are usable.
    pub fn validate(&self) -> Result<(), String> {
        for (name, band) in self.bands() {
            if band.low > band.high {
                return Err(format!("{} band has low > high", name));
            }
            if band.tolerance <= 0.0 {
                return Err(format!("{} band tolerance must be positive", name));
            }
            if band.weight < 0.0 {
                return Err(format!("{} band weight must not be negative", name));
            }
        }

        if !(0.0..=1.0).contains(&self.anomaly_threshold) {
            return Err("anomaly_threshold must be within 0.0..=1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.base_confidence) {
            return Err("base_confidence must be within 0.0..=1.0".to_string());
        }

        Ok(())
    }
}

/// Result of heuristic scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicAssessment {
    /// Weighted deviation score (0.0 - 1.0)
    pub score: f64,

    /// Whether the sample is anomalous
    pub is_anomalous: bool,

    /// Confidence, reduced for each missing field
    pub confidence: f64,

    /// Fields outside their nominal band
    pub violations: Vec<String>,

    /// Fields scored at their default midpoint
    pub defaulted: Vec<&'static str>,
}

/// Threshold-based scorer over raw telemetry fields.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    config: HeuristicConfig,
}

impl HeuristicScorer {
    pub fn new(config: HeuristicConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeuristicConfig {
        &self.config
    }

    /// Score a sample.
    pub fn score(&self, sample: &TelemetrySample) -> HeuristicAssessment {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        let mut full_deviation = false;
        let mut violations = Vec::new();
        let mut defaulted = Vec::new();

        for ((name, value), (_, band)) in sample.fields().into_iter().zip(self.config.bands()) {
            let value = match value {
                Some(v) if v.is_finite() => v,
                _ => {
                    defaulted.push(name);
                    band.midpoint()
                }
            };

            let deviation = band.deviation(value);
            if deviation > 0.0 {
                violations.push(format!(
                    "{}={:.3} outside [{}, {}]",
                    name, value, band.low, band.high
                ));
            }
            if deviation >= 1.0 {
                full_deviation = true;
            }

            weighted += deviation * band.weight;
            total_weight += band.weight;
        }

        let score = if total_weight > 0.0 {
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let present = 5 - defaulted.len();
        let confidence = (self.config.base_confidence * present as f64 / 5.0).max(0.1);

        HeuristicAssessment {
            score,
            is_anomalous: full_deviation || score >= self.config.anomaly_threshold,
            confidence,
            violations,
            defaulted,
        }
    }

    /// Score a sample and wrap the result as a verdict.
    pub fn verdict(&self, sample: &TelemetrySample, now: DateTime<Utc>) -> AnomalyVerdict {
        let assessment = self.score(sample);

        let mut notes = assessment.violations;
        notes.extend(
            assessment
                .defaulted
                .iter()
                .map(|field| format!("{} missing, scored as nominal", field)),
        );

        AnomalyVerdict {
            node_id: sample.node_id.clone(),
            is_anomalous: assessment.is_anomalous,
            score: assessment.score,
            confidence: assessment.confidence,
            source: VerdictSource::Heuristic,
            notes,
            evaluated_at: now,
        }
    }
}
