//! Evaluation statistics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use astraguard_core::OperatingMode;

/// Counters updated by every evaluation.
#[derive(Debug, Default)]
pub struct EvaluationStats {
    requests: AtomicU64,
    rejected: AtomicU64,
    model_verdicts: AtomicU64,
    heuristic_verdicts: AtomicU64,
    safe_verdicts: AtomicU64,
    model_calls: AtomicU64,

    /// Requests that started on the model path and were served by a fallback
    fallbacks: AtomicU64,
}

/// Point-in-time copy of [`EvaluationStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub rejected: u64,
    pub model_verdicts: u64,
    pub heuristic_verdicts: u64,
    pub safe_verdicts: u64,
    pub model_calls: u64,
    pub fallbacks: u64,
}

impl EvaluationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_call(&self) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a verdict served under `mode`.
    pub fn record_verdict(&self, mode: OperatingMode) {
        let counter = match mode {
            OperatingMode::Primary => &self.model_verdicts,
            OperatingMode::Heuristic => &self.heuristic_verdicts,
            OperatingMode::Safe => &self.safe_verdicts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            model_verdicts: self.model_verdicts.load(Ordering::Relaxed),
            heuristic_verdicts: self.heuristic_verdicts.load(Ordering::Relaxed),
            safe_verdicts: self.safe_verdicts.load(Ordering::Relaxed),
            model_calls: self.model_calls.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}
