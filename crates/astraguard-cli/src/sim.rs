//! In-process fault-injection simulation.
//!
//! Drives a [`Guardian`] with generated CubeSat telemetry against a
//! simulated detection model that misbehaves for a span of requests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use astraguard_core::{ComponentId, HeuristicScorer, OperatingMode, TelemetrySample, VerdictSource};
use astraguard_runtime::{
    BackoffConfig, CircuitBreakerConfig, CircuitSnapshot, ComponentHealth, DependencyError,
    DetectionModel, EvaluationConfig, Guardian, JitterStrategy, MemoryStore, ModelScore,
    RetryPolicy, RuntimeConfig, StatsSnapshot, SystemMode,
};

/// Fault injected into the simulated model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FaultScenario {
    /// Model answers every call
    None,

    /// Link to the model drops: calls fail with connection errors
    CommsDropout,

    /// Model host browns out: calls hang past the call timeout and bus voltage sags
    PowerBrownout,
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub config: Option<PathBuf>,
    pub requests: u64,
    pub fault: FaultScenario,
    pub seed: u64,
    pub pace: Duration,
}

/// Detection model whose behavior depends on the current request index.
pub struct SimulatedModel {
    fault: FaultScenario,
    window: Range<u64>,
    stall: Duration,
    request: AtomicU64,
    scorer: HeuristicScorer,
}

impl SimulatedModel {
    pub fn new(fault: FaultScenario, window: Range<u64>, stall: Duration) -> Self {
        Self {
            fault,
            window,
            stall,
            request: AtomicU64::new(0),
            scorer: HeuristicScorer::default(),
        }
    }

    pub fn set_request(&self, request: u64) {
        self.request.store(request, Ordering::SeqCst);
    }

    /// Fault active for the current request, if any.
    pub fn active_fault(&self) -> FaultScenario {
        if self.window.contains(&self.request.load(Ordering::SeqCst)) {
            self.fault
        } else {
            FaultScenario::None
        }
    }
}

#[async_trait]
impl DetectionModel for SimulatedModel {
    fn name(&self) -> &str {
        "simulated-model"
    }

    async fn score(&self, sample: &TelemetrySample) -> Result<ModelScore, DependencyError> {
        match self.active_fault() {
            FaultScenario::CommsDropout => {
                return Err(DependencyError::connection("downlink to model lost"));
            }
            FaultScenario::PowerBrownout => tokio::time::sleep(self.stall).await,
            FaultScenario::None => {}
        }

        let assessment = self.scorer.score(sample);
        Ok(ModelScore {
            score: assessment.score,
            is_anomalous: assessment.is_anomalous,
            confidence: Some(0.92),
        })
    }

    async fn health_check(&self) -> Result<(), DependencyError> {
        match self.active_fault() {
            FaultScenario::None => Ok(()),
            FaultScenario::CommsDropout => Err(DependencyError::connection("downlink to model lost")),
            FaultScenario::PowerBrownout => Err(DependencyError::unavailable("model host in brownout")),
        }
    }
}

/// Generates telemetry around nominal ranges.
pub struct TelemetryGenerator {
    rng: StdRng,
    nodes: Vec<String>,
}

impl TelemetryGenerator {
    pub fn new(seed: u64, nodes: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            nodes: (1..=nodes.max(1)).map(|n| format!("sat-{}", n)).collect(),
        }
    }

    pub fn sample(&mut self, request: u64, brownout: bool) -> TelemetrySample {
        let node = &self.nodes[(request % self.nodes.len() as u64) as usize];
        let voltage = if brownout {
            self.rng.gen_range(5.2..6.4)
        } else {
            self.rng.gen_range(7.4..8.6)
        };

        let mut sample = TelemetrySample::new(node.as_str())
            .with_voltage(voltage)
            .with_temperature(self.rng.gen_range(24.0..46.0))
            .with_gyro(self.rng.gen_range(-0.05..0.05))
            .with_current(self.rng.gen_range(0.8..1.8))
            .with_wheel_speed(self.rng.gen_range(2.0..6.0));

        // Occasional thermal spike
        if self.rng.gen_bool(0.03) {
            sample = sample.with_temperature(self.rng.gen_range(70.0..90.0));
        }
        sample
    }
}

/// One line of simulation output.
#[derive(Debug, Serialize)]
struct SimRecord<'a> {
    request: u64,
    node_id: &'a str,
    fault_active: bool,
    mode: OperatingMode,
    source: VerdictSource,
    is_anomalous: bool,
    score: f64,
}

/// Final state printed after the run.
#[derive(Debug, Serialize)]
struct SimSummary {
    mode: SystemMode,
    health: BTreeMap<ComponentId, ComponentHealth>,
    circuits: Vec<CircuitSnapshot>,
    stats: StatsSnapshot,
}

/// Timings that let a short simulation go through a full fail/recover cycle.
pub fn simulation_config() -> RuntimeConfig {
    let mut config = RuntimeConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_millis(500),
            max_open_duration: Duration::from_secs(5),
        },
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(80),
                jitter: JitterStrategy::Equal,
            },
            ..Default::default()
        },
        evaluation: EvaluationConfig {
            model_call_timeout: Duration::from_millis(50),
            evaluation_deadline: Duration::from_millis(400),
        },
        ..Default::default()
    };
    config.node_id = "astraguard-sim".into();
    config.health.window = Duration::from_secs(2);
    config.recovery.interval = Duration::from_millis(250);
    config
}

/// Run the simulation, writing JSON lines to stdout.
pub async fn run(options: SimOptions) -> Result<()> {
    let mut config = match &options.config {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => simulation_config(),
    };
    config.jitter_seed.get_or_insert(options.seed);

    let start = options.requests / 4;
    let end = start + options.requests / 4;
    let model = Arc::new(SimulatedModel::new(
        options.fault,
        start..end,
        config.evaluation.model_call_timeout * 2,
    ));
    let store = Arc::new(MemoryStore::default());

    let guardian = Guardian::builder()
        .config(config.clone())
        .model(model.clone())
        .store(store)
        .build()
        .context("Failed to build guardian")?;

    let recovery = Arc::new(guardian.recovery_orchestrator(config.recovery.actions.clone()))
        .spawn(config.recovery.interval);

    tracing::info!(
        requests = options.requests,
        fault = ?options.fault,
        window = ?(start..end),
        "Simulation started"
    );

    let mut telemetry = TelemetryGenerator::new(options.seed, 3);
    for request in 0..options.requests {
        model.set_request(request);
        let fault_active = model.active_fault() != FaultScenario::None;
        let brownout = model.active_fault() == FaultScenario::PowerBrownout;
        let sample = telemetry.sample(request, brownout);

        let outcome = guardian
            .evaluate(&sample)
            .await
            .with_context(|| format!("Request {} rejected", request))?;

        let record = SimRecord {
            request,
            node_id: sample.node_id.as_str(),
            fault_active,
            mode: outcome.mode,
            source: outcome.verdict.source,
            is_anomalous: outcome.verdict.is_anomalous,
            score: outcome.verdict.score,
        };
        println!("{}", serde_json::to_string(&record)?);

        tokio::time::sleep(options.pace).await;
    }

    recovery.shutdown().await;
    guardian.publish_state().await;

    let summary = SimSummary {
        mode: guardian.current_mode(),
        health: guardian.health(),
        circuits: guardian.circuits(),
        stats: guardian.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    tracing::info!(mode = %summary.mode.current, "Simulation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use astraguard_runtime::ErrorClass;

    #[tokio::test]
    async fn test_comms_dropout_only_inside_window() {
        let model = SimulatedModel::new(FaultScenario::CommsDropout, 5..10, Duration::ZERO);
        let sample = TelemetrySample::new("sat-1").with_voltage(8.0);

        model.set_request(2);
        assert!(model.score(&sample).await.is_ok());

        model.set_request(5);
        let err = model.score(&sample).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Connection);
        assert!(model.health_check().await.is_err());

        model.set_request(10);
        assert!(model.health_check().await.is_ok());
    }

    #[test]
    fn test_generator_is_reproducible() {
        let mut a = TelemetryGenerator::new(42, 3);
        let mut b = TelemetryGenerator::new(42, 3);
        for request in 0..20 {
            assert_eq!(a.sample(request, false), b.sample(request, false));
        }
    }

    #[test]
    fn test_brownout_sags_voltage() {
        let mut generator = TelemetryGenerator::new(1, 1);
        let sample = generator.sample(0, true);
        assert!(sample.voltage.unwrap() < 7.0);
    }

    #[test]
    fn test_simulation_config_is_valid() {
        assert!(simulation_config().validate().is_ok());
    }
}
