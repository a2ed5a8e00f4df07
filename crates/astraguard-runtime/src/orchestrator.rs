//! Guardian: the evaluation service that ties the resilience core together.
//!
//! Every request runs one mode cycle and is then served by the strategy of
//! the current mode:
//! - PRIMARY: the detection model, through the retry executor and the
//!   model's circuit, bounded by a per-call timeout and an overall deadline
//! - HEURISTIC: the local threshold scorer
//! - SAFE: the fixed conservative verdict, no collaborator calls
//!
//! When the model path fails, the mode cycle is re-run with the failure and
//! the request is served by a fallback. `evaluate` only fails for invalid
//! input.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use astraguard_core::{
    AnomalyVerdict, ComponentId, HeuristicScorer, OperatingMode, SafeResponder, SampleError,
    TelemetrySample, VerdictSource,
};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    ClusterTransport, CoordinationStore, DetectionModel, ModelScore, StatePublisher,
};
use crate::config::{duration_human, ConfigError, RuntimeConfig};
use crate::consensus::{ConsensusResult, Proposal, QuorumConsensus};
use crate::error::{DependencyError, ResilienceError};
use crate::health::{ComponentHealth, HealthMonitor, HealthSummary};
use crate::recovery::{ModelProbe, RecoveryActionConfig, RecoveryOrchestrator};
use crate::resilience::{
    CircuitBreaker, CircuitSnapshot, CircuitState, DetectionStrategy, JitterSource,
    ModeController, RetryExecutor, SystemMode,
};
use crate::stats::{EvaluationStats, StatsSnapshot};

/// Component id of the detection model.
pub const MODEL_COMPONENT: &str = "model";

/// Latency bounds for the model path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Timeout for a single model call
    #[serde(with = "duration_human")]
    pub model_call_timeout: Duration,

    /// Bound on the whole model path, retries and backoff included
    #[serde(with = "duration_human")]
    pub evaluation_deadline: Duration,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            model_call_timeout: Duration::from_secs(2),
            evaluation_deadline: Duration::from_secs(30),
        }
    }
}

/// A verdict and the mode whose strategy produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub verdict: AnomalyVerdict,
    pub mode: OperatingMode,
}

/// The anomaly evaluation service.
pub struct Guardian {
    config: RuntimeConfig,
    model: Arc<dyn DetectionModel>,
    model_component: ComponentId,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    executor: Arc<RetryExecutor>,
    modes: Arc<ModeController>,
    heuristic: HeuristicScorer,
    safe: SafeResponder,
    consensus: Option<QuorumConsensus>,
    publisher: Option<Arc<StatePublisher>>,
    stats: EvaluationStats,
    clock: Arc<dyn Clock>,
}

impl Guardian {
    pub fn builder() -> GuardianBuilder {
        GuardianBuilder::new()
    }

    /// Evaluate one telemetry sample.
    ///
    /// Always produces a verdict unless the sample itself is invalid.
    #[tracing::instrument(skip_all, fields(node_id = %sample.node_id))]
    pub async fn evaluate(&self, sample: &TelemetrySample) -> Result<EvaluationOutcome, SampleError> {
        self.stats.record_request();
        if let Err(e) = sample.validate() {
            self.stats.record_rejected();
            return Err(e);
        }

        let transitions = self.modes.snapshot().transitions;
        let mode = self.modes.run_cycle(&self.health, false);

        let outcome = match DetectionStrategy::from(mode) {
            DetectionStrategy::Model => self.evaluate_primary(sample).await?,
            DetectionStrategy::Heuristic => self.serve(OperatingMode::Heuristic, sample),
            DetectionStrategy::Safe => self.serve(OperatingMode::Safe, sample),
        };

        self.stats.record_verdict(outcome.mode);
        if self.modes.snapshot().transitions != transitions {
            self.publish_in_background();
        }
        Ok(outcome)
    }

    async fn evaluate_primary(&self, sample: &TelemetrySample) -> Result<EvaluationOutcome, SampleError> {
        let deadline = tokio::time::Instant::now() + self.config.evaluation.evaluation_deadline;
        let call_timeout = self.config.evaluation.model_call_timeout;
        let model = &self.model;
        let stats = &self.stats;

        let result = self
            .executor
            .execute(
                &self.model_component,
                &self.config.retry,
                Some(deadline),
                move |_| async move {
                    stats.record_model_call();
                    match tokio::time::timeout(call_timeout, model.score(sample)).await {
                        Ok(Ok(score)) if !score.score.is_finite() => {
                            Err(DependencyError::protocol("model returned a non-finite score"))
                        }
                        Ok(result) => result,
                        Err(_) => Err(DependencyError::timeout(call_timeout)),
                    }
                },
            )
            .await;

        match result {
            Ok(score) => {
                let verdict = self.model_verdict(sample, score);
                self.safe.remember(&verdict);
                Ok(EvaluationOutcome {
                    verdict,
                    mode: OperatingMode::Primary,
                })
            }
            Err(ResilienceError::Input(message)) => {
                self.stats.record_rejected();
                Err(SampleError::Rejected(message))
            }
            Err(error) => {
                let exhausted = error.is_exhaustion()
                    || self.breaker.state(&self.model_component) == CircuitState::Open;
                tracing::warn!(error = %error, exhausted, "Model path failed, serving fallback");
                self.stats.record_fallback();

                let mode = self.modes.run_cycle(&self.health, exhausted);
                // Still PRIMARY: the model failed this request without being given up on
                let serve_as = if mode == OperatingMode::Primary {
                    OperatingMode::Heuristic
                } else {
                    mode
                };
                Ok(self.serve(serve_as, sample))
            }
        }
    }

    fn model_verdict(&self, sample: &TelemetrySample, score: ModelScore) -> AnomalyVerdict {
        AnomalyVerdict {
            node_id: sample.node_id.clone(),
            is_anomalous: score.is_anomalous,
            score: score.score.clamp(0.0, 1.0),
            confidence: score.confidence.unwrap_or(0.9).clamp(0.0, 1.0),
            source: VerdictSource::Model,
            notes: vec![format!("scored by {}", self.model.name())],
            evaluated_at: self.clock.wall(),
        }
    }

    fn serve(&self, mode: OperatingMode, sample: &TelemetrySample) -> EvaluationOutcome {
        let now = self.clock.wall();
        let verdict = match mode {
            OperatingMode::Safe => self.safe.respond(sample, now),
            _ => self.heuristic.verdict(sample, now),
        };
        EvaluationOutcome { verdict, mode }
    }

    fn publish_in_background(&self) {
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        let mode = self.modes.snapshot();
        let health = self.health();
        tokio::spawn(async move {
            publisher.publish(&mode, &health).await;
        });
    }

    /// Write current mode and health to the coordination store, if attached.
    pub async fn publish_state(&self) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(&self.modes.snapshot(), &self.health()).await;
        }
    }

    /// Current mode and its transition history.
    pub fn current_mode(&self) -> SystemMode {
        self.modes.snapshot()
    }

    /// Health of every tracked component plus the mode dependencies.
    pub fn health(&self) -> BTreeMap<ComponentId, ComponentHealth> {
        let mut health = self.health.snapshot();
        let fallback = self.modes.config();
        for component in fallback
            .primary_dependencies
            .iter()
            .chain(&fallback.heuristic_dependencies)
            .chain(std::iter::once(&self.model_component))
        {
            if !health.contains_key(component) {
                health.insert(component.clone(), self.health.component_health(component));
            }
        }
        health
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.health.summary()
    }

    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.breaker.snapshots()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run a consensus round over the cluster transport.
    pub async fn propose(&self, proposal: Proposal) -> Result<ConsensusResult, ResilienceError> {
        match &self.consensus {
            Some(consensus) => consensus.propose(proposal).await,
            None => Err(ResilienceError::Input(
                "no cluster transport configured".to_string(),
            )),
        }
    }

    /// Build a recovery orchestrator wired to this service.
    ///
    /// The model's circuit is probed through the model's health check.
    pub fn recovery_orchestrator(&self, actions: Vec<RecoveryActionConfig>) -> RecoveryOrchestrator {
        let probe = ModelProbe::new(self.model.clone(), self.config.evaluation.model_call_timeout);
        let orchestrator = RecoveryOrchestrator::new(
            actions,
            self.breaker.clone(),
            self.health.clone(),
            self.modes.clone(),
        )
        .with_probe(self.model_component.clone(), Arc::new(probe))
        .with_clock(self.clock.clone());

        match &self.publisher {
            Some(publisher) => orchestrator.with_publisher(publisher.clone()),
            None => orchestrator,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn mode_controller(&self) -> &Arc<ModeController> {
        &self.modes
    }
}

/// Builder for [`Guardian`].
pub struct GuardianBuilder {
    config: RuntimeConfig,
    model: Option<Arc<dyn DetectionModel>>,
    transport: Option<Arc<dyn ClusterTransport>>,
    store: Option<Arc<dyn CoordinationStore>>,
    clock: Option<Arc<dyn Clock>>,
    jitter: Option<JitterSource>,
}

impl GuardianBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            model: None,
            transport: None,
            store: None,
            clock: None,
            jitter: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the detection model (required).
    pub fn model(mut self, model: Arc<dyn DetectionModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Enable consensus over this transport.
    pub fn transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Publish mode and health to this store.
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the jitter source (otherwise seeded from `jitter_seed` or entropy).
    pub fn jitter(mut self, jitter: JitterSource) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the service.
    pub fn build(self) -> Result<Guardian, ConfigError> {
        let config = self.config;
        config.validate()?;
        let model = self
            .model
            .ok_or_else(|| ConfigError::Invalid("no detection model set".to_string()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let health = Arc::new(HealthMonitor::with_clock(config.health.clone(), clock.clone()));
        let breaker = config
            .circuit_overrides
            .iter()
            .fold(
                CircuitBreaker::with_clock(config.circuit_breaker.clone(), clock.clone()),
                |breaker, (component, cfg)| breaker.with_override(component.clone(), cfg.clone()),
            )
            .with_observer(health.clone());
        let breaker = Arc::new(breaker);

        let jitter = self.jitter.unwrap_or_else(|| match config.jitter_seed {
            Some(seed) => JitterSource::seeded(seed),
            None => JitterSource::from_entropy(),
        });
        let executor = Arc::new(RetryExecutor::new(breaker.clone(), health.clone(), jitter));
        let modes = Arc::new(ModeController::with_clock(config.fallback.clone(), clock.clone()));

        let consensus = self.transport.map(|transport| {
            QuorumConsensus::new(
                config.node_id.clone(),
                transport,
                executor.clone(),
                health.clone(),
                config.consensus.clone(),
            )
            .with_clock(clock.clone())
        });

        let publisher = self
            .store
            .filter(|_| config.publisher.enabled)
            .map(|store| {
                Arc::new(StatePublisher::new(
                    store,
                    config.node_id.clone(),
                    config.publisher.clone(),
                ))
            });

        tracing::info!(node_id = %config.node_id, model = model.name(), "Guardian ready");

        Ok(Guardian {
            heuristic: HeuristicScorer::new(config.heuristic.clone()),
            safe: SafeResponder::new(config.fallback.safe_verdict),
            model_component: ComponentId::new(MODEL_COMPONENT),
            stats: EvaluationStats::new(),
            config,
            model,
            breaker,
            health,
            executor,
            modes,
            consensus,
            publisher,
            clock,
        })
    }
}

impl Default for GuardianBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::store::mode_key;
    use crate::collaborators::MemoryStore;
    use crate::health::HealthStatus;
    use crate::recovery::{RecoveryActionKind, RecoveryCondition};
    use crate::resilience::{BackoffConfig, CircuitBreakerConfig, JitterStrategy, RetryPolicy};
    use astraguard_core::SafeVerdictPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Clone)]
    enum Behavior {
        Scores(f64),
        Fails,
        Hangs,
        RejectsInput,
    }

    struct MockModel {
        behavior: Mutex<Behavior>,
        calls: AtomicU32,
    }

    impl MockModel {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: Mutex::new(behavior),
                calls: AtomicU32::new(0),
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock() = behavior;
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DetectionModel for MockModel {
        fn name(&self) -> &str {
            "mock-model"
        }

        async fn score(&self, _sample: &TelemetrySample) -> Result<ModelScore, DependencyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior.lock().clone();
            match behavior {
                Behavior::Scores(score) => Ok(ModelScore {
                    score,
                    is_anomalous: score >= 0.5,
                    confidence: Some(0.95),
                }),
                Behavior::Fails => Err(DependencyError::connection("model backend refused")),
                Behavior::Hangs => std::future::pending().await,
                Behavior::RejectsInput => Err(DependencyError::invalid_input("wheel_speed required")),
            }
        }

        async fn health_check(&self) -> Result<(), DependencyError> {
            let behavior = self.behavior.lock().clone();
            match behavior {
                Behavior::Scores(_) => Ok(()),
                _ => Err(DependencyError::unavailable("model backend down")),
            }
        }
    }

    fn sample() -> TelemetrySample {
        TelemetrySample::new("sat-1")
            .with_voltage(8.1)
            .with_temperature(31.0)
            .with_gyro(0.01)
            .with_current(1.2)
            .with_wheel_speed(4.0)
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            retry: RetryPolicy {
                max_attempts: 10,
                backoff: BackoffConfig {
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                    jitter: JitterStrategy::Equal,
                },
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                ..Default::default()
            },
            evaluation: EvaluationConfig {
                model_call_timeout: Duration::from_millis(200),
                evaluation_deadline: Duration::from_secs(5),
            },
            ..Default::default()
        }
    }

    fn guardian(model: Arc<MockModel>, config: RuntimeConfig) -> Guardian {
        Guardian::builder()
            .config(config)
            .model(model)
            .jitter(JitterSource::seeded(5))
            .build()
            .unwrap()
    }

    fn force_safe(guardian: &Guardian) {
        let model = ComponentId::new(MODEL_COMPONENT);
        for _ in 0..5 {
            guardian.breaker().record_failure(&model);
        }
        guardian.health_monitor().set_cluster_reachable(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_serves_model_verdict() {
        let model = MockModel::new(Behavior::Scores(0.8));
        let guardian = guardian(model.clone(), fast_config());

        let outcome = guardian.evaluate(&sample()).await.unwrap();
        assert_eq!(outcome.mode, OperatingMode::Primary);
        assert_eq!(outcome.verdict.source, VerdictSource::Model);
        assert!(outcome.verdict.is_anomalous);
        assert_eq!(outcome.verdict.confidence, 0.95);
        assert_eq!(model.calls(), 1);

        let stats = guardian.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.model_verdicts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_sample_is_rejected_without_model_call() {
        let model = MockModel::new(Behavior::Scores(0.1));
        let guardian = guardian(model.clone(), fast_config());

        let bad = sample().with_voltage(f64::NAN);
        assert!(matches!(
            guardian.evaluate(&bad).await,
            Err(SampleError::NonFinite { field: "voltage", .. })
        ));
        assert_eq!(model.calls(), 0);
        assert_eq!(guardian.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_rejected_input_does_not_trip_breaker() {
        let model = MockModel::new(Behavior::RejectsInput);
        let guardian = guardian(model.clone(), fast_config());

        for _ in 0..10 {
            assert!(matches!(
                guardian.evaluate(&sample()).await,
                Err(SampleError::Rejected(_))
            ));
        }

        assert_eq!(model.calls(), 10);
        assert_eq!(
            guardian.breaker().state(&ComponentId::new(MODEL_COMPONENT)),
            CircuitState::Closed
        );
        assert_eq!(guardian.current_mode().current, OperatingMode::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_failures_cascade_to_heuristic() {
        let model = MockModel::new(Behavior::Fails);
        let guardian = guardian(model.clone(), fast_config());
        let model_id = ComponentId::new(MODEL_COMPONENT);

        let first = guardian.evaluate(&sample()).await.unwrap();

        // Breaker opened on the 5th failure; the 6th attempt failed fast
        assert_eq!(model.calls(), 5);
        assert_eq!(guardian.breaker().state(&model_id), CircuitState::Open);
        assert_eq!(
            guardian.health()[&model_id].status,
            HealthStatus::Critical
        );
        assert_eq!(first.mode, OperatingMode::Heuristic);
        assert_eq!(first.verdict.source, VerdictSource::Heuristic);

        let mode = guardian.current_mode();
        assert_eq!(mode.current, OperatingMode::Heuristic);
        assert_eq!(mode.history.len(), 1);
        assert_eq!(mode.history[0].from, OperatingMode::Primary);

        for _ in 0..9 {
            let outcome = guardian.evaluate(&sample()).await.unwrap();
            assert_eq!(outcome.mode, OperatingMode::Heuristic);
            assert_eq!(outcome.verdict.source, VerdictSource::Heuristic);
        }
        assert_eq!(model.calls(), 5);

        let stats = guardian.stats();
        assert_eq!(stats.heuristic_verdicts, 10);
        assert_eq!(stats.fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_mode_never_calls_model() {
        let model = MockModel::new(Behavior::Hangs);
        let guardian = guardian(model.clone(), fast_config());
        force_safe(&guardian);

        let start = Instant::now();
        for _ in 0..20 {
            let outcome = guardian.evaluate(&sample()).await.unwrap();
            assert_eq!(outcome.mode, OperatingMode::Safe);
            assert_eq!(outcome.verdict.source, VerdictSource::Safe);
            assert!(outcome.verdict.is_anomalous);
        }

        assert_eq!(model.calls(), 0);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_mode_replays_last_known_good() {
        let model = MockModel::new(Behavior::Scores(0.1));
        let mut config = fast_config();
        config.fallback.safe_verdict = SafeVerdictPolicy::LastKnownGood;
        let guardian = guardian(model.clone(), config);

        let primary = guardian.evaluate(&sample()).await.unwrap();
        assert!(!primary.verdict.is_anomalous);

        force_safe(&guardian);
        let safe = guardian.evaluate(&sample()).await.unwrap();
        assert_eq!(safe.mode, OperatingMode::Safe);
        assert_eq!(safe.verdict.source, VerdictSource::LastKnownGood);
        assert!(!safe.verdict.is_anomalous);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_model_is_bounded_by_deadline() {
        let model = MockModel::new(Behavior::Hangs);
        let mut config = fast_config();
        config.evaluation = EvaluationConfig {
            model_call_timeout: Duration::from_millis(100),
            evaluation_deadline: Duration::from_millis(250),
        };
        let guardian = guardian(model.clone(), config);

        let start = Instant::now();
        let outcome = guardian.evaluate(&sample()).await.unwrap();

        assert!(start.elapsed() <= Duration::from_millis(260));
        assert_eq!(outcome.mode, OperatingMode::Heuristic);
        assert_eq!(outcome.verdict.source, VerdictSource::Heuristic);
        // Not given up on yet: still PRIMARY for the next request
        assert_eq!(guardian.current_mode().current, OperatingMode::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_to_primary_after_model_returns() {
        let model = MockModel::new(Behavior::Fails);
        let mut config = fast_config();
        config.health.window = Duration::from_secs(1);
        let guardian = guardian(model.clone(), config);

        guardian.evaluate(&sample()).await.unwrap();
        assert_eq!(guardian.current_mode().current, OperatingMode::Heuristic);

        model.set(Behavior::Scores(0.2));
        // Let the failures age out of the health window
        tokio::time::sleep(Duration::from_secs(2)).await;

        let recovery = guardian.recovery_orchestrator(vec![
            RecoveryActionConfig::new("probe", MODEL_COMPONENT, RecoveryActionKind::ProbeCircuit)
                .when(RecoveryCondition::CircuitOpen),
            RecoveryActionConfig::new("upgrade", MODEL_COMPONENT, RecoveryActionKind::RequestUpgrade)
                .when(RecoveryCondition::StatusIs(HealthStatus::Healthy))
                .cooldown(0),
        ]);

        let mut modes = Vec::new();
        for _ in 0..4 {
            modes.push(recovery.tick().await.mode);
        }
        assert_eq!(
            modes,
            vec![
                OperatingMode::Heuristic,
                OperatingMode::Heuristic,
                OperatingMode::Primary,
                OperatingMode::Primary,
            ]
        );

        let outcome = guardian.evaluate(&sample()).await.unwrap();
        assert_eq!(outcome.verdict.source, VerdictSource::Model);
    }

    #[tokio::test(start_paused = true)]
    async fn test_propose_without_transport() {
        let guardian = guardian(MockModel::new(Behavior::Scores(0.1)), fast_config());
        let proposal = Proposal::new("p-1", "degraded")
            .with_participants([astraguard_core::NodeId::new("n1")]);
        assert!(matches!(
            guardian.propose(proposal).await,
            Err(ResilienceError::Input(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_change_is_published() {
        let store = Arc::new(MemoryStore::default());
        let guardian = Guardian::builder()
            .config(fast_config())
            .model(MockModel::new(Behavior::Fails))
            .store(store.clone())
            .build()
            .unwrap();

        guardian.evaluate(&sample()).await.unwrap();
        guardian.publish_state().await;

        let key = mode_key(&guardian.config().node_id);
        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored["current"], "HEURISTIC");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_downgrade_once() {
        let mut config = fast_config();
        config.retry.backoff.base_delay = Duration::from_millis(1);
        config.retry.backoff.max_delay = Duration::from_millis(5);
        let guardian = Arc::new(guardian(MockModel::new(Behavior::Fails), config));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let guardian = guardian.clone();
            tasks.spawn(async move { guardian.evaluate(&sample()).await });
        }
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap().unwrap();
            assert_ne!(outcome.mode, OperatingMode::Safe);
        }

        let mode = guardian.current_mode();
        assert_eq!(mode.current, OperatingMode::Heuristic);
        assert_eq!(mode.transitions, 1);
        let downgrades: Vec<_> = mode
            .history
            .iter()
            .filter(|t| t.from == OperatingMode::Primary && t.to == OperatingMode::Heuristic)
            .collect();
        assert_eq!(downgrades.len(), 1);
        assert!(mode.history.iter().all(|t| t.to != OperatingMode::Safe));
        assert_eq!(guardian.stats().requests, 32);
    }

    #[test]
    fn test_builder_requires_model() {
        assert!(matches!(
            Guardian::builder().build(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
