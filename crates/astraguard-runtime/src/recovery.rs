//! Recovery orchestrator: scheduled actions that move the system back
//! toward PRIMARY.
//!
//! Runs on its own cadence, independent of request flow. Each tick, every
//! configured action either sits out its cooldown (counted in ticks) or has
//! its condition checked against the target component's health and, when
//! satisfied, is executed. The tick then runs one mode cycle so upgrade
//! confirmations advance without traffic, and publishes state if a
//! publisher is attached.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use astraguard_core::{ComponentId, OperatingMode};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{DetectionModel, StatePublisher};
use crate::config::duration_human;
use crate::error::DependencyError;
use crate::health::{ComponentHealth, HealthMonitor, HealthStatus};
use crate::resilience::{CircuitBreaker, CircuitState, ModeController};

/// What a recovery action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    /// Force an open circuit half-open and run the component's probe through it
    ProbeCircuit,

    /// Force the circuit closed and drop the component's health window
    ResetCircuit,

    /// Ask the mode controller for a one-level upgrade
    RequestUpgrade,
}

/// Programmatic condition over a component's health.
pub type ConditionFn = Arc<dyn Fn(&ComponentHealth) -> bool + Send + Sync>;

/// When an action fires.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryCondition {
    #[default]
    Always,
    CircuitOpen,
    CircuitHalfOpen,
    StatusIs(HealthStatus),

    /// Status is this good or better
    StatusAtMost(HealthStatus),

    #[serde(skip)]
    Custom(ConditionFn),
}

impl RecoveryCondition {
    pub fn custom(predicate: impl Fn(&ComponentHealth) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, health: &ComponentHealth) -> bool {
        match self {
            Self::Always => true,
            Self::CircuitOpen => health.circuit == CircuitState::Open,
            Self::CircuitHalfOpen => health.circuit == CircuitState::HalfOpen,
            Self::StatusIs(status) => health.status == *status,
            Self::StatusAtMost(status) => health.status <= *status,
            Self::Custom(predicate) => predicate(health),
        }
    }
}

impl fmt::Debug for RecoveryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::CircuitOpen => write!(f, "CircuitOpen"),
            Self::CircuitHalfOpen => write!(f, "CircuitHalfOpen"),
            Self::StatusIs(status) => write!(f, "StatusIs({:?})", status),
            Self::StatusAtMost(status) => write!(f, "StatusAtMost({:?})", status),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl PartialEq for RecoveryCondition {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::StatusIs(a), Self::StatusIs(b)) | (Self::StatusAtMost(a), Self::StatusAtMost(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

/// A configured recovery action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryActionConfig {
    pub action_id: String,
    pub target_component: ComponentId,
    pub kind: RecoveryActionKind,

    /// Parameterized conditions are written as `status_is: HEALTHY`
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub condition: RecoveryCondition,

    /// Ticks to sit out after executing
    #[serde(default = "default_cooldown_ticks")]
    pub cooldown_ticks: u32,
}

fn default_cooldown_ticks() -> u32 {
    3
}

impl RecoveryActionConfig {
    pub fn new(
        action_id: impl Into<String>,
        target_component: impl Into<ComponentId>,
        kind: RecoveryActionKind,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            target_component: target_component.into(),
            kind,
            condition: RecoveryCondition::Always,
            cooldown_ticks: default_cooldown_ticks(),
        }
    }

    pub fn when(mut self, condition: RecoveryCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn cooldown(mut self, ticks: u32) -> Self {
        self.cooldown_ticks = ticks;
        self
    }
}

/// Recovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Time between ticks of the background loop
    #[serde(with = "duration_human")]
    pub interval: Duration,

    pub actions: Vec<RecoveryActionConfig>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            actions: vec![
                RecoveryActionConfig::new("probe-model", "model", RecoveryActionKind::ProbeCircuit)
                    .when(RecoveryCondition::CircuitOpen),
                RecoveryActionConfig::new("upgrade-on-healthy-model", "model", RecoveryActionKind::RequestUpgrade)
                    .when(RecoveryCondition::StatusIs(HealthStatus::Healthy)),
            ],
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("recovery.interval must be positive".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for action in &self.actions {
            if action.action_id.is_empty() {
                return Err("recovery action_id must not be empty".to_string());
            }
            if !seen.insert(action.action_id.as_str()) {
                return Err(format!("duplicate recovery action_id {}", action.action_id));
            }
        }
        Ok(())
    }
}

/// Runtime state of a recovery action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAction {
    #[serde(flatten)]
    pub config: RecoveryActionConfig,
    pub cooldown_remaining: u32,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

impl RecoveryAction {
    fn new(config: RecoveryActionConfig) -> Self {
        Self {
            config,
            cooldown_remaining: 0,
            last_attempted_at: None,
            attempt_count: 0,
        }
    }
}

/// Health check run through the breaker by `probe_circuit`.
#[async_trait]
pub trait RecoveryProbe: Send + Sync {
    async fn probe(&self) -> Result<(), DependencyError>;
}

/// Probes a detection model through its health check.
pub struct ModelProbe {
    model: Arc<dyn DetectionModel>,
    timeout: Duration,
}

impl ModelProbe {
    pub fn new(model: Arc<dyn DetectionModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }
}

#[async_trait]
impl RecoveryProbe for ModelProbe {
    async fn probe(&self) -> Result<(), DependencyError> {
        match tokio::time::timeout(self.timeout, self.model.health_check()).await {
            Ok(result) => result,
            Err(_) => Err(DependencyError::timeout(self.timeout)),
        }
    }
}

/// Result of executing one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Probes passed; circuit is now in `state`
    Probed { state: CircuitState },
    ProbeFailed { error: String },
    NoProbe,
    Reset,
    UpgradeRequested,
    AlreadyPrimary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub action_id: String,
    pub outcome: ActionOutcome,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub tick: u64,
    pub executed: Vec<ExecutedAction>,
    pub mode: OperatingMode,
}

/// Runs recovery actions on a cadence.
pub struct RecoveryOrchestrator {
    actions: Mutex<Vec<RecoveryAction>>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    modes: Arc<ModeController>,
    probes: HashMap<ComponentId, Arc<dyn RecoveryProbe>>,
    publisher: Option<Arc<StatePublisher>>,
    clock: Arc<dyn Clock>,
    ticks: AtomicU64,
}

impl RecoveryOrchestrator {
    pub fn new(
        actions: Vec<RecoveryActionConfig>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthMonitor>,
        modes: Arc<ModeController>,
    ) -> Self {
        Self {
            actions: Mutex::new(actions.into_iter().map(RecoveryAction::new).collect()),
            breaker,
            health,
            modes,
            probes: HashMap::new(),
            publisher: None,
            clock: Arc::new(SystemClock),
            ticks: AtomicU64::new(0),
        }
    }

    /// Register the probe used by `probe_circuit` actions on `component`.
    pub fn with_probe(mut self, component: ComponentId, probe: Arc<dyn RecoveryProbe>) -> Self {
        self.probes.insert(component, probe);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<StatePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current state of every action.
    pub async fn actions(&self) -> Vec<RecoveryAction> {
        self.actions.lock().await.clone()
    }

    /// Run one round of recovery.
    #[tracing::instrument(skip_all, fields(tick = tracing::field::Empty))]
    pub async fn tick(&self) -> RecoveryReport {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("tick", tick);

        let mut executed = Vec::new();
        {
            let mut actions = self.actions.lock().await;
            for action in actions.iter_mut() {
                if action.cooldown_remaining > 0 {
                    action.cooldown_remaining -= 1;
                    continue;
                }

                let health = self.health.component_health(&action.config.target_component);
                if !action.config.condition.matches(&health) {
                    continue;
                }

                let outcome = self.execute(&action.config).await;
                tracing::info!(
                    action_id = %action.config.action_id,
                    component = %action.config.target_component,
                    outcome = ?outcome,
                    "Recovery action executed"
                );

                action.cooldown_remaining = action.config.cooldown_ticks;
                action.attempt_count += 1;
                action.last_attempted_at = Some(self.clock.wall());
                executed.push(ExecutedAction {
                    action_id: action.config.action_id.clone(),
                    outcome,
                });
            }
        }

        let mode = self.modes.run_cycle(&self.health, false);

        if let Some(publisher) = &self.publisher {
            publisher
                .publish(&self.modes.snapshot(), &self.health.snapshot())
                .await;
        }

        RecoveryReport { tick, executed, mode }
    }

    async fn execute(&self, action: &RecoveryActionConfig) -> ActionOutcome {
        let component = &action.target_component;
        match action.kind {
            RecoveryActionKind::ProbeCircuit => self.probe(component).await,
            RecoveryActionKind::ResetCircuit => {
                self.breaker.reset(component);
                self.health.clear(component);
                ActionOutcome::Reset
            }
            RecoveryActionKind::RequestUpgrade => {
                let reason = format!("recovery action {}", action.action_id);
                if self.modes.request_upgrade(&reason) {
                    ActionOutcome::UpgradeRequested
                } else {
                    ActionOutcome::AlreadyPrimary
                }
            }
        }
    }

    async fn probe(&self, component: &ComponentId) -> ActionOutcome {
        let Some(probe) = self.probes.get(component) else {
            return ActionOutcome::NoProbe;
        };

        self.breaker.force_half_open(component);
        let probes_needed = self.breaker.snapshot(component).success_threshold.max(1);

        for _ in 0..probes_needed {
            // A request-path probe may already hold the slot
            let Ok(permit) = self.breaker.try_acquire(component) else {
                break;
            };

            match probe.probe().await {
                Ok(()) => {
                    permit.success();
                    self.health.record_success(component);
                }
                Err(e) if e.class.is_dependency_failure() => {
                    permit.failure();
                    self.health.record_failure(component);
                    return ActionOutcome::ProbeFailed { error: e.to_string() };
                }
                Err(e) => {
                    permit.release();
                    return ActionOutcome::ProbeFailed { error: e.to_string() };
                }
            }

            if self.breaker.state(component) == CircuitState::Closed {
                break;
            }
        }

        ActionOutcome::Probed {
            state: self.breaker.state(component),
        }
    }

    /// Run [`tick`](Self::tick) every `interval` until the handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> RecoveryHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Recovery loop stopped");
        });

        RecoveryHandle { shutdown, task }
    }
}

/// Handle to a spawned recovery loop.
pub struct RecoveryHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RecoveryHandle {
    /// Stop the loop and wait for the in-progress tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::health::HealthConfig;
    use crate::resilience::{CircuitBreakerConfig, FallbackConfig};
    use std::sync::atomic::AtomicU32;

    struct ScriptedProbe {
        healthy: bool,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RecoveryProbe for ScriptedProbe {
        async fn probe(&self) -> Result<(), DependencyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(())
            } else {
                Err(DependencyError::connection("still down"))
            }
        }
    }

    struct Fixture {
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthMonitor>,
        modes: Arc<ModeController>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let health = Arc::new(HealthMonitor::with_clock(HealthConfig::default(), clock.clone()));
        let breaker = Arc::new(
            CircuitBreaker::with_clock(
                CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..Default::default()
                },
                clock.clone(),
            )
            .with_observer(health.clone()),
        );
        let modes = Arc::new(ModeController::with_clock(FallbackConfig::default(), clock));
        Fixture {
            breaker,
            health,
            modes,
        }
    }

    fn model() -> ComponentId {
        ComponentId::new("model")
    }

    fn orchestrator(fx: &Fixture, actions: Vec<RecoveryActionConfig>) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(actions, fx.breaker.clone(), fx.health.clone(), fx.modes.clone())
    }

    #[tokio::test]
    async fn test_cooldown_counts_ticks() {
        let fx = fixture();
        fx.modes.run_cycle(&fx.health, true);
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("nudge", "model", RecoveryActionKind::RequestUpgrade).cooldown(2)],
        );

        let executed: Vec<usize> = {
            let mut counts = Vec::new();
            for _ in 0..4 {
                counts.push(recovery.tick().await.executed.len());
            }
            counts
        };

        assert_eq!(executed, vec![1, 0, 0, 1]);
        let actions = recovery.actions().await;
        assert_eq!(actions[0].attempt_count, 2);
        assert_eq!(actions[0].cooldown_remaining, 2);
        assert!(actions[0].last_attempted_at.is_some());
    }

    #[tokio::test]
    async fn test_unmet_condition_does_not_start_cooldown() {
        let fx = fixture();
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("probe", "model", RecoveryActionKind::ProbeCircuit)
                .when(RecoveryCondition::CircuitOpen)],
        );

        let report = recovery.tick().await;
        assert!(report.executed.is_empty());
        assert_eq!(recovery.actions().await[0].cooldown_remaining, 0);
    }

    #[tokio::test]
    async fn test_probe_closes_open_circuit() {
        let fx = fixture();
        fx.breaker.record_failure(&model());
        let probe = ScriptedProbe::new(true);
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("probe", "model", RecoveryActionKind::ProbeCircuit)
                .when(RecoveryCondition::CircuitOpen)],
        )
        .with_probe(model(), probe.clone());

        let report = recovery.tick().await;
        assert_eq!(
            report.executed[0].outcome,
            ActionOutcome::Probed {
                state: CircuitState::Closed
            }
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.breaker.state(&model()), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_circuit() {
        let fx = fixture();
        fx.breaker.record_failure(&model());
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("probe", "model", RecoveryActionKind::ProbeCircuit)],
        )
        .with_probe(model(), ScriptedProbe::new(false));

        let report = recovery.tick().await;
        assert!(matches!(
            report.executed[0].outcome,
            ActionOutcome::ProbeFailed { .. }
        ));
        let snapshot = fx.breaker.snapshot(&model());
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.open_duration, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_probe_without_registered_probe() {
        let fx = fixture();
        fx.breaker.record_failure(&model());
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("probe", "model", RecoveryActionKind::ProbeCircuit)],
        );

        let report = recovery.tick().await;
        assert_eq!(report.executed[0].outcome, ActionOutcome::NoProbe);
        assert_eq!(fx.breaker.state(&model()), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset_circuit() {
        let fx = fixture();
        fx.breaker.record_failure(&model());
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("reset", "model", RecoveryActionKind::ResetCircuit)
                .when(RecoveryCondition::StatusIs(HealthStatus::Critical))],
        );

        recovery.tick().await;
        assert_eq!(fx.breaker.state(&model()), CircuitState::Closed);
        assert_eq!(fx.health.component_health(&model()).status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_upgrade_after_confirmation_ticks() {
        let fx = fixture();
        fx.modes.run_cycle(&fx.health, true);
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("upgrade", "model", RecoveryActionKind::RequestUpgrade)
                .when(RecoveryCondition::StatusAtMost(HealthStatus::Healthy))
                .cooldown(10)],
        );

        assert_eq!(recovery.tick().await.mode, OperatingMode::Heuristic);
        assert_eq!(recovery.tick().await.mode, OperatingMode::Heuristic);
        assert_eq!(recovery.tick().await.mode, OperatingMode::Primary);
    }

    #[tokio::test]
    async fn test_custom_condition() {
        let fx = fixture();
        fx.modes.run_cycle(&fx.health, true);
        let recovery = orchestrator(
            &fx,
            vec![RecoveryActionConfig::new("custom", "model", RecoveryActionKind::RequestUpgrade)
                .when(RecoveryCondition::custom(|health| health.samples >= 2))],
        );

        assert!(recovery.tick().await.executed.is_empty());
        fx.health.record_success(&model());
        fx.health.record_success(&model());
        assert_eq!(recovery.tick().await.executed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_ticks_until_shutdown() {
        let fx = fixture();
        let recovery = Arc::new(orchestrator(&fx, Vec::new()));
        let handle = recovery.clone().spawn(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        handle.shutdown().await;

        let ticks = recovery.ticks.load(Ordering::SeqCst);
        assert!((3..=4).contains(&ticks));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recovery.ticks.load(Ordering::SeqCst), ticks);
    }

    #[test]
    fn test_condition_serde() {
        let action: RecoveryActionConfig = serde_yaml::from_str(
            "action_id: probe\ntarget_component: model\nkind: probe_circuit\ncondition:\n  status_is: CRITICAL\n",
        )
        .unwrap();
        assert_eq!(action.condition, RecoveryCondition::StatusIs(HealthStatus::Critical));
        assert_eq!(action.cooldown_ticks, 3);

        let always: RecoveryActionConfig =
            serde_yaml::from_str("action_id: up\ntarget_component: model\nkind: request_upgrade\n").unwrap();
        assert_eq!(always.condition, RecoveryCondition::Always);
    }

    #[test]
    fn test_condition_yaml_round_trip() {
        let actions = vec![
            RecoveryActionConfig::new("upgrade", "model", RecoveryActionKind::RequestUpgrade)
                .when(RecoveryCondition::StatusIs(HealthStatus::Healthy)),
            RecoveryActionConfig::new("probe", "model", RecoveryActionKind::ProbeCircuit)
                .when(RecoveryCondition::CircuitOpen),
        ];

        let yaml = serde_yaml::to_string(&actions).unwrap();
        assert!(yaml.contains("status_is: HEALTHY"), "{yaml}");
        assert!(yaml.contains("condition: circuit_open"), "{yaml}");
        assert!(!yaml.contains('!'), "{yaml}");

        let parsed: Vec<RecoveryActionConfig> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, actions);
    }

    #[test]
    fn test_condition_through_json_value() {
        let value = serde_json::json!({
            "action_id": "upgrade",
            "target_component": "model",
            "kind": "request_upgrade",
            "condition": { "status_at_most": "DEGRADED" }
        });
        let action: RecoveryActionConfig = serde_json::from_value(value).unwrap();
        assert_eq!(action.condition, RecoveryCondition::StatusAtMost(HealthStatus::Degraded));
    }
}
