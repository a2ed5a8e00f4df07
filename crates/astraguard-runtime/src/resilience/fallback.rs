//! Fallback mode manager: PRIMARY -> HEURISTIC -> SAFE.
//!
//! The controller owns the single process-wide [`SystemMode`]. Each cycle
//! reads health and decides whether to move:
//!
//! - Downgrade one level when the current mode's dependencies are CRITICAL,
//!   or when the primary path gave up (breaker open or retries exhausted).
//! - Jump straight to SAFE only when system health is CRITICAL and the
//!   cluster is unreachable.
//! - Upgrade one level only after an explicit request, once the target
//!   mode's dependencies have been HEALTHY for `upgrade_confirmations`
//!   consecutive cycles.
//!
//! Cycles plan against a snapshot and apply only if neither the mode nor
//! health changed in between; otherwise they re-plan against fresh state.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use astraguard_core::{ComponentId, OperatingMode, SafeVerdictPolicy};

use crate::clock::{Clock, SystemClock};
use crate::health::{HealthMonitor, HealthStatus};

const MAX_CAS_RETRIES: usize = 8;

/// Detection strategy served in a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// Remote model through retries and the circuit breaker
    Model,

    /// Local threshold scorer
    Heuristic,

    /// Fixed conservative verdict, no collaborator calls
    Safe,
}

impl From<OperatingMode> for DetectionStrategy {
    fn from(mode: OperatingMode) -> Self {
        match mode {
            OperatingMode::Primary => Self::Model,
            OperatingMode::Heuristic => Self::Heuristic,
            OperatingMode::Safe => Self::Safe,
        }
    }
}

/// Fallback configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Consecutive healthy cycles needed after an upgrade request
    pub upgrade_confirmations: u32,

    /// Number of past transitions kept
    pub history_capacity: usize,

    pub safe_verdict: SafeVerdictPolicy,

    /// Components PRIMARY depends on
    pub primary_dependencies: Vec<ComponentId>,

    /// Components HEURISTIC depends on
    pub heuristic_dependencies: Vec<ComponentId>,

    /// Allow PRIMARY/HEURISTIC -> SAFE on critical health with the cluster unreachable
    pub emergency_safe: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            upgrade_confirmations: 3,
            history_capacity: 32,
            safe_verdict: SafeVerdictPolicy::default(),
            primary_dependencies: vec![ComponentId::new("model")],
            heuristic_dependencies: Vec::new(),
            emergency_safe: true,
        }
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.upgrade_confirmations == 0 {
            return Err("fallback.upgrade_confirmations must be at least 1".to_string());
        }
        if self.history_capacity == 0 {
            return Err("fallback.history_capacity must be at least 1".to_string());
        }
        Ok(())
    }

    fn dependencies(&self, mode: OperatingMode) -> &[ComponentId] {
        match mode {
            OperatingMode::Primary => &self.primary_dependencies,
            OperatingMode::Heuristic => &self.heuristic_dependencies,
            OperatingMode::Safe => &[],
        }
    }
}

/// One mode change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: OperatingMode,
    pub to: OperatingMode,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// The system's operating mode and its recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMode {
    pub current: OperatingMode,
    pub entered_at: DateTime<Utc>,
    pub reason: String,

    /// Most recent transitions, oldest first
    pub history: VecDeque<ModeTransition>,

    /// Transitions since process start (history may have dropped some)
    pub transitions: u64,
}

impl SystemMode {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            current: OperatingMode::Primary,
            entered_at: at,
            reason: "startup".to_string(),
            history: VecDeque::new(),
            transitions: 0,
        }
    }

    pub fn strategy(&self) -> DetectionStrategy {
        self.current.into()
    }
}

struct ModeState {
    mode: SystemMode,
    epoch: u64,
    upgrade_requested: bool,
    healthy_streak: u32,
}

enum Plan {
    Stay { healthy_streak: u32 },
    Move { to: OperatingMode, reason: String },
}

/// Owns the process-wide operating mode.
pub struct ModeController {
    config: FallbackConfig,
    state: RwLock<ModeState>,
    clock: Arc<dyn Clock>,
}

impl ModeController {
    pub fn new(config: FallbackConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: FallbackConfig, clock: Arc<dyn Clock>) -> Self {
        let mode = SystemMode::new(clock.wall());
        Self {
            config,
            state: RwLock::new(ModeState {
                mode,
                epoch: 0,
                upgrade_requested: false,
                healthy_streak: 0,
            }),
            clock,
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    pub fn snapshot(&self) -> SystemMode {
        self.state.read().mode.clone()
    }

    pub fn current(&self) -> OperatingMode {
        self.state.read().mode.current
    }

    pub fn upgrade_pending(&self) -> bool {
        self.state.read().upgrade_requested
    }

    /// Ask for a one-level upgrade. Advisory: the upgrade happens only after
    /// the confirmation window. Returns false in PRIMARY.
    pub fn request_upgrade(&self, reason: &str) -> bool {
        let mut state = self.state.write();
        if state.mode.current.upgraded().is_none() {
            return false;
        }
        if !state.upgrade_requested {
            state.upgrade_requested = true;
            state.healthy_streak = 0;
            state.epoch += 1;
            tracing::info!(mode = %state.mode.current, reason, "Upgrade requested");
        }
        true
    }

    /// Run one evaluation cycle and return the mode to serve.
    ///
    /// `primary_exhausted` reports that the primary path just gave up on the
    /// model (breaker open or retries exhausted).
    pub fn run_cycle(&self, health: &HealthMonitor, primary_exhausted: bool) -> OperatingMode {
        for _ in 0..MAX_CAS_RETRIES {
            let (epoch, current, requested, streak) = {
                let state = self.state.read();
                (
                    state.epoch,
                    state.mode.current,
                    state.upgrade_requested,
                    state.healthy_streak,
                )
            };
            let generation = health.generation();
            let plan = self.plan(health, current, requested, streak, primary_exhausted);

            let mut state = self.state.write();
            if state.epoch != epoch || health.generation() != generation {
                continue;
            }
            self.apply(&mut state, plan);
            return state.mode.current;
        }

        // Contended: plan under the lock so the cycle still makes progress
        let mut state = self.state.write();
        let plan = self.plan(
            health,
            state.mode.current,
            state.upgrade_requested,
            state.healthy_streak,
            primary_exhausted,
        );
        self.apply(&mut state, plan);
        state.mode.current
    }

    fn plan(
        &self,
        health: &HealthMonitor,
        current: OperatingMode,
        upgrade_requested: bool,
        healthy_streak: u32,
        primary_exhausted: bool,
    ) -> Plan {
        let summary = health.summary();
        let emergency = self.config.emergency_safe
            && summary.status == HealthStatus::Critical
            && !summary.cluster_reachable;

        if emergency {
            if current == OperatingMode::Safe {
                return Plan::Stay { healthy_streak: 0 };
            }
            return Plan::Move {
                to: OperatingMode::Safe,
                reason: "health critical and cluster unreachable".to_string(),
            };
        }

        if let Some(lower) = current.downgraded() {
            if health.status_of(self.config.dependencies(current)) == HealthStatus::Critical {
                return Plan::Move {
                    to: lower,
                    reason: format!("{} dependencies critical", current),
                };
            }
            if current == OperatingMode::Primary && primary_exhausted {
                return Plan::Move {
                    to: lower,
                    reason: "primary path exhausted".to_string(),
                };
            }
        }

        let Some(higher) = current.upgraded().filter(|_| upgrade_requested) else {
            return Plan::Stay { healthy_streak: 0 };
        };

        if health.status_of(self.config.dependencies(higher)) != HealthStatus::Healthy {
            return Plan::Stay { healthy_streak: 0 };
        }

        let healthy_streak = healthy_streak + 1;
        if healthy_streak >= self.config.upgrade_confirmations {
            Plan::Move {
                to: higher,
                reason: format!("{} dependencies healthy for {} cycles", higher, healthy_streak),
            }
        } else {
            Plan::Stay { healthy_streak }
        }
    }

    fn apply(&self, state: &mut ModeState, plan: Plan) {
        match plan {
            Plan::Stay { healthy_streak } => {
                if state.healthy_streak != healthy_streak {
                    state.healthy_streak = healthy_streak;
                    state.epoch += 1;
                }
            }
            Plan::Move { to, reason } => {
                let from = state.mode.current;
                let at = self.clock.wall();

                if to > from {
                    tracing::warn!(from = %from, to = %to, reason = %reason, "Mode downgraded");
                } else {
                    tracing::info!(from = %from, to = %to, reason = %reason, "Mode upgraded");
                }

                let mode = &mut state.mode;
                if mode.history.len() >= self.config.history_capacity {
                    mode.history.pop_front();
                }
                mode.history.push_back(ModeTransition {
                    from,
                    to,
                    at,
                    reason: reason.clone(),
                });
                mode.current = to;
                mode.entered_at = at;
                mode.reason = reason;
                mode.transitions += 1;

                // Any move consumes or cancels the pending request
                state.upgrade_requested = false;
                state.healthy_streak = 0;
                state.epoch += 1;
            }
        }
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new(FallbackConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::health::HealthConfig;
    use crate::resilience::{CircuitObserver, CircuitState, CircuitTransition};

    fn circuit(health: &HealthMonitor, component: &str, to: CircuitState) {
        health.on_transition(&CircuitTransition {
            component_id: ComponentId::new(component),
            from: CircuitState::Closed,
            to,
            at: Utc::now(),
        });
    }

    fn setup(config: FallbackConfig) -> (ModeController, HealthMonitor) {
        let clock = Arc::new(ManualClock::new());
        (
            ModeController::with_clock(config, clock.clone()),
            HealthMonitor::with_clock(HealthConfig::default(), clock),
        )
    }

    #[test]
    fn test_starts_primary() {
        let modes = ModeController::default();
        let mode = modes.snapshot();
        assert_eq!(mode.current, OperatingMode::Primary);
        assert_eq!(mode.strategy(), DetectionStrategy::Model);
        assert!(mode.history.is_empty());
    }

    #[test]
    fn test_critical_model_downgrades_one_level() {
        let (modes, health) = setup(FallbackConfig::default());
        circuit(&health, "model", CircuitState::Open);

        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Heuristic);
        // HEURISTIC does not depend on the model
        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Heuristic);

        let mode = modes.snapshot();
        assert_eq!(mode.history.len(), 1);
        assert_eq!(mode.history[0].from, OperatingMode::Primary);
        assert_eq!(mode.history[0].to, OperatingMode::Heuristic);
    }

    #[test]
    fn test_primary_exhaustion_downgrades() {
        let (modes, health) = setup(FallbackConfig::default());
        assert_eq!(modes.run_cycle(&health, true), OperatingMode::Heuristic);
        assert_eq!(modes.snapshot().reason, "primary path exhausted");
    }

    #[test]
    fn test_never_skips_without_emergency() {
        let (modes, health) = setup(FallbackConfig {
            heuristic_dependencies: vec![ComponentId::new("sensor-bus")],
            ..Default::default()
        });
        circuit(&health, "model", CircuitState::Open);
        circuit(&health, "sensor-bus", CircuitState::Open);

        assert_eq!(modes.run_cycle(&health, true), OperatingMode::Heuristic);
        assert_eq!(modes.run_cycle(&health, true), OperatingMode::Safe);
        assert_eq!(modes.snapshot().transitions, 2);
    }

    #[test]
    fn test_emergency_jumps_to_safe() {
        let (modes, health) = setup(FallbackConfig::default());
        circuit(&health, "model", CircuitState::Open);
        health.set_cluster_reachable(false);

        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Safe);
        let mode = modes.snapshot();
        assert_eq!(mode.history[0].from, OperatingMode::Primary);
        assert_eq!(mode.history[0].to, OperatingMode::Safe);
    }

    #[test]
    fn test_emergency_can_be_disabled() {
        let (modes, health) = setup(FallbackConfig {
            emergency_safe: false,
            ..Default::default()
        });
        circuit(&health, "model", CircuitState::Open);
        health.set_cluster_reachable(false);

        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Heuristic);
    }

    #[test]
    fn test_no_upgrade_without_request() {
        let (modes, health) = setup(FallbackConfig::default());
        modes.run_cycle(&health, true);

        for _ in 0..10 {
            assert_eq!(modes.run_cycle(&health, false), OperatingMode::Heuristic);
        }
    }

    #[test]
    fn test_upgrade_needs_confirmation_window() {
        let (modes, health) = setup(FallbackConfig::default());
        modes.run_cycle(&health, true);
        assert!(modes.request_upgrade("probe succeeded"));

        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Heuristic);
        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Heuristic);
        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Primary);
        assert!(!modes.upgrade_pending());
    }

    #[test]
    fn test_unhealthy_cycle_resets_streak() {
        let (modes, health) = setup(FallbackConfig::default());
        modes.run_cycle(&health, true);
        modes.request_upgrade("probe succeeded");

        modes.run_cycle(&health, false);
        modes.run_cycle(&health, false);
        circuit(&health, "model", CircuitState::HalfOpen);
        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Heuristic);

        circuit(&health, "model", CircuitState::Closed);
        modes.run_cycle(&health, false);
        modes.run_cycle(&health, false);
        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Primary);
    }

    #[test]
    fn test_downgrade_cancels_pending_upgrade() {
        let (modes, health) = setup(FallbackConfig {
            heuristic_dependencies: vec![ComponentId::new("sensor-bus")],
            ..Default::default()
        });
        modes.run_cycle(&health, true);
        modes.request_upgrade("operator");

        circuit(&health, "sensor-bus", CircuitState::Open);
        assert_eq!(modes.run_cycle(&health, false), OperatingMode::Safe);
        assert!(!modes.upgrade_pending());
    }

    #[test]
    fn test_request_upgrade_in_primary_is_noop() {
        let modes = ModeController::default();
        assert!(!modes.request_upgrade("nothing to do"));
        assert!(!modes.upgrade_pending());
    }

    #[test]
    fn test_history_is_bounded() {
        let (modes, health) = setup(FallbackConfig {
            upgrade_confirmations: 1,
            history_capacity: 3,
            ..Default::default()
        });

        for _ in 0..4 {
            modes.run_cycle(&health, true);
            modes.request_upgrade("again");
            modes.run_cycle(&health, false);
        }

        let mode = modes.snapshot();
        assert_eq!(mode.transitions, 8);
        assert_eq!(mode.history.len(), 3);
        assert_eq!(mode.current, OperatingMode::Primary);
    }
}
