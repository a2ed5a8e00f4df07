//! Circuit breaker to prevent cascade failures.
//!
//! When calls to a dependency fail repeatedly, its circuit opens and
//! subsequent calls fail fast without touching the dependency. After the
//! open duration elapses the next call attempt moves the circuit to
//! half-open, where a single probe at a time is let through.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use astraguard_core::ComponentId;

use super::backoff;
use crate::clock::{Clock, SystemClock};
use crate::config::duration_human;
use crate::error::ResilienceError;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Successful probes needed to close circuit
    pub success_threshold: u32,

    /// Time before attempting recovery
    #[serde(with = "duration_human")]
    pub open_duration: Duration,

    /// Cap for the open duration after repeated failed recoveries
    #[serde(with = "duration_human")]
    pub max_open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            max_open_duration: Duration::from_secs(300),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Circuit is open, all calls fail fast
    Open,

    /// Testing if circuit can close
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one component's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub component_id: ComponentId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_human")]
    pub open_duration: Duration,
}

/// A state change of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub component_id: ComponentId,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Receives every circuit transition, in the order they happen.
///
/// Called while the breaker's table lock is held: implementations must
/// not call back into the breaker.
pub trait CircuitObserver: Send + Sync {
    fn on_transition(&self, transition: &CircuitTransition);
}

struct CircuitEntry {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    open_for: Duration,
    reopen_count: u32,
    probe_in_flight: bool,
}

impl CircuitEntry {
    fn new(config: CircuitBreakerConfig) -> Self {
        let open_for = config.open_duration;
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            opened_at_wall: None,
            open_for,
            reopen_count: 0,
            probe_in_flight: false,
        }
    }

    fn snapshot(&self, component: &ComponentId) -> CircuitSnapshot {
        CircuitSnapshot {
            component_id: component.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            opened_at: self.opened_at_wall,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_duration: self.open_for,
        }
    }
}

/// Circuit breaker prevents cascade failures.
///
/// Each component has its own circuit to allow independent recovery.
pub struct CircuitBreaker {
    states: RwLock<HashMap<ComponentId, CircuitEntry>>,
    config: CircuitBreakerConfig,
    overrides: HashMap<ComponentId, CircuitBreakerConfig>,
    observers: Vec<Arc<dyn CircuitObserver>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a circuit breaker reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
            overrides: HashMap::new(),
            observers: Vec::new(),
            clock,
        }
    }

    /// Use a different configuration for one component.
    pub fn with_override(mut self, component: ComponentId, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(component, config);
        self
    }

    /// Report transitions to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn CircuitObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    fn config_for(&self, component: &ComponentId) -> CircuitBreakerConfig {
        self.overrides
            .get(component)
            .cloned()
            .unwrap_or_else(|| self.config.clone())
    }

    /// Ask to call a component.
    ///
    /// Returns a permit when the call may proceed. An open circuit whose open
    /// duration has elapsed moves to half-open here; in half-open only one
    /// probe permit is outstanding at a time.
    pub fn try_acquire(&self, component: &ComponentId) -> Result<CallPermit<'_>, ResilienceError> {
        let now = self.clock.now();
        let mut states = self.states.write();
        let entry = states
            .entry(component.clone())
            .or_insert_with(|| CircuitEntry::new(self.config_for(component)));

        if entry.state == CircuitState::Open {
            let elapsed = entry
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if elapsed < entry.open_for {
                return Err(ResilienceError::CircuitOpen {
                    component: component.clone(),
                });
            }
            self.transition(component, entry, CircuitState::HalfOpen);
            tracing::info!(component = %component, "Circuit transitioning to half-open for recovery test");
        }

        match entry.state {
            CircuitState::Closed => Ok(CallPermit::new(self, component.clone(), false)),
            CircuitState::HalfOpen if !entry.probe_in_flight => {
                entry.probe_in_flight = true;
                Ok(CallPermit::new(self, component.clone(), true))
            }
            _ => Err(ResilienceError::CircuitOpen {
                component: component.clone(),
            }),
        }
    }

    /// Check if circuit is open for a component.
    ///
    /// Returns true if calls would fail fast right now. Does not change state.
    pub fn is_open(&self, component: &ComponentId) -> bool {
        let now = self.clock.now();
        let states = self.states.read();
        match states.get(component) {
            Some(entry) if entry.state == CircuitState::Open => entry
                .opened_at
                .map(|at| now.saturating_duration_since(at) < entry.open_for)
                .unwrap_or(true),
            Some(entry) if entry.state == CircuitState::HalfOpen => entry.probe_in_flight,
            _ => false,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, component: &ComponentId) {
        self.settle_success(component, true);
    }

    /// Half-open outcomes only count when they come from the call holding
    /// the half-open slot. Calls admitted while closed settle late as no-ops.
    fn settle_success(&self, component: &ComponentId, holds_slot: bool) {
        let mut states = self.states.write();
        let Some(entry) = states.get_mut(component) else {
            return;
        };

        match entry.state {
            CircuitState::HalfOpen if !holds_slot => {
                tracing::debug!(component = %component, "Ignoring late success from a call admitted while closed");
            }
            CircuitState::HalfOpen => {
                entry.probe_in_flight = false;
                entry.consecutive_successes += 1;
                if entry.consecutive_successes >= entry.config.success_threshold {
                    entry.consecutive_failures = 0;
                    entry.consecutive_successes = 0;
                    entry.reopen_count = 0;
                    entry.opened_at = None;
                    entry.opened_at_wall = None;
                    entry.open_for = entry.config.open_duration;
                    self.transition(component, entry, CircuitState::Closed);
                    tracing::info!(component = %component, "Circuit closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                // Reset failures on success
                entry.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, component: &ComponentId) {
        self.settle_failure(component, true);
    }

    fn settle_failure(&self, component: &ComponentId, holds_slot: bool) {
        let now = self.clock.now();
        let mut states = self.states.write();
        let entry = states
            .entry(component.clone())
            .or_insert_with(|| CircuitEntry::new(self.config_for(component)));

        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= entry.config.failure_threshold {
                    entry.open_for = entry.config.open_duration;
                    self.open(component, entry, now);
                    tracing::warn!(
                        component = %component,
                        failures = entry.consecutive_failures,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            CircuitState::HalfOpen if !holds_slot => {
                tracing::debug!(component = %component, "Ignoring late failure from a call admitted while closed");
            }
            CircuitState::HalfOpen => {
                // Failed during recovery, reopen
                entry.probe_in_flight = false;
                entry.consecutive_failures += 1;
                entry.reopen_count += 1;
                entry.open_for = backoff::exponential(
                    entry.config.open_duration,
                    entry.reopen_count,
                    entry.config.max_open_duration.max(entry.config.open_duration),
                );
                self.open(component, entry, now);
                tracing::warn!(
                    component = %component,
                    open_for = ?entry.open_for,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, component: &ComponentId, entry: &mut CircuitEntry, now: Instant) {
        entry.consecutive_successes = 0;
        entry.opened_at = Some(now);
        entry.opened_at_wall = Some(self.clock.wall());
        self.transition(component, entry, CircuitState::Open);
    }

    /// Free a half-open probe slot without counting an outcome.
    fn release_probe(&self, component: &ComponentId) {
        if let Some(entry) = self.states.write().get_mut(component) {
            if entry.state == CircuitState::HalfOpen {
                entry.probe_in_flight = false;
            }
        }
    }

    fn transition(&self, component: &ComponentId, entry: &mut CircuitEntry, to: CircuitState) {
        let from = entry.state;
        entry.state = to;
        if from == to {
            return;
        }

        let transition = CircuitTransition {
            component_id: component.clone(),
            from,
            to,
            at: self.clock.wall(),
        };
        for observer in &self.observers {
            observer.on_transition(&transition);
        }
    }

    /// Move an open circuit to half-open without waiting out its open duration.
    ///
    /// Returns true if the circuit was open.
    pub fn force_half_open(&self, component: &ComponentId) -> bool {
        let mut states = self.states.write();
        match states.get_mut(component) {
            Some(entry) if entry.state == CircuitState::Open => {
                entry.probe_in_flight = false;
                self.transition(component, entry, CircuitState::HalfOpen);
                tracing::info!(component = %component, "Circuit forced to half-open");
                true
            }
            _ => false,
        }
    }

    /// Get current state of a circuit.
    pub fn state(&self, component: &ComponentId) -> CircuitState {
        self.states
            .read()
            .get(component)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Get a snapshot of a circuit.
    pub fn snapshot(&self, component: &ComponentId) -> CircuitSnapshot {
        self.states
            .read()
            .get(component)
            .map(|entry| entry.snapshot(component))
            .unwrap_or_else(|| CircuitEntry::new(self.config_for(component)).snapshot(component))
    }

    /// Snapshots of every circuit seen so far.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .states
            .read()
            .iter()
            .map(|(component, entry)| entry.snapshot(component))
            .collect();
        snapshots.sort_by(|a, b| a.component_id.cmp(&b.component_id));
        snapshots
    }

    /// Force one circuit closed.
    pub fn reset(&self, component: &ComponentId) {
        let mut states = self.states.write();
        if let Some(entry) = states.get_mut(component) {
            let fresh = CircuitEntry::new(entry.config.clone());
            let from_state = entry.state;
            *entry = fresh;
            entry.state = from_state;
            self.transition(component, entry, CircuitState::Closed);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Permission to make one call through the breaker.
///
/// Settle it with [`success`](Self::success), [`failure`](Self::failure) or
/// [`release`](Self::release). Dropping an unsettled probe permit frees the
/// half-open probe slot without counting an outcome.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    component: ComponentId,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, component: ComponentId, probe: bool) -> Self {
        Self {
            breaker,
            component,
            probe,
            settled: false,
        }
    }

    /// Whether this permit is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle_success(&self.component, self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle_failure(&self.component, self.probe);
    }

    /// Settle without counting toward the breaker (non-dependency errors).
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.release_probe(&self.component);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(&self.component);
        }
    }
}
