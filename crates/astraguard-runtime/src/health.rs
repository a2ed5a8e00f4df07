//! Health monitor: per-component status from a sliding window of outcomes.
//!
//! Each tracked component keeps a bounded ring buffer of recent call
//! outcomes. Entries older than the window are pruned lazily when health is
//! read. Status is derived as:
//!
//! - `CRITICAL` if the circuit is open or the failure rate reaches
//!   `critical_threshold`
//! - `DEGRADED` if the failure rate reaches `degraded_threshold`, the circuit
//!   is half-open, or a degraded signal (e.g. a failed consensus round) is
//!   still live
//! - `HEALTHY` otherwise
//!
//! Failure rates only count once `min_samples` outcomes are in the window.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use astraguard_core::ComponentId;

use crate::clock::{Clock, SystemClock};
use crate::config::duration_human;
use crate::consensus::{ConsensusOutcome, ConsensusResult};
use crate::resilience::{CircuitObserver, CircuitState, CircuitTransition};

/// Component id that carries consensus round outcomes.
pub const CONSENSUS_COMPONENT: &str = "consensus";

/// Health status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Outcomes older than this are ignored
    #[serde(with = "duration_human")]
    pub window: Duration,

    /// Ring buffer size per component
    pub capacity: usize,

    /// Failure rate at which a component is DEGRADED
    pub degraded_threshold: f64,

    /// Failure rate at which a component is CRITICAL
    pub critical_threshold: f64,

    /// Outcomes needed in the window before the failure rate counts
    pub min_samples: usize,

    /// How long a failed consensus round keeps `consensus` DEGRADED
    #[serde(with = "duration_human")]
    pub consensus_signal_ttl: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            capacity: 128,
            degraded_threshold: 0.2,
            critical_threshold: 0.5,
            min_samples: 3,
            consensus_signal_ttl: Duration::from_secs(30),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("health.capacity must be at least 1".to_string());
        }
        if self.min_samples == 0 || self.min_samples > self.capacity {
            return Err("health.min_samples must be within 1..=capacity".to_string());
        }
        if !(0.0 < self.degraded_threshold
            && self.degraded_threshold <= self.critical_threshold
            && self.critical_threshold <= 1.0)
        {
            return Err(
                "health thresholds must satisfy 0 < degraded_threshold <= critical_threshold <= 1"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Health of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component_id: ComponentId,
    pub status: HealthStatus,
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Failure rate over the window (0.0 until `min_samples` are in)
    pub failure_rate: f64,

    /// Outcomes currently in the window
    pub samples: usize,

    /// Last reported circuit state
    pub circuit: CircuitState,
}

/// Aggregate (worst-of) health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub components: BTreeMap<ComponentId, ComponentHealth>,

    /// False once a consensus round got no vote at all
    pub cluster_reachable: bool,

    pub assessed_at: DateTime<Utc>,
}

struct Track {
    /// (when, failed)
    outcomes: VecDeque<(Instant, bool)>,
    last_failure_at: Option<DateTime<Utc>>,
    circuit: CircuitState,
    degraded_until: Option<Instant>,
}

impl Track {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            last_failure_at: None,
            circuit: CircuitState::Closed,
            degraded_until: None,
        }
    }
}

/// Tracks per-component health.
pub struct HealthMonitor {
    config: HealthConfig,
    tracks: RwLock<HashMap<ComponentId, Arc<Mutex<Track>>>>,
    cluster_reachable: AtomicBool,
    generation: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            tracks: RwLock::new(HashMap::new()),
            cluster_reachable: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            clock,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Incremented on every recorded update.
    ///
    /// Lets readers detect that health moved under them.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn track(&self, component: &ComponentId) -> Arc<Mutex<Track>> {
        if let Some(track) = self.tracks.read().get(component) {
            return track.clone();
        }
        self.tracks
            .write()
            .entry(component.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Track::new(self.config.capacity))))
            .clone()
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, component: &ComponentId, failed: bool) {
        let now = self.clock.now();
        let track = self.track(component);
        {
            let mut track = track.lock();
            if track.outcomes.len() >= self.config.capacity {
                track.outcomes.pop_front();
            }
            track.outcomes.push_back((now, failed));
            if failed {
                track.last_failure_at = Some(self.clock.wall());
            }
        }
        self.bump();
    }

    pub fn record_success(&self, component: &ComponentId) {
        self.record(component, false);
    }

    pub fn record_failure(&self, component: &ComponentId) {
        self.record(component, true);
    }

    /// Keep a component at least DEGRADED for `ttl`.
    pub fn signal_degraded(&self, component: &ComponentId, ttl: Duration) {
        let until = self.clock.now() + ttl;
        let track = self.track(component);
        {
            let mut track = track.lock();
            track.degraded_until = Some(track.degraded_until.map_or(until, |t| t.max(until)));
        }
        self.bump();
    }

    /// Fold a consensus result into health.
    ///
    /// Anything short of quorum marks `consensus` DEGRADED; a round that got
    /// no vote at all marks the cluster unreachable.
    pub fn record_consensus(&self, result: &ConsensusResult) {
        let consensus = ComponentId::new(CONSENSUS_COMPONENT);
        if result.outcome == ConsensusOutcome::QuorumReached {
            self.record_success(&consensus);
        } else {
            // Peers that vote without agreeing only degrade; silence is a failure
            if result.votes_received == 0 {
                self.record_failure(&consensus);
            }
            self.signal_degraded(&consensus, self.config.consensus_signal_ttl);
            tracing::warn!(
                proposal_id = %result.proposal_id,
                outcome = ?result.outcome,
                votes = result.votes_received,
                "Consensus round did not reach quorum"
            );
        }
        self.set_cluster_reachable(result.votes_received > 0);
    }

    pub fn set_cluster_reachable(&self, reachable: bool) {
        let previous = self.cluster_reachable.swap(reachable, Ordering::SeqCst);
        if previous != reachable {
            tracing::warn!(reachable, "Cluster reachability changed");
            self.bump();
        }
    }

    pub fn cluster_reachable(&self) -> bool {
        self.cluster_reachable.load(Ordering::SeqCst)
    }

    /// Drop a component's window and signals, keeping its circuit state.
    pub fn clear(&self, component: &ComponentId) {
        if let Some(track) = self.tracks.read().get(component) {
            let mut track = track.lock();
            track.outcomes.clear();
            track.degraded_until = None;
        }
        self.bump();
    }

    fn assess(&self, component: &ComponentId, track: &mut Track, now: Instant) -> ComponentHealth {
        let window = self.config.window;
        while let Some((at, _)) = track.outcomes.front() {
            if now.saturating_duration_since(*at) > window {
                track.outcomes.pop_front();
            } else {
                break;
            }
        }

        let samples = track.outcomes.len();
        let failures = track.outcomes.iter().filter(|(_, failed)| *failed).count();
        let failure_rate = if samples >= self.config.min_samples {
            failures as f64 / samples as f64
        } else {
            0.0
        };
        let signalled = track.degraded_until.is_some_and(|until| now < until);

        let status = if track.circuit == CircuitState::Open
            || (samples >= self.config.min_samples && failure_rate >= self.config.critical_threshold)
        {
            HealthStatus::Critical
        } else if (samples >= self.config.min_samples && failure_rate >= self.config.degraded_threshold)
            || track.circuit == CircuitState::HalfOpen
            || signalled
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ComponentHealth {
            component_id: component.clone(),
            status,
            last_failure_at: track.last_failure_at,
            failure_rate,
            samples,
            circuit: track.circuit,
        }
    }

    /// Current health of one component. Untracked components are HEALTHY.
    pub fn component_health(&self, component: &ComponentId) -> ComponentHealth {
        let now = self.clock.now();
        let track = self.tracks.read().get(component).cloned();
        match track {
            Some(track) => self.assess(component, &mut track.lock(), now),
            None => self.assess(component, &mut Track::new(0), now),
        }
    }

    /// Health of every tracked component.
    pub fn snapshot(&self) -> BTreeMap<ComponentId, ComponentHealth> {
        let now = self.clock.now();
        let tracks: Vec<_> = self
            .tracks
            .read()
            .iter()
            .map(|(id, track)| (id.clone(), track.clone()))
            .collect();

        tracks
            .into_iter()
            .map(|(id, track)| {
                let health = self.assess(&id, &mut track.lock(), now);
                (id, health)
            })
            .collect()
    }

    /// Worst status over the given components; HEALTHY for an empty list.
    pub fn status_of(&self, components: &[ComponentId]) -> HealthStatus {
        components
            .iter()
            .map(|id| self.component_health(id).status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// System-wide worst-of summary.
    pub fn summary(&self) -> HealthSummary {
        let components = self.snapshot();
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthSummary {
            status,
            components,
            cluster_reachable: self.cluster_reachable(),
            assessed_at: self.clock.wall(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl CircuitObserver for HealthMonitor {
    fn on_transition(&self, transition: &CircuitTransition) {
        let track = self.track(&transition.component_id);
        track.lock().circuit = transition.to;
        self.bump();
    }
}
