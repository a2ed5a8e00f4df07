//! # astraguard-runtime
//!
//! Resilience control core for AstraGuard anomaly detection.
//!
//! This crate decides when collaborators (the detection model, cluster
//! peers, the coordination store) are called, how their failures are
//! interpreted and what the service falls back to when they misbehave.
//!
//! ## Components
//!
//! - [`resilience::backoff`]: exponential delays with jitter
//! - [`CircuitBreaker`]: per-component fail-fast gate
//! - [`RetryExecutor`]: bounded retries through the breaker
//! - [`QuorumConsensus`]: majority agreement among cluster nodes
//! - [`HealthMonitor`]: rolling per-component health
//! - [`ModeController`]: PRIMARY / HEURISTIC / SAFE operating modes
//! - [`RecoveryOrchestrator`]: periodic probes and upgrade requests
//! - [`Guardian`]: the evaluation service wiring it all together
//!
//! ## Key Guarantees
//!
//! 1. **Always a verdict**: valid samples always get one, whatever fails
//! 2. **Fail fast**: an open circuit never reaches its collaborator
//! 3. **Bounded latency**: every model call and retry loop has a deadline
//! 4. **Conservative under doubt**: no quorum means SAFE behavior
//!
//! ## Example
//!
//! ```rust,ignore
//! use astraguard_runtime::{Guardian, RuntimeConfig};
//! use astraguard_core::TelemetrySample;
//!
//! let guardian = Guardian::builder()
//!     .config(RuntimeConfig::from_yaml_file("astraguard.yaml")?)
//!     .model(model)
//!     .build()?;
//!
//! let outcome = guardian.evaluate(&TelemetrySample::new("sat-1").with_voltage(7.9)).await?;
//! println!("{:?} via {}", outcome.verdict, outcome.mode);
//! ```

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod consensus;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod recovery;
pub mod resilience;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    ClusterTransport, CoordinationStore, DetectionModel, MemoryStore, ModelScore, PublisherConfig,
    StatePublisher, StoreError,
};
pub use config::{ConfigError, RuntimeConfig};
pub use consensus::{
    ConsensusConfig, ConsensusOutcome, ConsensusResult, Proposal, QuorumConsensus, Vote,
    VoteRequest,
};
pub use error::{DependencyError, ErrorClass, ResilienceError};
pub use health::{ComponentHealth, HealthConfig, HealthMonitor, HealthStatus, HealthSummary};
pub use orchestrator::{
    EvaluationConfig, EvaluationOutcome, Guardian, GuardianBuilder, MODEL_COMPONENT,
};
pub use recovery::{
    RecoveryActionConfig, RecoveryActionKind, RecoveryCondition, RecoveryConfig,
    RecoveryOrchestrator, RecoveryReport,
};
pub use resilience::{
    BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
    FallbackConfig, JitterSource, JitterStrategy, ModeController, RetryExecutor, RetryPolicy,
    SystemMode,
};
pub use stats::StatsSnapshot;
