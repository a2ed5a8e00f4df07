//! Resilience patterns for astraguard-runtime.
//!
//! This module provides:
//! - Backoff with jitter
//! - Circuit breaker to prevent cascade failures
//! - Retry executor
//! - Fallback mode manager

pub mod backoff;
mod circuit_breaker;
mod fallback;
mod retry;

pub use backoff::{BackoffConfig, BackoffSequence, JitterSource, JitterStrategy};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitObserver, CircuitSnapshot,
    CircuitState, CircuitTransition,
};
pub use fallback::{
    DetectionStrategy, FallbackConfig, ModeController, ModeTransition, SystemMode,
};
pub use retry::{RetryExecutor, RetryPolicy};
