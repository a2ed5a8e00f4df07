//! Error taxonomy for the resilience core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use astraguard_core::ComponentId;

/// Classification of a collaborator failure.
///
/// The retry policy decides which classes are retried; every class except
/// [`ErrorClass::InvalidInput`] counts against the dependency's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Call did not complete within its per-call timeout
    Timeout,

    /// Connection refused, reset or dropped
    Connection,

    /// Dependency reported itself unavailable (e.g. 503)
    Unavailable,

    /// Dependency asked us to slow down
    RateLimited,

    /// Dependency answered with something we could not interpret
    Protocol,

    /// Dependency rejected the input as malformed
    InvalidInput,
}

impl ErrorClass {
    /// Whether this failure says something about the dependency's health.
    pub fn is_dependency_failure(self) -> bool {
        !matches!(self, Self::InvalidInput)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Unavailable => "unavailable",
            Self::RateLimited => "rate_limited",
            Self::Protocol => "protocol",
            Self::InvalidInput => "invalid_input",
        };
        f.write_str(name)
    }
}

/// A failed call to a collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{class} error: {message}")]
pub struct DependencyError {
    pub class: ErrorClass,
    pub message: String,
}

impl DependencyError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorClass::Timeout, format!("no response after {:?}", after))
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Connection, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unavailable, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Protocol, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::InvalidInput, message)
    }
}

/// Errors surfaced by the resilience core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    /// Caller's fault; never retried, never trips a breaker
    #[error("Invalid input: {0}")]
    Input(String),

    /// Dependency failure that the policy does not retry
    #[error("Dependency {component} failed: {source}")]
    Dependency {
        component: ComponentId,
        #[source]
        source: DependencyError,
    },

    /// Fast failure, the dependency was not called
    #[error("Circuit open for {component}")]
    CircuitOpen { component: ComponentId },

    #[error("Retries exhausted for {component} after {attempts} attempts: {last}")]
    RetriesExhausted {
        component: ComponentId,
        attempts: u32,
        last: DependencyError,
    },

    /// Caller deadline expired
    #[error("Deadline expired for {component} after {attempts} attempts")]
    Timeout { component: ComponentId, attempts: u32 },

    #[error("Consensus round {proposal_id} timed out")]
    ConsensusTimeout { proposal_id: String },

    #[error("Consensus round {proposal_id} split without quorum")]
    ConsensusSplit { proposal_id: String },
}

impl ResilienceError {
    /// Whether the dependency was given up on (breaker open or retries used up).
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RetriesExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_is_not_dependency_failure() {
        assert!(!ErrorClass::InvalidInput.is_dependency_failure());
        assert!(ErrorClass::Protocol.is_dependency_failure());
        assert!(ErrorClass::Timeout.is_dependency_failure());
    }

    #[test]
    fn test_error_messages() {
        let err = ResilienceError::RetriesExhausted {
            component: ComponentId::new("model"),
            attempts: 3,
            last: DependencyError::connection("refused"),
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted for model after 3 attempts: connection error: refused"
        );
        assert!(err.is_exhaustion());
    }
}
