//! Retry executor: bounded retries with backoff behind a circuit breaker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

use astraguard_core::ComponentId;

use super::backoff::{BackoffConfig, BackoffSequence, JitterSource};
use super::circuit_breaker::CircuitBreaker;
use crate::error::{DependencyError, ErrorClass, ResilienceError};
use crate::health::HealthMonitor;

/// Retry policy. Immutable once built and shared across calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,

    #[serde(flatten)]
    pub backoff: BackoffConfig,

    /// Error classes worth another attempt
    pub retryable: BTreeSet<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig::default(),
            retryable: [
                ErrorClass::Timeout,
                ErrorClass::Connection,
                ErrorClass::Unavailable,
                ErrorClass::RateLimited,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        self.retryable.contains(&class)
    }
}

/// Runs collaborator calls with retries, reporting every outcome to the
/// component's circuit and health track.
pub struct RetryExecutor {
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    jitter: JitterSource,
}

impl RetryExecutor {
    pub fn new(breaker: Arc<CircuitBreaker>, health: Arc<HealthMonitor>, jitter: JitterSource) -> Self {
        Self {
            breaker,
            health,
            jitter,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Call `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `operation` receives the zero-based attempt number and is expected to
    /// enforce its own per-call timeout. `deadline` bounds the whole
    /// execution: when it passes, the in-flight attempt is abandoned without
    /// counting against the breaker and [`ResilienceError::Timeout`] is
    /// returned.
    pub async fn execute<T, F, Fut>(
        &self,
        component: &ComponentId,
        policy: &RetryPolicy,
        deadline: Option<Instant>,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = BackoffSequence::new(&policy.backoff, &self.jitter);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ResilienceError::Timeout {
                    component: component.clone(),
                    attempts: attempt,
                });
            }

            // Fast failure, not a retry target
            let permit = self.breaker.try_acquire(component)?;

            let outcome = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, operation(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        permit.release();
                        tracing::warn!(component = %component, attempt, "Deadline expired during call");
                        return Err(ResilienceError::Timeout {
                            component: component.clone(),
                            attempts: attempt + 1,
                        });
                    }
                },
                None => operation(attempt).await,
            };

            let error = match outcome {
                Ok(value) => {
                    permit.success();
                    self.health.record_success(component);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !policy.is_retryable(error.class) {
                if error.class.is_dependency_failure() {
                    permit.failure();
                    self.health.record_failure(component);
                    tracing::warn!(component = %component, error = %error, "Non-retryable dependency failure");
                    return Err(ResilienceError::Dependency {
                        component: component.clone(),
                        source: error,
                    });
                }
                permit.release();
                return Err(ResilienceError::Input(error.message));
            }

            permit.failure();
            self.health.record_failure(component);

            if attempt + 1 < max_attempts {
                let delay = backoff.delay(attempt);
                tracing::debug!(
                    component = %component,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after backoff"
                );

                match deadline {
                    Some(deadline) if Instant::now() + delay >= deadline => {
                        tokio::time::sleep_until(deadline).await;
                        return Err(ResilienceError::Timeout {
                            component: component.clone(),
                            attempts: attempt + 1,
                        });
                    }
                    _ => tokio::time::sleep(delay).await,
                }
            }
            last_error = Some(error);
        }

        let last = last_error.unwrap_or_else(|| DependencyError::unavailable("no attempt completed"));
        tracing::warn!(component = %component, attempts = max_attempts, last = %last, "Retries exhausted");
        Err(ResilienceError::RetriesExhausted {
            component: component.clone(),
            attempts: max_attempts,
            last,
        })
    }
}
