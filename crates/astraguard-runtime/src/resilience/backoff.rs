//! Backoff and jitter engine.
//!
//! Computes the delay before retry attempt `n`:
//!
//! | Strategy     | Delay for attempt `n >= 1`                          |
//! |--------------|-----------------------------------------------------|
//! | none         | `min(max, base * 2^n)`                              |
//! | full         | `random(0, min(max, base * 2^n))`                   |
//! | equal        | `half + random(0, half)`, `half = min(max, base * 2^n) / 2` |
//! | decorrelated | `min(max, random(base, previous * 3))`              |
//!
//! Attempt 0 always yields `min(base, max)` unjittered. Every delay is
//! clamped to `max_delay`. Randomness comes from a [`JitterSource`], which
//! can be seeded for reproducible sequences.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_human;

/// Jitter applied on top of exponential growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    None,
    Full,
    #[default]
    Equal,
    Decorrelated,
}

/// Delay bounds and jitter strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay for attempt 0 and floor for decorrelated jitter
    #[serde(with = "duration_human")]
    pub base_delay: Duration,

    /// Upper bound on any delay
    #[serde(with = "duration_human")]
    pub max_delay: Duration,

    pub jitter: JitterStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::default(),
        }
    }
}

impl BackoffConfig {
    /// Delay for a single attempt, without carried state.
    ///
    /// Decorrelated jitter treats the previous delay as `base_delay`; use a
    /// [`BackoffSequence`] to carry state across a retry sequence.
    pub fn delay(&self, attempt: u32, source: &JitterSource) -> Duration {
        let previous = self.base_delay.min(self.max_delay);
        self.next_delay(attempt, previous, source)
    }

    fn next_delay(&self, attempt: u32, previous: Duration, source: &JitterSource) -> Duration {
        let floor = self.base_delay.min(self.max_delay);
        if attempt == 0 {
            return floor;
        }

        let ceiling = exponential(self.base_delay, attempt, self.max_delay);
        match self.jitter {
            JitterStrategy::None => ceiling,
            JitterStrategy::Full => source.between(Duration::ZERO, ceiling),
            JitterStrategy::Equal => {
                let half = ceiling / 2;
                half + source.between(Duration::ZERO, half)
            }
            JitterStrategy::Decorrelated => {
                let upper = previous.saturating_mul(3).max(floor);
                source.between(floor, upper).min(self.max_delay)
            }
        }
    }
}

/// `min(max, base * 2^attempt)`, saturating.
pub fn exponential(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Random source for jitter.
///
/// Shared by every retry sequence of an executor; seeding it makes the
/// produced delays reproducible.
#[derive(Debug)]
pub struct JitterSource {
    rng: Mutex<StdRng>,
}

impl JitterSource {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniform duration in `[low, high]` at microsecond resolution.
    fn between(&self, low: Duration, high: Duration) -> Duration {
        if high <= low {
            return low;
        }
        let low_us = micros(low);
        let high_us = micros(high);
        let picked = self.rng.lock().gen_range(low_us..=high_us);
        Duration::from_micros(picked)
    }
}

impl Default for JitterSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Delays for one retry sequence, carrying decorrelated-jitter state.
pub struct BackoffSequence<'a> {
    config: &'a BackoffConfig,
    source: &'a JitterSource,
    previous: Duration,
    attempt: u32,
}

impl<'a> BackoffSequence<'a> {
    pub fn new(config: &'a BackoffConfig, source: &'a JitterSource) -> Self {
        Self {
            config,
            source,
            previous: config.base_delay.min(config.max_delay),
            attempt: 0,
        }
    }

    /// Delay to wait after the given attempt failed.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let delay = self.config.next_delay(attempt, self.previous, self.source);
        self.previous = delay;
        self.attempt = attempt.saturating_add(1);
        delay
    }
}

impl Iterator for BackoffSequence<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.delay(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(jitter: JitterStrategy) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter,
        }
    }

    #[test]
    fn test_attempt_zero_is_base_for_every_strategy() {
        let source = JitterSource::seeded(7);
        for jitter in [
            JitterStrategy::None,
            JitterStrategy::Full,
            JitterStrategy::Equal,
            JitterStrategy::Decorrelated,
        ] {
            assert_eq!(config(jitter).delay(0, &source), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_no_jitter_doubles_until_clamped() {
        let source = JitterSource::seeded(7);
        let cfg = config(JitterStrategy::None);
        let delays: Vec<_> = BackoffSequence::new(&cfg, &source).take(7).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );
    }

    #[test]
    fn test_equal_jitter_keeps_half_floor() {
        let source = JitterSource::seeded(11);
        let cfg = config(JitterStrategy::Equal);
        for _ in 0..100 {
            let delay = cfg.delay(3, &source);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_seeded_sources_are_reproducible() {
        let cfg = config(JitterStrategy::Decorrelated);
        let a = JitterSource::seeded(42);
        let b = JitterSource::seeded(42);

        let first: Vec<_> = BackoffSequence::new(&cfg, &a).take(10).collect();
        let second: Vec<_> = BackoffSequence::new(&cfg, &b).take(10).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decorrelated_carries_previous_delay() {
        let cfg = BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Decorrelated,
        };
        let source = JitterSource::seeded(3);
        let mut sequence = BackoffSequence::new(&cfg, &source);

        let mut previous = sequence.delay(0);
        for attempt in 1..20 {
            let delay = sequence.delay(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= previous * 3);
            previous = delay;
        }
    }

    #[test]
    fn test_exponential_saturates() {
        let max = Duration::from_secs(300);
        assert_eq!(exponential(Duration::from_secs(30), 0, max), Duration::from_secs(30));
        assert_eq!(exponential(Duration::from_secs(30), 2, max), Duration::from_secs(120));
        assert_eq!(exponential(Duration::from_secs(30), 40, max), max);
    }

    #[test]
    fn test_base_above_max_is_clamped() {
        let cfg = BackoffConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            jitter: JitterStrategy::Decorrelated,
        };
        let source = JitterSource::seeded(1);
        let delays: Vec<_> = BackoffSequence::new(&cfg, &source).take(5).collect();
        assert!(delays.iter().all(|d| *d == Duration::from_secs(1)));
    }

    fn any_jitter() -> impl Strategy<Value = JitterStrategy> {
        prop_oneof![
            Just(JitterStrategy::None),
            Just(JitterStrategy::Full),
            Just(JitterStrategy::Equal),
            Just(JitterStrategy::Decorrelated),
        ]
    }

    proptest! {
        #[test]
        fn delays_stay_within_bounds(
            jitter in any_jitter(),
            base_ms in 1u64..5_000,
            max_ms in 1u64..60_000,
            seed in any::<u64>(),
            attempts in 1usize..40,
        ) {
            let cfg = BackoffConfig {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                jitter,
            };
            let source = JitterSource::seeded(seed);
            let floor = cfg.base_delay.min(cfg.max_delay);

            let delays: Vec<_> = BackoffSequence::new(&cfg, &source).take(attempts).collect();
            prop_assert_eq!(delays[0], floor);
            for delay in delays {
                prop_assert!(delay <= cfg.max_delay);
            }
        }
    }
}
