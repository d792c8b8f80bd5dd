//! Retry policy for transient call failures.
//!
//! The policy only answers "retry, and after how long?". Which failures are
//! transient is decided by [`ApiError::class`](crate::ApiError::class); the
//! attempt count lives in the fiber's packet so one policy instance serves
//! every fiber.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::step::StepId;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// `initial_delay * multiplier^(attempt-1)`, capped at `max_delay`.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: default_multiplier(),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
                    *max_delay
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,

    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self { max_retries, backoff }
    }

    /// Decide after the `failures`-th consecutive failed attempt.
    #[must_use]
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures == 0 || failures > self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.backoff.delay_for_attempt(failures))
        }
    }
}

/// Per-fiber failure counts, keyed by the step that issued the call.
#[derive(Debug, Default, Clone)]
pub(crate) struct RetryLedger {
    failures: HashMap<StepId, u32>,
}

impl RetryLedger {
    /// Records a failure and returns the consecutive count for `step`.
    pub(crate) fn record_failure(&mut self, step: StepId) -> u32 {
        let count = self.failures.entry(step).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub(crate) fn clear(&mut self, step: StepId) {
        self.failures.remove(&step);
    }

    #[cfg(test)]
    pub(crate) fn failures(&self, step: StepId) -> u32 {
        self.failures.get(&step).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn exponential(initial_ms: u64, max_ms: u64, multiplier: f64) -> Backoff {
        Backoff::Exponential {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
        }
    }

    #[test]
    fn test_exponential_doubles_until_capped() {
        let backoff = exponential(100, 1_000, 2.0);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(250),
        };
        assert_eq!(backoff.delay_for_attempt(1), backoff.delay_for_attempt(9));
    }

    #[test]
    fn test_policy_gives_up_after_max_retries() {
        let policy = RetryPolicy::new(3, exponential(10, 1_000, 2.0));
        assert!(matches!(policy.decide(1), RetryDecision::RetryAfter(_)));
        assert!(matches!(policy.decide(3), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let policy = RetryPolicy::new(0, Backoff::default());
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_ledger_counts_per_step() {
        let mut ledger = RetryLedger::default();
        let a = StepId::from_index(0);
        let b = StepId::from_index(1);
        assert_eq!(ledger.record_failure(a), 1);
        assert_eq!(ledger.record_failure(a), 2);
        assert_eq!(ledger.record_failure(b), 1);
        ledger.clear(a);
        assert_eq!(ledger.failures(a), 0);
        assert_eq!(ledger.failures(b), 1);
    }

    #[test]
    fn test_backoff_parses_from_tagged_toml() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_retries = 2
            [backoff]
            type = "exponential"
            initial_delay = "50ms"
            max_delay = "2s"
            "#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff, exponential(50, 2_000, 2.0));
    }

    proptest! {
        #[test]
        fn prop_exponential_delays_never_decrease(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            multiplier in 1.5f64..4.0,
            attempt in 1u32..64,
        ) {
            let backoff = exponential(initial_ms, max_ms, multiplier);
            let here = backoff.delay_for_attempt(attempt);
            let next = backoff.delay_for_attempt(attempt + 1);
            prop_assert!(next >= here);
            prop_assert!(next <= Duration::from_millis(max_ms.max(initial_ms)));
        }

        #[test]
        fn prop_policy_allows_exactly_max_retries(max_retries in 0u32..20) {
            let policy = RetryPolicy::new(max_retries, Backoff::default());
            let retries = (1..=max_retries + 5)
                .take_while(|n| matches!(policy.decide(*n), RetryDecision::RetryAfter(_)))
                .count();
            prop_assert_eq!(retries, max_retries as usize);
        }
    }
}
