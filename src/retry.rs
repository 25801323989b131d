//! Retry policy: backoff strategies with bounded jitter
//!
//! Retry wraps the result boundary of a handler or transport operation; on
//! exhaustion the caller dead-letters with the cumulative error.

use crate::domain_types::{BackoffMultiplier, MaxAttempts, RetryDelayMs};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter spread applied around a computed delay
const JITTER_RATIO: f64 = 0.25;

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Constant delay between attempts
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay grows by the backoff multiplier per attempt
    Exponential,
}

/// Error kinds a retry policy may exclude from re-attempting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryableKind {
    /// The handler raised
    HandlerError,
    /// The attempt exceeded its deadline
    Timeout,
    /// Transport I/O failed
    WireError,
}

/// Per-handler (or per-transport) retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Growth strategy
    pub strategy: RetryStrategy,
    /// Total attempts including the first
    pub max_attempts: MaxAttempts,
    /// Delay before the second attempt
    pub initial_delay: RetryDelayMs,
    /// Ceiling for computed delays
    pub max_delay: RetryDelayMs,
    /// Multiplier for the exponential strategy
    pub multiplier: BackoffMultiplier,
    /// Apply ±25% jitter to each delay
    pub jitter: bool,
    /// Kinds excluded from retrying; timeouts are retryable unless listed
    /// here
    pub non_retryable: Vec<RetryableKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: MaxAttempts::default(),
            initial_delay: RetryDelayMs::default(),
            max_delay: RetryDelayMs::try_new(30_000).unwrap_or_default(),
            multiplier: BackoffMultiplier::default(),
            jitter: true,
            non_retryable: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts: MaxAttempts::try_new(1).unwrap_or_default(),
            initial_delay: RetryDelayMs::try_new(1).unwrap_or_default(),
            max_delay: RetryDelayMs::try_new(1).unwrap_or_default(),
            multiplier: BackoffMultiplier::default(),
            jitter: false,
            non_retryable: Vec::new(),
        }
    }

    /// Excludes an error kind from retrying
    #[must_use]
    pub fn without_retry_on(mut self, kind: RetryableKind) -> Self {
        if !self.non_retryable.contains(&kind) {
            self.non_retryable.push(kind);
        }
        self
    }

    /// Whether this policy permits retrying the given error kind
    #[must_use]
    pub fn permits(&self, kind: RetryableKind) -> bool {
        !self.non_retryable.contains(&kind)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    #[must_use]
    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.as_u32()
    }

    /// Delay to apply before the attempt following `attempts_made` completed
    /// attempts.
    ///
    /// The first attempt carries no delay, so `attempts_made` starts at 1.
    #[must_use]
    pub fn delay_before_next(&self, attempts_made: u32) -> Duration {
        let base = self.initial_delay.as_duration();
        let raw = match self.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base.saturating_mul(attempts_made),
            RetryStrategy::Exponential => {
                let factor = self
                    .multiplier
                    .as_f64()
                    .powi(attempts_made.saturating_sub(1).min(32) as i32);
                Duration::from_secs_f64((base.as_secs_f64() * factor).min(86_400.0))
            }
        };
        let capped = raw.min(self.max_delay.as_duration());
        if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let spread = rng.gen_range(-JITTER_RATIO..=JITTER_RATIO);
    Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            strategy,
            max_attempts: MaxAttempts::try_new(4).unwrap(),
            initial_delay: RetryDelayMs::try_new(100).unwrap(),
            max_delay: RetryDelayMs::try_new(1000).unwrap(),
            multiplier: BackoffMultiplier::try_new(2.0).unwrap(),
            jitter: false,
            non_retryable: Vec::new(),
        }
    }

    #[test]
    fn non_retryable_kinds_are_excluded() {
        let p = policy(RetryStrategy::Fixed).without_retry_on(RetryableKind::Timeout);
        assert!(!p.permits(RetryableKind::Timeout));
        assert!(p.permits(RetryableKind::HandlerError));
    }

    #[test]
    fn fixed_strategy_keeps_the_delay_constant() {
        let p = policy(RetryStrategy::Fixed);
        assert_eq!(p.delay_before_next(1), Duration::from_millis(100));
        assert_eq!(p.delay_before_next(3), Duration::from_millis(100));
    }

    #[test]
    fn linear_strategy_grows_with_attempts() {
        let p = policy(RetryStrategy::Linear);
        assert_eq!(p.delay_before_next(1), Duration::from_millis(100));
        assert_eq!(p.delay_before_next(2), Duration::from_millis(200));
        assert_eq!(p.delay_before_next(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_strategy_doubles_and_caps() {
        let p = policy(RetryStrategy::Exponential);
        assert_eq!(p.delay_before_next(1), Duration::from_millis(100));
        assert_eq!(p.delay_before_next(2), Duration::from_millis(200));
        assert_eq!(p.delay_before_next(3), Duration::from_millis(400));
        // 100 * 2^9 far exceeds the cap
        assert_eq!(p.delay_before_next(10), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let mut p = policy(RetryStrategy::Fixed);
        p.jitter = true;
        for _ in 0..100 {
            let d = p.delay_before_next(1);
            assert!(d >= Duration::from_millis(75), "jittered too low: {d:?}");
            assert!(d <= Duration::from_millis(125), "jittered too high: {d:?}");
        }
    }

    #[test]
    fn attempt_budget_counts_the_first_attempt() {
        let p = policy(RetryStrategy::Fixed);
        assert!(p.allows_another_attempt(1));
        assert!(p.allows_another_attempt(3));
        assert!(!p.allows_another_attempt(4));
        assert!(!RetryPolicy::none().allows_another_attempt(1));
    }
}
