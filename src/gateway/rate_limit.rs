//! Per-client token-bucket rate limiting
//!
//! Each client holds `{tokens, last-refill}`. On every request the bucket
//! refills by `elapsed * rate` up to capacity and then pays one token or is
//! denied with a `Retry-After` hint. A sweeper drops client entries idle
//! beyond the eviction horizon.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// One token consumed; let the request through
    Allowed,
    /// Out of tokens; retry after the given number of seconds
    Denied {
        /// Seconds until at least one token refills
        retry_after_secs: u64,
    },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token-bucket limiter keyed by client identity
pub struct TokenBucketLimiter {
    policy: RateLimitConfig,
    clients: DashMap<String, BucketState>,
}

impl TokenBucketLimiter {
    /// Creates a limiter from policy
    #[must_use]
    pub fn new(policy: RateLimitConfig) -> Self {
        Self {
            policy,
            clients: DashMap::new(),
        }
    }

    /// Checks (and pays for) one request from the client
    #[must_use]
    pub fn check(&self, client: &str) -> RateDecision {
        let now = Instant::now();
        let mut bucket = self
            .clients
            .entry(client.to_string())
            .or_insert_with(|| BucketState {
                tokens: self.policy.capacity,
                last_refill: now,
                last_seen: now,
            });
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.policy.refill_per_sec)
            .min(self.policy.capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / self.policy.refill_per_sec).ceil().max(1.0) as u64;
            RateDecision::Denied { retry_after_secs }
        }
    }

    /// Drops client entries idle beyond the horizon; returns how many were
    /// evicted
    pub fn sweep(&self, idle_horizon: Duration) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, bucket| bucket.last_seen.elapsed() < idle_horizon);
        before - self.clients.len()
    }

    /// Number of tracked clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
