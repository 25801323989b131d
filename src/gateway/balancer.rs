//! Upstream selection: load-balancing strategies over healthy backends
//!
//! Selection only ever considers upstreams marked healthy at the moment of
//! choice; health flips are driven by the prober and by forwarding
//! failures crossing the configured thresholds.

use crate::config::{BalanceStrategy, UpstreamConfig};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// One backend server behind a route
pub struct Upstream {
    /// Base URL of the backend
    pub url: String,
    /// Relative weight for weighted strategies
    pub weight: u32,
    active: AtomicUsize,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Upstream {
    fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            weight: config.weight.max(1),
            active: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
        }
    }

    /// Whether the upstream is currently marked healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Current in-flight request count
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Records a successful interaction; recovers health once consecutive
    /// successes cross the threshold
    pub fn record_success(&self, healthy_threshold: u32) {
        self.last_success_ms.store(epoch_ms(), Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.is_healthy() && successes >= healthy_threshold {
            self.healthy.store(true, Ordering::Relaxed);
            info!(upstream = %self.url, "upstream recovered");
        }
    }

    /// Records a failed interaction; marks unhealthy once consecutive
    /// failures cross the threshold
    pub fn record_failure(&self, unhealthy_threshold: u32) {
        self.last_failure_ms.store(epoch_ms(), Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.is_healthy() && failures >= unhealthy_threshold {
            self.healthy.store(false, Ordering::Relaxed);
            warn!(upstream = %self.url, failures, "upstream marked unhealthy");
        }
    }

    /// Tracks one in-flight request; the guard decrements on drop
    #[must_use]
    pub fn begin_request(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            upstream: self.clone(),
        }
    }
}

/// RAII guard for an upstream's active-connection count
pub struct ActiveGuard {
    upstream: Arc<Upstream>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.upstream.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The upstreams of one route plus the selection strategy state
pub struct UpstreamSet {
    upstreams: Vec<Arc<Upstream>>,
    strategy: BalanceStrategy,
    round_robin: AtomicUsize,
    /// Index list expanded by weight, for weighted round robin
    weighted_slots: Vec<usize>,
    weighted_cursor: AtomicUsize,
}

impl UpstreamSet {
    /// Builds the set from configuration
    #[must_use]
    pub fn new(configs: &[UpstreamConfig], strategy: BalanceStrategy) -> Self {
        let upstreams: Vec<Arc<Upstream>> =
            configs.iter().map(|c| Arc::new(Upstream::new(c))).collect();
        let mut weighted_slots = Vec::new();
        for (index, upstream) in upstreams.iter().enumerate() {
            for _ in 0..upstream.weight {
                weighted_slots.push(index);
            }
        }
        Self {
            upstreams,
            strategy,
            round_robin: AtomicUsize::new(0),
            weighted_slots,
            weighted_cursor: AtomicUsize::new(0),
        }
    }

    /// All upstreams, for probing and diagnostics
    #[must_use]
    pub fn all(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// Selects a healthy upstream per the strategy; `None` when no healthy
    /// upstream exists at the moment of choice
    #[must_use]
    pub fn select(&self, client_key: &str) -> Option<Arc<Upstream>> {
        let healthy: Vec<&Arc<Upstream>> = self
            .upstreams
            .iter()
            .filter(|u| u.is_healthy())
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            BalanceStrategy::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[index].clone()
            }
            BalanceStrategy::LeastConnections => {
                let min = healthy
                    .iter()
                    .map(|u| u.active_connections())
                    .min()
                    .unwrap_or(0);
                let tied: Vec<&&Arc<Upstream>> = healthy
                    .iter()
                    .filter(|u| u.active_connections() == min)
                    .collect();
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % tied.len();
                (*tied[index]).clone()
            }
            BalanceStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..healthy.len());
                healthy[index].clone()
            }
            BalanceStrategy::IpHash => {
                let mut hasher = DefaultHasher::new();
                client_key.hash(&mut hasher);
                let index = (hasher.finish() % healthy.len() as u64) as usize;
                healthy[index].clone()
            }
            BalanceStrategy::WeightedRoundRobin => {
                // Walk the expanded slot list until a healthy slot appears;
                // bounded by one full revolution.
                let slots = self.weighted_slots.len().max(1);
                let mut candidate = None;
                for _ in 0..slots {
                    let cursor = self.weighted_cursor.fetch_add(1, Ordering::Relaxed) % slots;
                    let upstream = &self.upstreams[self.weighted_slots[cursor]];
                    if upstream.is_healthy() {
                        candidate = Some(upstream.clone());
                        break;
                    }
                }
                candidate?
            }
        };
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn set(strategy: BalanceStrategy, urls: &[(&str, u32)]) -> UpstreamSet {
        let configs: Vec<UpstreamConfig> = urls
            .iter()
            .map(|(url, weight)| UpstreamConfig {
                url: (*url).to_string(),
                weight: *weight,
            })
            .collect();
        UpstreamSet::new(&configs, strategy)
    }

    #[test]
    fn round_robin_cycles_through_upstreams() {
        let set = set(BalanceStrategy::RoundRobin, &[("a", 1), ("b", 1), ("c", 1)]);
        let picks: Vec<String> = (0..6)
            .map(|_| set.select("client").unwrap().url.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn unhealthy_upstreams_are_skipped() {
        let set = set(BalanceStrategy::RoundRobin, &[("a", 1), ("b", 1)]);
        set.all()[0].record_failure(1);
        for _ in 0..4 {
            assert_eq!(set.select("client").unwrap().url, "b");
        }
    }

    #[test]
    fn no_healthy_upstream_yields_none() {
        let set = set(BalanceStrategy::Random, &[("a", 1)]);
        set.all()[0].record_failure(1);
        assert!(set.select("client").is_none());
    }

    #[test]
    fn ip_hash_is_sticky_per_client() {
        let set = set(BalanceStrategy::IpHash, &[("a", 1), ("b", 1), ("c", 1)]);
        let first = set.select("10.0.0.1").unwrap().url.clone();
        for _ in 0..10 {
            assert_eq!(set.select("10.0.0.1").unwrap().url, first);
        }
    }

    #[test]
    fn least_connections_prefers_the_idle_upstream() {
        let set = set(
            BalanceStrategy::LeastConnections,
            &[("a", 1), ("b", 1)],
        );
        let busy = set.all()[0].clone();
        let _guard = busy.begin_request();
        for _ in 0..4 {
            assert_eq!(set.select("client").unwrap().url, "b");
        }
    }

    #[test]
    fn weighted_round_robin_is_proportional() {
        let set = set(BalanceStrategy::WeightedRoundRobin, &[("a", 3), ("b", 1)]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..40 {
            *counts
                .entry(set.select("client").unwrap().url.clone())
                .or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 30);
        assert_eq!(counts["b"], 10);
    }

    #[test]
    fn health_flips_on_thresholds() {
        let upstream = Arc::new(Upstream::new(&UpstreamConfig {
            url: "a".to_string(),
            weight: 1,
        }));
        upstream.record_failure(3);
        upstream.record_failure(3);
        assert!(upstream.is_healthy());
        upstream.record_failure(3);
        assert!(!upstream.is_healthy());

        upstream.record_success(2);
        assert!(!upstream.is_healthy());
        upstream.record_success(2);
        assert!(upstream.is_healthy());
    }

    #[test]
    fn active_guard_releases_on_drop() {
        let upstream = Arc::new(Upstream::new(&UpstreamConfig {
            url: "a".to_string(),
            weight: 1,
        }));
        {
            let _a = upstream.begin_request();
            let _b = upstream.begin_request();
            assert_eq!(upstream.active_connections(), 2);
        }
        assert_eq!(upstream.active_connections(), 0);
    }
}
