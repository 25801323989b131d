//! Metrics collection interface and the in-memory atomic implementation
//!
//! The core emits counters and duration observations through the
//! [`MetricsCollector`] trait; concrete backends (Prometheus, OTLP, ...)
//! live outside the core.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sink for counters and duration histograms emitted by the runtime
pub trait MetricsCollector: Send + Sync {
    /// Increments a named counter
    fn incr(&self, name: &str, delta: u64);

    /// Records one duration observation for a named histogram
    fn observe_duration(&self, name: &str, duration: Duration);
}

/// Collector that drops every observation; useful for tests and benchmarks
#[derive(Debug, Clone, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn incr(&self, _name: &str, _delta: u64) {}
    fn observe_duration(&self, _name: &str, _duration: Duration) {}
}

/// Exponentially weighted moving average over duration samples
#[derive(Debug, Default)]
pub(crate) struct DurationEwma {
    /// Microseconds, bit-packed f64
    value_bits: AtomicU64,
    samples: AtomicU64,
}

const EWMA_ALPHA: f64 = 0.2;

impl DurationEwma {
    pub(crate) fn new() -> Self {
        Self {
            value_bits: AtomicU64::new(0f64.to_bits()),
            samples: AtomicU64::new(0),
        }
    }

    pub(crate) fn observe(&self, duration: Duration) {
        let sample_us = duration.as_secs_f64() * 1_000_000.0;
        let prior_samples = self.samples.fetch_add(1, Ordering::Relaxed);
        let mut current = self.value_bits.load(Ordering::Relaxed);
        loop {
            let prior = f64::from_bits(current);
            let next = if prior_samples == 0 {
                sample_us
            } else {
                prior + EWMA_ALPHA * (sample_us - prior)
            };
            match self.value_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn average(&self) -> Duration {
        Duration::from_secs_f64(f64::from_bits(self.value_bits.load(Ordering::Relaxed)) / 1_000_000.0)
    }
}

/// In-memory collector backed by atomic counters, exposed for scraping
#[derive(Default)]
pub struct AtomicMetrics {
    counters: DashMap<String, AtomicU64>,
    durations: DashMap<String, DurationEwma>,
}

impl AtomicMetrics {
    /// Creates an empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; zero when never incremented
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// EWMA of a duration series; `None` when never observed
    #[must_use]
    pub fn average_duration(&self, name: &str) -> Option<Duration> {
        self.durations.get(name).map(|e| e.average())
    }

    /// Snapshot of all counters for scraping
    #[must_use]
    pub fn counters(&self) -> Vec<(String, u64)> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

impl MetricsCollector for AtomicMetrics {
    fn incr(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn observe_duration(&self, name: &str, duration: Duration) {
        self.durations
            .entry(name.to_string())
            .or_insert_with(DurationEwma::new)
            .observe(duration);
    }
}

/// Shared handle to a metrics collector
pub type SharedMetrics = Arc<dyn MetricsCollector>;
