//! Time abstraction for testable time-dependent machinery
//!
//! Retry backoff, pool idle sweeps, heartbeats, and gateway health probes all
//! sleep and read clocks through a [`TimeProvider`], so tests can run at full
//! speed without conditional compilation.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Clock and sleep facility injected into time-dependent components
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleeps for the given duration
    async fn sleep(&self, duration: Duration);

    /// Current wall-clock time
    #[must_use]
    fn now(&self) -> SystemTime;

    /// Current instant for elapsed-time measurement
    #[must_use]
    fn instant(&self) -> Instant;
}

/// Production provider backed by the tokio timer and system clock
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a new real time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Test provider that collapses sleeps to at most one millisecond so async
/// machinery still yields without waiting out real delays
#[derive(Debug, Clone, Default)]
pub struct MockTimeProvider;

impl MockTimeProvider {
    /// Creates a new mock time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    async fn sleep(&self, duration: Duration) {
        if duration > Duration::from_millis(1) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Shared handle to a time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Creates the production time provider
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider::new())
}

/// Creates a test time provider that collapses delays
#[must_use]
pub fn test_time_provider() -> SharedTimeProvider {
    Arc::new(MockTimeProvider::new())
}
