//! Bounded pool of reusable connections with health and idle policy
//!
//! Borrowers hold a scoped lease. An explicitly released healthy connection
//! returns to the pool; an unhealthy one is closed and the pool replenishes
//! toward its minimum. A lease dropped without release is reclaimed with a
//! warning. The pool lock is never held across I/O.

use crate::config::PoolConfig;
use crate::domain_types::ConnectionId;
use crate::error::{ConfigError, PoolError};
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A connection (or similar resource) the pool can manage
#[async_trait]
pub trait PooledResource: Send + Sync + 'static {
    /// Stable identity of the resource
    fn id(&self) -> ConnectionId;

    /// Health probe (for TCP, typically a zero-byte heartbeat)
    async fn is_healthy(&self) -> bool;

    /// Releases the underlying resource
    async fn close(&self);
}

/// Opens new resources on the pool's behalf
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    /// The resource type this factory produces
    type Resource: PooledResource;

    /// Establishes one new resource
    async fn establish(&self) -> Result<Self::Resource, PoolError>;
}

struct IdleEntry<R> {
    resource: Arc<R>,
    idle_since: Instant,
}

struct PoolInner<R> {
    idle: Vec<IdleEntry<R>>,
    total: usize,
    closed: bool,
}

/// Bounded connection pool
pub struct ConnectionPool<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    inner: Mutex<PoolInner<F::Resource>>,
    released: Notify,
    time: SharedTimeProvider,
}

/// Scoped lease on a pooled resource.
///
/// Prefer [`PoolLease::release`]; a lease dropped without release is
/// reclaimed into the pool with a warning.
pub struct PoolLease<F: ResourceFactory> {
    resource: Option<Arc<F::Resource>>,
    pool: Weak<ConnectionPool<F>>,
    unhealthy: bool,
}

impl<F: ResourceFactory> PoolLease<F> {
    /// The leased resource
    ///
    /// # Panics
    ///
    /// Never panics in practice: the resource is only vacated during
    /// release/drop.
    #[must_use]
    pub fn get(&self) -> &F::Resource {
        self.resource
            .as_deref()
            .expect("lease accessed after release")
    }

    /// Marks the leased connection unhealthy so release closes it
    pub fn mark_unhealthy(&mut self) {
        self.unhealthy = true;
    }

    /// Returns the connection to the pool (or closes it when unhealthy)
    pub async fn release(mut self) {
        let resource = self.resource.take();
        let unhealthy = self.unhealthy;
        if let (Some(resource), Some(pool)) = (resource, self.pool.upgrade()) {
            pool.return_resource(resource, !unhealthy).await;
        }
    }
}

impl<F: ResourceFactory> Drop for PoolLease<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take()
            && let Some(pool) = self.pool.upgrade()
        {
            warn!(
                connection = %resource.id(),
                "pool lease dropped without release; reclaiming"
            );
            pool.reclaim(resource);
        }
    }
}

impl<F: ResourceFactory> ConnectionPool<F> {
    /// Creates a pool over a factory
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` for inconsistent bounds.
    pub fn new(
        factory: F,
        config: PoolConfig,
        time: SharedTimeProvider,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            factory,
            config,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                total: 0,
                closed: false,
            }),
            released: Notify::new(),
            time,
        }))
    }

    /// Opens connections up to the configured minimum
    ///
    /// # Errors
    ///
    /// The first establish failure; connections opened so far are kept.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        loop {
            {
                let inner = self.inner.lock().expect("pool poisoned");
                if inner.closed || inner.total >= self.config.min {
                    return Ok(());
                }
            }
            let resource = self.establish_slot().await?;
            {
                let mut inner = self.inner.lock().expect("pool poisoned");
                inner.idle.push(IdleEntry {
                    resource,
                    idle_since: Instant::now(),
                });
            }
            self.released.notify_one();
        }
    }

    /// Open connections (leased plus idle)
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().expect("pool poisoned").total
    }

    /// Idle connections available for lease
    #[must_use]
    pub fn idle(&self) -> usize {
        self.inner.lock().expect("pool poisoned").idle.len()
    }

    /// Acquires a lease, waiting up to the configured acquire timeout when
    /// the pool is empty at its maximum
    ///
    /// # Errors
    ///
    /// `AcquireTimeout`, `Cancelled`, `Closed`, or `Establish` when opening
    /// a fresh connection fails.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<PoolLease<F>, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            enum Plan<R> {
                Lease(Arc<R>),
                Open,
                Wait,
            }
            let plan = {
                let mut inner = self.inner.lock().expect("pool poisoned");
                if inner.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(entry) = inner.idle.pop() {
                    Plan::Lease(entry.resource)
                } else if inner.total < self.config.max {
                    // Reserve the slot before the (lock-free) establish.
                    inner.total += 1;
                    Plan::Open
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Lease(resource) => {
                    return Ok(self.lease(resource));
                }
                Plan::Open => match self.establish_reserved(deadline).await {
                    Ok(resource) => return Ok(self.lease(resource)),
                    Err(err) => {
                        let mut inner = self.inner.lock().expect("pool poisoned");
                        inner.total -= 1;
                        return Err(err);
                    }
                },
                Plan::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PoolError::AcquireTimeout {
                            waited_ms: self.config.acquire_timeout.as_millis() as u64,
                        });
                    }
                    tokio::select! {
                        () = self.released.notified() => {}
                        () = cancel.cancelled() => return Err(PoolError::Cancelled),
                        () = tokio::time::sleep(remaining) => {
                            return Err(PoolError::AcquireTimeout {
                                waited_ms: self.config.acquire_timeout.as_millis() as u64,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Closes the pool: idle connections are closed, waiters are woken with
    /// `Closed`
    pub async fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.closed = true;
            inner.total -= inner.idle.len();
            std::mem::take(&mut inner.idle)
        };
        for entry in idle {
            entry.resource.close().await;
        }
        self.released.notify_waiters();
    }

    /// Runs the idle sweep and health probe loop until cancelled
    pub async fn run_maintenance(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.time.sleep(self.config.health_check_interval) => {}
            }
            self.maintenance_pass().await;
        }
    }

    async fn maintenance_pass(&self) {
        // Pull candidates out under the lock, probe without it.
        let (expired, to_probe) = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            if inner.closed {
                return;
            }
            let total = inner.total;
            let mut expired = Vec::new();
            let mut keep = Vec::new();
            for entry in inner.idle.drain(..) {
                let above_min = total - expired.len() > self.config.min;
                if above_min && entry.idle_since.elapsed() >= self.config.idle_timeout {
                    expired.push(entry.resource);
                } else {
                    keep.push(entry);
                }
            }
            inner.total -= expired.len();
            let to_probe: Vec<Arc<F::Resource>> =
                keep.iter().map(|entry| entry.resource.clone()).collect();
            inner.idle = keep;
            (expired, to_probe)
        };

        for resource in expired {
            debug!(connection = %resource.id(), "closing idle connection");
            resource.close().await;
        }

        for resource in to_probe {
            if resource.is_healthy().await {
                continue;
            }
            warn!(connection = %resource.id(), "health probe failed, closing connection");
            let removed = {
                let mut inner = self.inner.lock().expect("pool poisoned");
                let before = inner.idle.len();
                inner.idle.retain(|entry| entry.resource.id() != resource.id());
                let removed = before - inner.idle.len();
                inner.total -= removed;
                removed > 0
            };
            if removed {
                resource.close().await;
            }
        }
    }

    fn lease(self: &Arc<Self>, resource: Arc<F::Resource>) -> PoolLease<F> {
        PoolLease {
            resource: Some(resource),
            pool: Arc::downgrade(self),
            unhealthy: false,
        }
    }

    async fn establish_slot(&self) -> Result<Arc<F::Resource>, PoolError> {
        {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.total += 1;
        }
        match self.factory.establish().await {
            Ok(resource) => Ok(Arc::new(resource)),
            Err(err) => {
                let mut inner = self.inner.lock().expect("pool poisoned");
                inner.total -= 1;
                Err(err)
            }
        }
    }

    async fn establish_reserved(&self, deadline: Instant) -> Result<Arc<F::Resource>, PoolError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.factory.establish()).await {
            Ok(Ok(resource)) => Ok(Arc::new(resource)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PoolError::AcquireTimeout {
                waited_ms: self.config.acquire_timeout.as_millis() as u64,
            }),
        }
    }

    async fn return_resource(self: &Arc<Self>, resource: Arc<F::Resource>, healthy: bool) {
        if healthy {
            let mut inner = self.inner.lock().expect("pool poisoned");
            if inner.closed {
                inner.total -= 1;
            } else {
                inner.idle.push(IdleEntry {
                    resource,
                    idle_since: Instant::now(),
                });
            }
            drop(inner);
            self.released.notify_one();
            return;
        }

        let below_min = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.total -= 1;
            !inner.closed && inner.total < self.config.min
        };
        resource.close().await;
        if below_min {
            // Replenish toward the minimum in the background.
            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(err) = pool.warm_up().await {
                    warn!(error = %err, "pool replenish failed");
                }
            });
        }
        self.released.notify_one();
    }

    fn reclaim(&self, resource: Arc<F::Resource>) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if inner.closed {
            inner.total -= 1;
        } else {
            inner.idle.push(IdleEntry {
                resource,
                idle_since: Instant::now(),
            });
        }
        drop(inner);
        self.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeConnection {
        id: ConnectionId,
        healthy: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PooledResource for FakeConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        established: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ResourceFactory for FakeFactory {
        type Resource = FakeConnection;

        async fn establish(&self) -> Result<FakeConnection, PoolError> {
            self.established.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                id: ConnectionId::generate(),
                healthy: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            })
        }
    }

    fn pool_with(
        min: usize,
        max: usize,
        acquire_timeout: Duration,
    ) -> (Arc<ConnectionPool<FakeFactory>>, Arc<AtomicUsize>) {
        let established = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new(
            FakeFactory {
                established: established.clone(),
            },
            PoolConfig {
                min,
                max,
                idle_timeout: Duration::from_secs(60),
                acquire_timeout,
                health_check_interval: Duration::from_secs(60),
            },
            test_time_provider(),
        )
        .unwrap();
        (pool, established)
    }

    #[tokio::test]
    async fn acquire_reuses_released_connections() {
        let (pool, established) = pool_with(0, 2, Duration::from_millis(200));
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&cancel).await.unwrap();
        let first_id = lease.get().id();
        lease.release().await;

        let lease = pool.acquire(&cancel).await.unwrap();
        assert_eq!(lease.get().id(), first_id);
        assert_eq!(established.load(Ordering::SeqCst), 1);
        lease.release().await;
    }

    #[tokio::test]
    async fn saturated_pool_times_out_then_recovers() {
        let (pool, _) = pool_with(0, 2, Duration::from_millis(200));
        let cancel = CancellationToken::new();

        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.size(), 2);

        let started = Instant::now();
        let result = pool.acquire(&cancel).await;
        assert!(matches!(result, Err(PoolError::AcquireTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(190));

        a.release().await;
        let started = Instant::now();
        let c = pool.acquire(&cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        c.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn pool_never_exceeds_max() {
        let (pool, established) = pool_with(0, 3, Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let mut leases = Vec::new();
        for _ in 0..3 {
            leases.push(pool.acquire(&cancel).await.unwrap());
        }
        assert!(pool.acquire(&cancel).await.is_err());
        assert_eq!(pool.size(), 3);
        assert_eq!(established.load(Ordering::SeqCst), 3);
        for lease in leases {
            lease.release().await;
        }
    }

    #[tokio::test]
    async fn unhealthy_release_closes_the_connection() {
        let (pool, _) = pool_with(0, 2, Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let mut lease = pool.acquire(&cancel).await.unwrap();
        let resource = lease.get().id();
        lease.mark_unhealthy();
        lease.release().await;

        assert_eq!(pool.size(), 0);
        // A fresh acquire opens a brand new connection.
        let lease = pool.acquire(&cancel).await.unwrap();
        assert_ne!(lease.get().id(), resource);
        lease.release().await;
    }

    #[tokio::test]
    async fn dropped_lease_is_reclaimed() {
        let (pool, established) = pool_with(0, 1, Duration::from_millis(200));
        let cancel = CancellationToken::new();

        {
            let _lease = pool.acquire(&cancel).await.unwrap();
            // Dropped without release.
        }
        assert_eq!(pool.idle(), 1);

        let lease = pool.acquire(&cancel).await.unwrap();
        assert_eq!(established.load(Ordering::SeqCst), 1);
        lease.release().await;
    }

    #[tokio::test]
    async fn warm_up_opens_min_connections() {
        let (pool, established) = pool_with(2, 4, Duration::from_millis(100));
        pool.warm_up().await.unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle(), 2);
        assert_eq!(established.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_waiting_acquire() {
        let (pool, _) = pool_with(0, 1, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let held = pool.acquire(&cancel).await.unwrap();

        let pool2 = pool.clone();
        let child = cancel.child_token();
        let child2 = child.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&child2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Cancelled)));
        held.release().await;
    }

    #[tokio::test]
    async fn maintenance_closes_unhealthy_idle_connections() {
        let (pool, _) = pool_with(0, 2, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let lease = pool.acquire(&cancel).await.unwrap();
        lease.get().healthy.store(false, Ordering::SeqCst);
        lease.release().await;
        assert_eq!(pool.idle(), 1);

        pool.maintenance_pass().await;
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.size(), 0);
    }
}
