//! Transport adapter model
//!
//! Every wire protocol presents the same contract: connect, disconnect,
//! send, subscribe, statistics. The shared machinery here supplies the
//! lifecycle state machine, connect retry with backoff, payload compression,
//! per-adapter statistics, and the subscription registry that lets
//! subscriptions survive reconnects.

pub mod framing;
pub mod pool;
pub mod tcp;

use crate::config::CompressionConfig;
use crate::domain_types::SubscriptionId;
use crate::error::TransportError;
use crate::message::TransportMessage;
use crate::metrics::DurationEwma;
use crate::retry::RetryPolicy;
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use framing::{FrameDecoder, FramingProtocol, encode_frame};
pub use pool::{ConnectionPool, PoolLease, PooledResource, ResourceFactory};
pub use tcp::TcpTransport;

/// Lifecycle state of a transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportState {
    /// No endpoint established
    Disconnected,
    /// Establishing the endpoint
    Connecting,
    /// Ready for send and subscribe delivery
    Connected,
    /// Wire failure observed; re-establishing with subscriptions preserved
    Reconnecting,
    /// Draining in-flight sends before teardown
    Disconnecting,
    /// Terminal: resources released
    Disposed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
            Self::Disposed => "disposed",
        };
        write!(f, "{s}")
    }
}

/// Wire-level counters every adapter maintains
#[derive(Debug, Default)]
pub struct TransportStats {
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) messages_in: AtomicU64,
    pub(crate) messages_out: AtomicU64,
    pub(crate) send_successes: AtomicU64,
    pub(crate) send_failures: AtomicU64,
    pub(crate) current_connections: AtomicU64,
    pub(crate) dropped_while_paused: AtomicU64,
    pub(crate) send_latency: DurationEwma,
    pub(crate) last_error: Mutex<Option<String>>,
}

impl TransportStats {
    pub(crate) fn record_send(&self, bytes: usize, latency: Duration) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.send_successes.fetch_add(1, Ordering::Relaxed);
        self.send_latency.observe(latency);
    }

    pub(crate) fn record_send_failure(&self, error: &TransportError) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("stats poisoned") = Some(error.to_string());
    }

    pub(crate) fn record_receive(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            send_successes: self.send_successes.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            dropped_while_paused: self.dropped_while_paused.load(Ordering::Relaxed),
            average_send_latency: self.send_latency.average(),
            last_error: self.last_error.lock().expect("stats poisoned").clone(),
        }
    }
}

/// Point-in-time view of adapter statistics, exposed for scraping
#[derive(Debug, Clone, Serialize)]
pub struct TransportStatsSnapshot {
    /// Bytes received
    pub bytes_in: u64,
    /// Bytes written
    pub bytes_out: u64,
    /// Messages received
    pub messages_in: u64,
    /// Messages written
    pub messages_out: u64,
    /// Successful sends
    pub send_successes: u64,
    /// Failed sends
    pub send_failures: u64,
    /// Live connections
    pub current_connections: u64,
    /// Messages dropped by paused subscriptions
    pub dropped_while_paused: u64,
    /// EWMA send latency
    pub average_send_latency: Duration,
    /// Rendering of the most recent error
    pub last_error: Option<String>,
}

/// Handler invoked for each message delivered to a subscription
pub type TransportHandler = Arc<dyn Fn(TransportMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// The uniform transport contract all wire protocols implement
#[async_trait]
pub trait Transport: Send + Sync {
    /// Adapter name for logs and diagnostics
    fn name(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> TransportState;

    /// Establishes or binds the endpoint, retrying transient failures per
    /// the configured backoff policy
    ///
    /// # Errors
    ///
    /// `InvalidState` when already connected or disposed; `Wire`/`Timeout`
    /// when every attempt fails.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Closes subscriptions, drains in-flight sends up to a grace deadline,
    /// releases resources, and transitions to `Disposed`
    ///
    /// # Errors
    ///
    /// `Wire` when teardown I/O fails; the transport still ends `Disposed`.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Serializes the envelope and writes it to the wire.
    ///
    /// `destination` selects a connection (server adapters) or is ignored
    /// (client adapters); `None` broadcasts on server adapters.
    ///
    /// # Errors
    ///
    /// `NotConnected`, `Rejected`, `Wire`, `Timeout`.
    async fn send(
        &self,
        envelope: &crate::message::Envelope,
        destination: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Registers a delivery handler, optionally filtered by source.
    ///
    /// The returned subscription supports pause (messages dropped, not
    /// buffered), resume, and unsubscribe, and survives reconnects.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the transport is disposed.
    async fn subscribe(
        &self,
        source: Option<&str>,
        handler: TransportHandler,
    ) -> Result<TransportSubscription, TransportError>;

    /// Wire-level statistics
    fn statistics(&self) -> TransportStatsSnapshot;
}

struct SubscriptionEntry {
    source: Option<String>,
    handler: TransportHandler,
    paused: Arc<AtomicBool>,
    error_tx: Option<mpsc::Sender<TransportError>>,
}

/// Registry of live subscriptions, shared between an adapter's delivery
/// loops and the handles given to callers.
///
/// Keeping subscriptions here (not on individual connections) is what makes
/// them survive reconnects.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<SubscriptionId, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no subscriptions exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(
        self: &Arc<Self>,
        source: Option<String>,
        handler: TransportHandler,
        with_error_channel: bool,
        stats: Arc<TransportStats>,
    ) -> TransportSubscription {
        let id = SubscriptionId::generate();
        let paused = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = if with_error_channel {
            let (tx, rx) = mpsc::channel(16);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.entries.insert(
            id,
            SubscriptionEntry {
                source,
                handler,
                paused: paused.clone(),
                error_tx,
            },
        );
        TransportSubscription {
            id,
            paused,
            registry: Arc::downgrade(self),
            error_rx,
            stats,
        }
    }

    /// Delivers a message to every matching, unpaused subscription; returns
    /// how many handlers ran
    pub(crate) async fn deliver(
        &self,
        source: Option<&str>,
        message: &TransportMessage,
        stats: &TransportStats,
    ) -> usize {
        let mut handlers = Vec::new();
        for entry in self.entries.iter() {
            let matches = match (&entry.source, source) {
                (None, _) => true,
                (Some(wanted), Some(actual)) => wanted == actual,
                (Some(_), None) => false,
            };
            if !matches {
                continue;
            }
            if entry.paused.load(Ordering::Relaxed) {
                stats.dropped_while_paused.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            handlers.push(entry.handler.clone());
        }
        let delivered = handlers.len();
        for handler in handlers {
            handler(message.clone()).await;
        }
        delivered
    }

    /// Forwards an error to subscriptions that opted into the error channel
    pub(crate) fn deliver_error(&self, error: &TransportError) {
        for entry in self.entries.iter() {
            if let Some(tx) = &entry.error_tx {
                let _ = tx.try_send(clone_error_kind(error));
            }
        }
    }

    fn remove(&self, id: SubscriptionId) {
        self.entries.remove(&id);
    }
}

/// Handle to one transport subscription
pub struct TransportSubscription {
    id: SubscriptionId,
    paused: Arc<AtomicBool>,
    registry: Weak<SubscriptionRegistry>,
    error_rx: Option<mpsc::Receiver<TransportError>>,
    stats: Arc<TransportStats>,
}

impl TransportSubscription {
    /// Identity of this subscription
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Pauses delivery; incoming messages for this subscription are dropped
    /// (not buffered) while paused
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resumes delivery
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Whether delivery is paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Messages dropped across the adapter while subscriptions were paused
    #[must_use]
    pub fn dropped_while_paused(&self) -> u64 {
        self.stats.dropped_while_paused.load(Ordering::Relaxed)
    }

    /// Takes the per-subscription error channel, if it was requested
    pub fn take_error_channel(&mut self) -> Option<mpsc::Receiver<TransportError>> {
        self.error_rx.take()
    }

    /// Removes the subscription now
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Compresses the payload in place when compression is enabled and the
/// payload crosses the size threshold
///
/// # Errors
///
/// `Wire` when the compressor fails.
pub(crate) fn maybe_compress(
    message: &mut TransportMessage,
    config: &CompressionConfig,
) -> Result<(), TransportError> {
    if !config.enabled || message.payload.len() < config.min_size {
        return Ok(());
    }
    let compressed = lz4::block::compress(&message.payload, None, true)?;
    if compressed.len() < message.payload.len() {
        message.payload = compressed;
        message
            .headers
            .insert("content-encoding".to_string(), serde_json::json!("lz4"));
    }
    Ok(())
}

/// Reverses [`maybe_compress`] on receive
///
/// # Errors
///
/// `Wire` when the compressed payload is corrupt.
pub(crate) fn maybe_decompress(message: &mut TransportMessage) -> Result<(), TransportError> {
    let is_lz4 = message
        .headers
        .get("content-encoding")
        .and_then(|v| v.as_str())
        == Some("lz4");
    if !is_lz4 {
        return Ok(());
    }
    message.payload = lz4::block::decompress(&message.payload, None)?;
    message.headers.remove("content-encoding");
    Ok(())
}

/// Runs a connect attempt under the retry policy with capped attempts.
///
/// Transient failures back off (with jitter when configured); cancellation
/// aborts between attempts.
///
/// # Errors
///
/// The last attempt's error once the cap is reached, or `Timeout` when the
/// caller's token fires.
pub(crate) async fn connect_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    max_attempts: u32,
    time: &SharedTimeProvider,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempts >= max_attempts.max(1) {
                    return Err(error);
                }
                let delay = policy.delay_before_next(attempts);
                warn!(
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "connect attempt failed, backing off"
                );
                tokio::select! {
                    () = time.sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(TransportError::Timeout {
                            elapsed_ms: delay.as_millis() as u64,
                        });
                    }
                }
            }
        }
    }
}

/// Millisecond timestamp helper for activity tracking
pub(crate) fn monotonic_ms(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// Marks activity on a connection
pub(crate) fn touch_activity(last_activity: &AtomicU64, epoch: Instant) {
    last_activity.store(monotonic_ms(epoch), Ordering::Relaxed);
}

/// Rebuilds an error preserving its kind, for fan-out to error channels.
///
/// Non-reconstructible causes degrade to `Rejected` with the rendered text.
fn clone_error_kind(error: &TransportError) -> TransportError {
    match error {
        TransportError::NotConnected => TransportError::NotConnected,
        TransportError::Rejected { reason } => TransportError::Rejected {
            reason: reason.clone(),
        },
        TransportError::Wire { source } => TransportError::Wire {
            source: std::io::Error::new(source.kind(), source.to_string()),
        },
        TransportError::Timeout { elapsed_ms } => TransportError::Timeout {
            elapsed_ms: *elapsed_ms,
        },
        TransportError::InvalidFrame { reason } => TransportError::InvalidFrame {
            reason: reason.clone(),
        },
        TransportError::PeerClosed => TransportError::PeerClosed,
        TransportError::HeartbeatTimeout => TransportError::HeartbeatTimeout,
        TransportError::InvalidState { state } => TransportError::InvalidState {
            state: state.clone(),
        },
        other => TransportError::Rejected {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{MessagePriority, MessageType};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    fn message(payload: Vec<u8>) -> TransportMessage {
        TransportMessage {
            payload,
            content_type: "application/json".to_string(),
            message_type: MessageType::try_new("test.msg".to_string()).unwrap(),
            source: None,
            destination: None,
            priority: MessagePriority::default(),
            ttl: None,
            headers: HashMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn compression_round_trips_above_threshold() {
        let config = CompressionConfig {
            enabled: true,
            min_size: 16,
        };
        let original = vec![b'a'; 4096];
        let mut msg = message(original.clone());
        maybe_compress(&mut msg, &config).unwrap();
        assert!(msg.payload.len() < original.len());
        assert_eq!(
            msg.headers.get("content-encoding"),
            Some(&serde_json::json!("lz4"))
        );

        maybe_decompress(&mut msg).unwrap();
        assert_eq!(msg.payload, original);
        assert!(!msg.headers.contains_key("content-encoding"));
    }

    #[test]
    fn small_payloads_skip_compression() {
        let config = CompressionConfig {
            enabled: true,
            min_size: 1024,
        };
        let mut msg = message(b"tiny".to_vec());
        maybe_compress(&mut msg, &config).unwrap();
        assert_eq!(msg.payload, b"tiny");
        assert!(!msg.headers.contains_key("content-encoding"));
    }

    #[tokio::test]
    async fn paused_subscription_drops_messages() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(TransportStats::default());
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        let handler: TransportHandler = Arc::new(move |_msg| {
            let received = received2.clone();
            Box::pin(async move {
                received.fetch_add(1, Ordering::SeqCst);
            })
        });
        let subscription = registry.insert(None, handler, false, stats.clone());

        registry.deliver(None, &message(vec![1]), &stats).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);

        subscription.pause();
        registry.deliver(None, &message(vec![2]), &stats).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(subscription.dropped_while_paused(), 1);

        subscription.resume();
        registry.deliver(None, &message(vec![3]), &stats).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_filter_selects_subscriptions() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(TransportStats::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handler: TransportHandler = Arc::new(move |_msg| {
            let count = count2.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        });
        let _sub = registry.insert(Some("conn-1".to_string()), handler, false, stats.clone());

        registry.deliver(Some("conn-1"), &message(vec![1]), &stats).await;
        registry.deliver(Some("conn-2"), &message(vec![2]), &stats).await;
        registry.deliver(None, &message(vec![3]), &stats).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_entry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(TransportStats::default());
        let handler: TransportHandler = Arc::new(|_msg| Box::pin(async {}));
        let subscription = registry.insert(None, handler, false, stats);
        assert_eq!(registry.len(), 1);
        subscription.unsubscribe();
        assert_eq!(registry.len(), 0);
    }
}
