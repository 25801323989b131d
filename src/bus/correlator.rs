//! Request/reply correlation and conversation ancestry tracking
//!
//! The correlator keeps an in-memory table of in-flight requests keyed by
//! correlation id, sharded for concurrency. Entries are removed on reply,
//! cancellation, or deadline; a sweeper task evicts the rest. Late replies
//! for ids that are no longer pending are dropped and counted.

use crate::domain_types::{CorrelationId, MessageId};
use crate::message::Envelope;
use crate::metrics::SharedMetrics;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SHARD_COUNT: usize = 16;
const SWEEP_FLOOR: Duration = Duration::from_millis(100);
const ANCESTRY_DEPTH_CAP: usize = 128;
const ANCESTRY_CAPACITY: usize = 65_536;

struct PendingEntry {
    reply_tx: oneshot::Sender<Envelope>,
    started_at: Instant,
    deadline: Instant,
    parent: Option<CorrelationId>,
}

struct AncestryLog {
    parents: HashMap<MessageId, MessageId>,
    order: VecDeque<MessageId>,
}

/// Tracks in-flight request/reply pairs and conversation graphs
pub struct Correlator {
    shards: Vec<Mutex<HashMap<CorrelationId, PendingEntry>>>,
    ancestry: Mutex<AncestryLog>,
    metrics: SharedMetrics,
}

/// Pending reply handle returned by [`Correlator::register`].
///
/// Dropping the waiter (caller cancellation) removes the entry immediately;
/// a reply arriving afterwards is dropped and counted as an orphan.
pub struct ReplyWaiter {
    correlation_id: CorrelationId,
    rx: Option<oneshot::Receiver<Envelope>>,
    correlator: Arc<Correlator>,
}

impl ReplyWaiter {
    /// The correlation id this waiter listens on
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Waits for the reply; `None` when the entry was evicted (deadline) or
    /// the correlator shut down
    pub async fn wait(mut self) -> Option<Envelope> {
        let rx = self.rx.take()?;
        let result = rx.await.ok();
        self.correlator.remove(self.correlation_id);
        result
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        self.correlator.remove(self.correlation_id);
    }
}

impl Correlator {
    /// Creates an empty correlator
    #[must_use]
    pub fn new(metrics: SharedMetrics) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            ancestry: Mutex::new(AncestryLog {
                parents: HashMap::new(),
                order: VecDeque::new(),
            }),
            metrics,
        }
    }

    fn shard(&self, id: CorrelationId) -> &Mutex<HashMap<CorrelationId, PendingEntry>> {
        let uuid: uuid::Uuid = id.into_inner();
        let index = (uuid.as_u128() % SHARD_COUNT as u128) as usize;
        &self.shards[index]
    }

    /// Registers an in-flight request and returns its reply waiter
    #[must_use]
    pub fn register(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
        timeout: Duration,
        parent: Option<CorrelationId>,
    ) -> ReplyWaiter {
        let (reply_tx, rx) = oneshot::channel();
        let now = Instant::now();
        let entry = PendingEntry {
            reply_tx,
            started_at: now,
            deadline: now + timeout,
            parent,
        };
        self.shard(correlation_id)
            .lock()
            .expect("correlator shard poisoned")
            .insert(correlation_id, entry);
        ReplyWaiter {
            correlation_id,
            rx: Some(rx),
            correlator: self.clone(),
        }
    }

    /// Completes the waiter registered under the reply's correlation id.
    ///
    /// Returns `false` for orphan replies (already cancelled, completed, or
    /// swept), which are counted under `correlator.orphan_reply`.
    pub fn complete(&self, correlation_id: CorrelationId, reply: Envelope) -> bool {
        let entry = self
            .shard(correlation_id)
            .lock()
            .expect("correlator shard poisoned")
            .remove(&correlation_id);
        match entry {
            Some(entry) => {
                let elapsed = entry.started_at.elapsed();
                self.metrics
                    .observe_duration("correlator.reply_latency", elapsed);
                if entry.reply_tx.send(reply).is_err() {
                    self.metrics.incr("correlator.orphan_reply", 1);
                    return false;
                }
                true
            }
            None => {
                self.metrics.incr("correlator.orphan_reply", 1);
                false
            }
        }
    }

    fn remove(&self, correlation_id: CorrelationId) {
        self.shard(correlation_id)
            .lock()
            .expect("correlator shard poisoned")
            .remove(&correlation_id);
    }

    /// Number of in-flight entries
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("correlator shard poisoned").len())
            .sum()
    }

    /// Parent conversation of an in-flight entry
    #[must_use]
    pub fn parent_of(&self, correlation_id: CorrelationId) -> Option<CorrelationId> {
        self.shard(correlation_id)
            .lock()
            .expect("correlator shard poisoned")
            .get(&correlation_id)
            .and_then(|entry| entry.parent)
    }

    /// Records that `child` was caused by `parent`
    pub fn record_causation(&self, child: MessageId, parent: MessageId) {
        let mut log = self.ancestry.lock().expect("ancestry log poisoned");
        if log.parents.insert(child, parent).is_none() {
            log.order.push_back(child);
        }
        while log.order.len() > ANCESTRY_CAPACITY {
            if let Some(oldest) = log.order.pop_front() {
                log.parents.remove(&oldest);
            }
        }
    }

    /// Walks causation ancestry from a message up to the depth cap.
    ///
    /// The cap bounds the walk even if the recorded graph contains a cycle.
    #[must_use]
    pub fn ancestry(&self, message_id: MessageId) -> Vec<MessageId> {
        let log = self.ancestry.lock().expect("ancestry log poisoned");
        let mut chain = Vec::new();
        let mut current = message_id;
        while chain.len() < ANCESTRY_DEPTH_CAP {
            match log.parents.get(&current) {
                Some(&parent) => {
                    chain.push(parent);
                    current = parent;
                }
                None => break,
            }
        }
        chain
    }

    fn sweep(&self, now: Instant) -> (usize, Option<Instant>) {
        let mut evicted = 0;
        let mut next_deadline: Option<Instant> = None;
        for shard in &self.shards {
            let mut table = shard.lock().expect("correlator shard poisoned");
            table.retain(|_, entry| {
                if entry.deadline <= now {
                    evicted += 1;
                    false
                } else {
                    next_deadline = Some(match next_deadline {
                        Some(existing) => existing.min(entry.deadline),
                        None => entry.deadline,
                    });
                    true
                }
            });
        }
        if evicted > 0 {
            self.metrics.incr("correlator.deadline_evicted", evicted as u64);
        }
        (evicted, next_deadline)
    }

    /// Runs the deadline sweeper until the token is cancelled.
    ///
    /// The sweep interval adapts to half the nearest deadline, floored at
    /// 100 ms.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = SWEEP_FLOOR;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            let now = Instant::now();
            let (evicted, next_deadline) = self.sweep(now);
            if evicted > 0 {
                debug!(evicted, "correlator swept expired entries");
            }
            interval = next_deadline
                .map_or(SWEEP_FLOOR, |deadline| {
                    deadline.saturating_duration_since(now) / 2
                })
                .max(SWEEP_FLOOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AtomicMetrics;

    fn correlator_with_metrics() -> (Arc<Correlator>, Arc<AtomicMetrics>) {
        let metrics = Arc::new(AtomicMetrics::new());
        (Arc::new(Correlator::new(metrics.clone())), metrics)
    }

    fn reply() -> Envelope {
        Envelope::command("test.reply", serde_json::json!({"ok": true})).unwrap()
    }

    #[tokio::test]
    async fn reply_completes_the_waiter() {
        let (correlator, _) = correlator_with_metrics();
        let id = CorrelationId::generate();
        let waiter = correlator.register(id, Duration::from_secs(5), None);

        assert!(correlator.complete(id, reply()));
        let envelope = waiter.wait().await.unwrap();
        assert_eq!(envelope.payload["ok"], serde_json::json!(true));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_drops_late_reply_as_orphan() {
        let (correlator, metrics) = correlator_with_metrics();
        let id = CorrelationId::generate();
        let waiter = correlator.register(id, Duration::from_secs(5), None);
        drop(waiter);

        assert!(!correlator.complete(id, reply()));
        assert_eq!(metrics.counter("correlator.orphan_reply"), 1);
    }

    #[tokio::test]
    async fn unknown_correlation_counts_as_orphan() {
        let (correlator, metrics) = correlator_with_metrics();
        assert!(!correlator.complete(CorrelationId::generate(), reply()));
        assert_eq!(metrics.counter("correlator.orphan_reply"), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_past_deadline_entries() {
        let (correlator, _) = correlator_with_metrics();
        let id = CorrelationId::generate();
        let _waiter = correlator.register(id, Duration::from_millis(1), None);
        assert_eq!(correlator.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let (evicted, _) = correlator.sweep(Instant::now());
        assert_eq!(evicted, 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn ancestry_walks_the_causation_chain() {
        let (correlator, _) = correlator_with_metrics();
        let a = MessageId::generate();
        let b = MessageId::generate();
        let c = MessageId::generate();
        correlator.record_causation(b, a);
        correlator.record_causation(c, b);

        assert_eq!(correlator.ancestry(c), vec![b, a]);
        assert_eq!(correlator.ancestry(a), Vec::<MessageId>::new());
    }

    #[test]
    fn ancestry_walk_is_capped_on_cycles() {
        let (correlator, _) = correlator_with_metrics();
        let a = MessageId::generate();
        let b = MessageId::generate();
        correlator.record_causation(a, b);
        correlator.record_causation(b, a);

        assert_eq!(correlator.ancestry(a).len(), ANCESTRY_DEPTH_CAP);
    }

    #[test]
    fn parent_conversation_is_visible_while_pending() {
        let (correlator, _) = correlator_with_metrics();
        let parent = CorrelationId::generate();
        let child = CorrelationId::generate();
        let _waiter = correlator.register(child, Duration::from_secs(5), Some(parent));
        assert_eq!(correlator.parent_of(child), Some(parent));
    }
}
