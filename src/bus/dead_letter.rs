//! Dead-letter queue: bounded buffer of terminally failed envelopes
//!
//! Entries are retained for diagnosis and explicit replay. The buffer is
//! bounded with oldest-first eviction; hooks let an external store mirror
//! the queue without the core prescribing one.

use crate::domain_types::{DeadLetterCapacity, MessageId};
use crate::error::FailureReason;
use crate::message::Envelope;
use crate::metrics::SharedMetrics;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

/// One dead-lettered envelope with its failure record
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// The original envelope
    pub envelope: Envelope,
    /// Why dispatch failed terminally
    pub reason: FailureReason,
    /// When the failure was recorded
    pub failed_at: SystemTime,
    /// Dispatch attempts so far, incremented per replay
    pub attempts: u32,
    /// Rendering of the last error
    pub last_error: String,
}

/// Hook invoked on enqueue or removal, for external persistence
pub type DeadLetterHook = Box<dyn Fn(&DeadLetterEntry) + Send + Sync>;

struct Store {
    order: VecDeque<MessageId>,
    entries: HashMap<MessageId, DeadLetterEntry>,
}

/// Bounded in-memory dead-letter queue
pub struct DeadLetterQueue {
    store: Mutex<Store>,
    capacity: usize,
    on_enqueue: Mutex<Vec<DeadLetterHook>>,
    on_remove: Mutex<Vec<DeadLetterHook>>,
    metrics: SharedMetrics,
}

impl DeadLetterQueue {
    /// Creates a queue with the given capacity
    #[must_use]
    pub fn new(capacity: DeadLetterCapacity, metrics: SharedMetrics) -> Self {
        Self {
            store: Mutex::new(Store {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
            capacity: capacity.as_usize(),
            on_enqueue: Mutex::new(Vec::new()),
            on_remove: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Records a terminally failed envelope.
    ///
    /// At capacity, the oldest entry is evicted first.
    pub fn enqueue(&self, envelope: Envelope, reason: FailureReason, last_error: impl Into<String>) {
        self.enqueue_entry(DeadLetterEntry {
            envelope,
            reason,
            failed_at: SystemTime::now(),
            attempts: 1,
            last_error: last_error.into(),
        });
    }

    fn enqueue_entry(&self, entry: DeadLetterEntry) {
        let mut evicted = Vec::new();
        {
            let mut store = self.store.lock().expect("dead-letter store poisoned");
            let id = entry.envelope.id;
            if store.entries.insert(id, entry.clone()).is_none() {
                store.order.push_back(id);
            }
            while store.entries.len() > self.capacity {
                // Ids taken out of the map earlier may linger in the order
                // deque; skip them.
                match store.order.pop_front() {
                    Some(oldest) => {
                        if let Some(old_entry) = store.entries.remove(&oldest) {
                            evicted.push(old_entry);
                        }
                    }
                    None => break,
                }
            }
        }
        self.metrics.incr("dead_letter.enqueued", 1);
        debug!(
            message_id = %entry.envelope.id,
            reason = %entry.reason,
            "envelope dead-lettered"
        );
        for hook in self.on_enqueue.lock().expect("hook list poisoned").iter() {
            hook(&entry);
        }
        for old_entry in &evicted {
            self.metrics.incr("dead_letter.evicted", 1);
            for hook in self.on_remove.lock().expect("hook list poisoned").iter() {
                hook(old_entry);
            }
        }
    }

    /// Removes and returns the entry for a message, if present.
    ///
    /// Used by the bus replay path: the entry is only restored (with an
    /// incremented attempt count) when the replay fails.
    #[must_use]
    pub fn take(&self, message_id: MessageId) -> Option<DeadLetterEntry> {
        let entry = self
            .store
            .lock()
            .expect("dead-letter store poisoned")
            .entries
            .remove(&message_id);
        if let Some(entry) = &entry {
            for hook in self.on_remove.lock().expect("hook list poisoned").iter() {
                hook(entry);
            }
        }
        entry
    }

    /// Re-inserts an entry after a failed replay, bumping its attempt count
    pub fn restore(&self, mut entry: DeadLetterEntry, last_error: impl Into<String>) {
        entry.attempts += 1;
        entry.last_error = last_error.into();
        entry.failed_at = SystemTime::now();
        self.enqueue_entry(entry);
    }

    /// Removes entries matching the filter, returning how many were dropped
    pub fn purge(&self, filter: impl Fn(&DeadLetterEntry) -> bool) -> usize {
        let removed: Vec<DeadLetterEntry> = {
            let mut store = self.store.lock().expect("dead-letter store poisoned");
            let ids: Vec<MessageId> = store
                .entries
                .iter()
                .filter(|(_, entry)| filter(entry))
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| store.entries.remove(id))
                .collect()
        };
        for entry in &removed {
            for hook in self.on_remove.lock().expect("hook list poisoned").iter() {
                hook(entry);
            }
        }
        removed.len()
    }

    /// Snapshot of entries matching the filter, oldest first
    #[must_use]
    pub fn iterate(&self, filter: impl Fn(&DeadLetterEntry) -> bool) -> Vec<DeadLetterEntry> {
        let store = self.store.lock().expect("dead-letter store poisoned");
        store
            .order
            .iter()
            .filter_map(|id| store.entries.get(id))
            .filter(|entry| filter(entry))
            .cloned()
            .collect()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.store
            .lock()
            .expect("dead-letter store poisoned")
            .entries
            .len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a hook fired after every enqueue
    pub fn on_enqueue(&self, hook: DeadLetterHook) {
        self.on_enqueue
            .lock()
            .expect("hook list poisoned")
            .push(hook);
    }

    /// Registers a hook fired after every removal (take, purge, eviction)
    pub fn on_remove(&self, hook: DeadLetterHook) {
        self.on_remove
            .lock()
            .expect("hook list poisoned")
            .push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AtomicMetrics;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(capacity: usize) -> DeadLetterQueue {
        DeadLetterQueue::new(
            DeadLetterCapacity::try_new(capacity).unwrap(),
            Arc::new(AtomicMetrics::new()),
        )
    }

    fn envelope(tag: &str) -> Envelope {
        Envelope::command(tag, serde_json::json!({})).unwrap()
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let dlq = queue(2);
        let first = envelope("cmd.a");
        let first_id = first.id;
        dlq.enqueue(first, FailureReason::HandlerError, "boom");
        dlq.enqueue(envelope("cmd.b"), FailureReason::HandlerError, "boom");
        dlq.enqueue(envelope("cmd.c"), FailureReason::HandlerError, "boom");

        assert_eq!(dlq.len(), 2);
        assert!(dlq.take(first_id).is_none());
    }

    #[test]
    fn take_then_restore_bumps_attempts() {
        let dlq = queue(10);
        let env = envelope("cmd.a");
        let id = env.id;
        dlq.enqueue(env, FailureReason::Timeout, "slow");

        let entry = dlq.take(id).unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(dlq.len(), 0);

        dlq.restore(entry, "still slow");
        let entry = dlq.take(id).unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error, "still slow");
    }

    #[test]
    fn purge_and_iterate_filter_by_reason() {
        let dlq = queue(10);
        dlq.enqueue(envelope("cmd.a"), FailureReason::Expired, "ttl");
        dlq.enqueue(envelope("cmd.b"), FailureReason::HandlerError, "boom");
        dlq.enqueue(envelope("cmd.c"), FailureReason::Expired, "ttl");

        let expired = dlq.iterate(|e| e.reason == FailureReason::Expired);
        assert_eq!(expired.len(), 2);

        let purged = dlq.purge(|e| e.reason == FailureReason::Expired);
        assert_eq!(purged, 2);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn hooks_fire_on_enqueue_and_remove() {
        let dlq = queue(10);
        let enqueued = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        {
            let enqueued = enqueued.clone();
            dlq.on_enqueue(Box::new(move |_| {
                enqueued.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let removed = removed.clone();
            dlq.on_remove(Box::new(move |_| {
                removed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let env = envelope("cmd.a");
        let id = env.id;
        dlq.enqueue(env, FailureReason::HandlerError, "boom");
        let _ = dlq.take(id);
        assert_eq!(enqueued.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn iterate_returns_oldest_first() {
        let dlq = queue(10);
        let a = envelope("cmd.a");
        let b = envelope("cmd.b");
        let (a_id, b_id) = (a.id, b.id);
        dlq.enqueue(a, FailureReason::HandlerError, "1");
        dlq.enqueue(b, FailureReason::HandlerError, "2");

        let all: Vec<MessageId> = dlq.iterate(|_| true).iter().map(|e| e.envelope.id).collect();
        assert_eq!(all, vec![a_id, b_id]);
    }
}
