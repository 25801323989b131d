//! Type-keyed handler registry
//!
//! Registrations are keyed by `(message type, category)`. Commands and
//! queries admit one active handler per type; re-registration replaces the
//! prior handler with a warning. Events admit many, ordered by registration
//! priority with ties broken by registration order.

use crate::domain_types::{MessageType, SubscriptionId};
use crate::message::{Envelope, MessageCategory};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

use super::pipeline::PipelineContext;

/// Predicate deciding whether a registration sees a given envelope
pub type HandlerFilter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Options attached to a handler registration
#[derive(Clone)]
pub struct HandlerOptions {
    /// Human-readable handler name, used in logs and dead-letter entries
    pub name: String,
    /// Invocation order among event handlers; higher runs earlier
    pub priority: i32,
    /// Per-invocation timeout; the bus default applies when absent
    pub timeout: Option<Duration>,
    /// Retry policy; the bus default applies when absent
    pub retry: Option<RetryPolicy>,
    /// Cap on concurrent invocations of this handler
    pub max_concurrency: Option<usize>,
    /// Envelope filter; `None` accepts everything
    pub filter: Option<HandlerFilter>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            name: "<handler>".to_string(),
            priority: 0,
            timeout: None,
            retry: None,
            max_concurrency: None,
            filter: None,
        }
    }
}

impl HandlerOptions {
    /// Creates options with the given handler name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the invocation priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-invocation timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Caps concurrent invocations
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Sets the envelope filter
    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&Envelope) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl std::fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("max_concurrency", &self.max_concurrency)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/// Terminal message handler invoked at the end of a pipeline.
///
/// Handler errors are opaque to the core; the bus wraps them into
/// `BusError::Handler` with the registration name attached.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles the envelope in the context, returning an optional response
    /// payload (commands and queries) or `None` (events).
    async fn handle(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<Option<serde_json::Value>, anyhow::Error>;
}

/// One live registration
pub struct HandlerEntry {
    /// Registration identity, used for targeted removal
    pub id: SubscriptionId,
    /// The handler itself
    pub handler: Arc<dyn MessageHandler>,
    /// Registration options
    pub options: HandlerOptions,
    /// Monotonic registration sequence for tie-breaking
    pub sequence: u64,
    /// Concurrency limiter derived from `options.max_concurrency`
    pub concurrency: Option<Arc<Semaphore>>,
}

impl HandlerEntry {
    /// Whether this registration accepts the envelope
    #[must_use]
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        self.options.filter.as_ref().is_none_or(|f| f(envelope))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum SlotKind {
    Single(MessageCategory),
    Event,
}

/// Registry of handlers keyed by `(message type, category)`
#[derive(Default)]
pub struct HandlerRegistry {
    commands: DashMap<MessageType, Arc<HandlerEntry>>,
    queries: DashMap<MessageType, Arc<HandlerEntry>>,
    events: DashMap<MessageType, Vec<Arc<HandlerEntry>>>,
    sequence: AtomicU64,
}

impl HandlerRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, returning its subscription id.
    ///
    /// Command and query registrations replace any prior handler for the
    /// same type with a warning; event registrations accumulate.
    pub fn register(
        self: &Arc<Self>,
        category: MessageCategory,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
        options: HandlerOptions,
    ) -> Subscription {
        let id = SubscriptionId::generate();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let concurrency = options
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let entry = Arc::new(HandlerEntry {
            id,
            handler,
            options,
            sequence,
            concurrency,
        });

        match category {
            MessageCategory::Command | MessageCategory::Query => {
                let slot = if category == MessageCategory::Command {
                    &self.commands
                } else {
                    &self.queries
                };
                if let Some(previous) = slot.insert(message_type.clone(), entry) {
                    warn!(
                        message_type = %message_type,
                        category = %category,
                        replaced = %previous.options.name,
                        "replacing existing handler registration"
                    );
                }
            }
            MessageCategory::Event => {
                let mut handlers = self.events.entry(message_type.clone()).or_default();
                handlers.push(entry);
                handlers.sort_by(|a, b| {
                    b.options
                        .priority
                        .cmp(&a.options.priority)
                        .then(a.sequence.cmp(&b.sequence))
                });
            }
        }

        Subscription {
            registry: Arc::downgrade(self),
            kind: match category {
                MessageCategory::Event => SlotKind::Event,
                other => SlotKind::Single(other),
            },
            message_type,
            id,
        }
    }

    /// Resolves the single handler for a command or query type
    #[must_use]
    pub fn resolve_single(
        &self,
        category: MessageCategory,
        message_type: &MessageType,
    ) -> Option<Arc<HandlerEntry>> {
        match category {
            MessageCategory::Command => self.commands.get(message_type).map(|e| e.clone()),
            MessageCategory::Query => self.queries.get(message_type).map(|e| e.clone()),
            MessageCategory::Event => None,
        }
    }

    /// Resolves all event handlers accepting the envelope, in priority order
    #[must_use]
    pub fn resolve_events(&self, envelope: &Envelope) -> Vec<Arc<HandlerEntry>> {
        self.events
            .get(&envelope.message_type)
            .map(|handlers| {
                handlers
                    .iter()
                    .filter(|entry| entry.accepts(envelope))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of live registrations
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
            + self.queries.len()
            + self.events.iter().map(|e| e.value().len()).sum::<usize>()
    }

    /// Whether the registry holds no registrations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, kind: SlotKind, message_type: &MessageType, id: SubscriptionId) {
        match kind {
            SlotKind::Single(category) => {
                let slot = if category == MessageCategory::Command {
                    &self.commands
                } else {
                    &self.queries
                };
                // Only remove if this subscription still owns the slot; a
                // replacement registration must survive the old guard's drop.
                slot.remove_if(message_type, |_, entry| entry.id == id);
            }
            SlotKind::Event => {
                if let Some(mut handlers) = self.events.get_mut(message_type) {
                    handlers.retain(|entry| entry.id != id);
                }
            }
        }
    }
}

/// Guard representing one registration; dropping it removes exactly that
/// registration
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    kind: SlotKind,
    message_type: MessageType,
    id: SubscriptionId,
}

impl Subscription {
    /// Identity of this registration
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes the registration now
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Detaches the guard so the registration outlives it
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.kind, &self.message_type, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait]
    impl MessageHandler for NullHandler {
        async fn handle(
            &self,
            _ctx: &mut PipelineContext,
        ) -> Result<Option<serde_json::Value>, anyhow::Error> {
            Ok(None)
        }
    }

    fn message_type(tag: &str) -> MessageType {
        MessageType::try_new(tag.to_string()).unwrap()
    }

    #[test]
    fn subscribe_then_drop_restores_registry_size() {
        let registry = Arc::new(HandlerRegistry::new());
        assert_eq!(registry.len(), 0);
        let subscription = registry.register(
            MessageCategory::Command,
            message_type("orders.place"),
            Arc::new(NullHandler),
            HandlerOptions::default(),
        );
        assert_eq!(registry.len(), 1);
        drop(subscription);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn command_re_registration_replaces() {
        let registry = Arc::new(HandlerRegistry::new());
        let first = registry.register(
            MessageCategory::Command,
            message_type("orders.place"),
            Arc::new(NullHandler),
            HandlerOptions::named("first"),
        );
        let _second = registry.register(
            MessageCategory::Command,
            message_type("orders.place"),
            Arc::new(NullHandler),
            HandlerOptions::named("second"),
        );
        assert_eq!(registry.len(), 1);
        let resolved = registry
            .resolve_single(MessageCategory::Command, &message_type("orders.place"))
            .unwrap();
        assert_eq!(resolved.options.name, "second");

        // Dropping the replaced guard must not tear down the replacement.
        drop(first);
        assert!(
            registry
                .resolve_single(MessageCategory::Command, &message_type("orders.place"))
                .is_some()
        );
    }

    #[test]
    fn event_handlers_order_by_priority_then_registration() {
        let registry = Arc::new(HandlerRegistry::new());
        let _a = registry.register(
            MessageCategory::Event,
            message_type("orders.placed"),
            Arc::new(NullHandler),
            HandlerOptions::named("low").with_priority(1),
        );
        let _b = registry.register(
            MessageCategory::Event,
            message_type("orders.placed"),
            Arc::new(NullHandler),
            HandlerOptions::named("high").with_priority(10),
        );
        let _c = registry.register(
            MessageCategory::Event,
            message_type("orders.placed"),
            Arc::new(NullHandler),
            HandlerOptions::named("high-later").with_priority(10),
        );

        let envelope = Envelope::event("orders.placed", serde_json::json!({})).unwrap();
        let resolved = registry.resolve_events(&envelope);
        let names: Vec<&str> = resolved.iter().map(|e| e.options.name.as_str()).collect();
        assert_eq!(names, vec!["high", "high-later", "low"]);
    }

    #[test]
    fn filters_select_event_handlers() {
        let registry = Arc::new(HandlerRegistry::new());
        let _sub = registry.register(
            MessageCategory::Event,
            message_type("orders.placed"),
            Arc::new(NullHandler),
            HandlerOptions::named("big-orders")
                .with_filter(|envelope| envelope.payload["amount"].as_u64() > Some(100)),
        );

        let small = Envelope::event("orders.placed", serde_json::json!({"amount": 5})).unwrap();
        let big = Envelope::event("orders.placed", serde_json::json!({"amount": 500})).unwrap();
        assert!(registry.resolve_events(&small).is_empty());
        assert_eq!(registry.resolve_events(&big).len(), 1);
    }
}
