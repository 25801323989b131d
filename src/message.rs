//! Message model: envelopes, typed message traits, and the on-wire
//! transport message
//!
//! An [`Envelope`] is the in-process representation of a message with headers
//! and routing metadata. A [`TransportMessage`] is what actually crosses the
//! wire: a serialized payload plus minimal routing metadata. The two are
//! deliberately distinct types.

use crate::domain_types::{CorrelationId, MessageId, MessagePriority, MessageType};
use crate::error::BusError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Header mapping attached to envelopes and transport messages.
///
/// Keys are compared case-sensitively; values are opaque to the core.
pub type Headers = HashMap<String, serde_json::Value>;

/// Semantic category of a message, driving dispatch behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCategory {
    /// Exactly one handler, optional typed response
    Command,
    /// Zero or more handlers, fire-and-forget at the bus level
    Event,
    /// Exactly one handler, returns a typed result
    Query,
}

impl std::fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Query => "query",
        };
        write!(f, "{s}")
    }
}

/// In-process representation of a message with headers and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, stable for the envelope's lifetime
    pub id: MessageId,
    /// Type tag used for handler resolution
    pub message_type: MessageType,
    /// Dispatch category
    pub category: MessageCategory,
    /// Origin timestamp
    pub timestamp: SystemTime,
    /// Groups related messages into one logical conversation
    pub correlation_id: Option<CorrelationId>,
    /// Identifier of the message that produced this one
    pub causation_id: Option<MessageId>,
    /// Logical origin label
    pub source: Option<String>,
    /// Logical destination label
    pub destination: Option<String>,
    /// Admission priority; higher wins at the flow controller
    pub priority: MessagePriority,
    /// Time to live; expiry is `timestamp + ttl`
    pub ttl: Option<Duration>,
    /// System messages bypass application-level filters
    pub is_system: bool,
    /// When set, admission never blocks: over-limit dispatches are rejected
    pub non_blocking: bool,
    /// Opaque application headers
    pub headers: Headers,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Aggregate identity, for events sourced from an aggregate
    pub aggregate_id: Option<String>,
    /// Aggregate version, for events sourced from an aggregate
    pub aggregate_version: Option<u64>,
    /// Caller-supplied cache key, for cacheable queries
    pub cache_key: Option<String>,
    /// Cache duration; zero or absent disables caching
    pub cache_duration: Option<Duration>,
}

impl Envelope {
    fn new(message_type: MessageType, category: MessageCategory, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::generate(),
            message_type,
            category,
            timestamp: SystemTime::now(),
            correlation_id: None,
            causation_id: None,
            source: None,
            destination: None,
            priority: MessagePriority::default(),
            ttl: None,
            is_system: false,
            non_blocking: false,
            headers: Headers::new(),
            payload,
            aggregate_id: None,
            aggregate_version: None,
            cache_key: None,
            cache_duration: None,
        }
    }

    /// Creates a command envelope
    ///
    /// # Errors
    ///
    /// Returns `BusError::Validation` if the type tag is empty or too long.
    pub fn command(type_tag: &str, payload: serde_json::Value) -> Result<Self, BusError> {
        Ok(Self::new(
            parse_type_tag(type_tag)?,
            MessageCategory::Command,
            payload,
        ))
    }

    /// Creates an event envelope
    ///
    /// # Errors
    ///
    /// Returns `BusError::Validation` if the type tag is empty or too long.
    pub fn event(type_tag: &str, payload: serde_json::Value) -> Result<Self, BusError> {
        Ok(Self::new(
            parse_type_tag(type_tag)?,
            MessageCategory::Event,
            payload,
        ))
    }

    /// Creates a query envelope
    ///
    /// # Errors
    ///
    /// Returns `BusError::Validation` if the type tag is empty or too long.
    pub fn query(type_tag: &str, payload: serde_json::Value) -> Result<Self, BusError> {
        Ok(Self::new(
            parse_type_tag(type_tag)?,
            MessageCategory::Query,
            payload,
        ))
    }

    /// Sets the admission priority
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the time to live
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the correlation identifier
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets source and destination labels
    #[must_use]
    pub fn with_route(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self.destination = Some(destination.into());
        self
    }

    /// Adds a header entry
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Marks the envelope as non-blocking at admission
    #[must_use]
    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    /// Marks the envelope as a system message with system priority
    #[must_use]
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self.priority = MessagePriority::system();
        self
    }

    /// Derives a follow-up envelope caused by this one.
    ///
    /// The child inherits the correlation id (creating one if this envelope
    /// has none) and records this envelope's id as its causation id.
    #[must_use]
    pub fn child(&self, mut envelope: Envelope) -> Envelope {
        envelope.correlation_id = Some(
            self.correlation_id
                .unwrap_or_else(CorrelationId::generate),
        );
        envelope.causation_id = Some(self.id);
        envelope
    }

    /// The instant at which this envelope expires, if it carries a TTL
    #[must_use]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.ttl.map(|ttl| self.timestamp + ttl)
    }

    /// Whether the TTL has elapsed.
    ///
    /// An expired envelope must never be dispatched to a handler.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at()
            .is_some_and(|deadline| SystemTime::now() >= deadline)
    }

    /// Validates envelope invariants prior to dispatch
    ///
    /// # Errors
    ///
    /// Returns `BusError::Validation` when an invariant is violated.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.timestamp > SystemTime::now() + Duration::from_secs(60) {
            return Err(BusError::Validation {
                reason: "timestamp is too far in the future".to_string(),
            });
        }
        if let Some(version) = self.aggregate_version
            && self.aggregate_id.is_none()
        {
            return Err(BusError::Validation {
                reason: format!("aggregate_version {version} without aggregate_id"),
            });
        }
        if self.cache_key.is_some() && self.category != MessageCategory::Query {
            return Err(BusError::Validation {
                reason: "cache_key is only valid on queries".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_type_tag(type_tag: &str) -> Result<MessageType, BusError> {
    MessageType::try_new(type_tag.to_string()).map_err(|e| BusError::Validation {
        reason: format!("invalid message type tag: {e}"),
    })
}

/// A typed command: resolved by exactly one handler, yields a typed response
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Response produced by the command handler
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Type tag for handler resolution
    const TYPE: &'static str;
}

/// A typed event: fanned out to all matching handlers, fire-and-forget
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag for handler resolution
    const TYPE: &'static str;

    /// Aggregate identity, for events sourced from an aggregate
    fn aggregate_id(&self) -> Option<String> {
        None
    }

    /// Aggregate version, for events sourced from an aggregate
    fn aggregate_version(&self) -> Option<u64> {
        None
    }
}

/// A typed query: resolved by exactly one handler, yields a typed result,
/// optionally cacheable
pub trait Query: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Result produced by the query handler
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Type tag for handler resolution
    const TYPE: &'static str;

    /// Cache key; `None` disables caching for this query instance
    fn cache_key(&self) -> Option<String> {
        None
    }

    /// How long a cached result stays fresh
    fn cache_duration(&self) -> Option<Duration> {
        None
    }
}

/// Converts a typed command into its envelope
///
/// # Errors
///
/// Returns `BusError` if the payload fails to serialize.
pub fn command_envelope<C: Command>(command: &C) -> Result<Envelope, BusError> {
    Envelope::command(C::TYPE, serde_json::to_value(command)?)
}

/// Converts a typed event into its envelope
///
/// # Errors
///
/// Returns `BusError` if the payload fails to serialize.
pub fn event_envelope<E: Event>(event: &E) -> Result<Envelope, BusError> {
    let mut envelope = Envelope::event(E::TYPE, serde_json::to_value(event)?)?;
    envelope.aggregate_id = event.aggregate_id();
    envelope.aggregate_version = event.aggregate_version();
    Ok(envelope)
}

/// Converts a typed query into its envelope
///
/// # Errors
///
/// Returns `BusError` if the payload fails to serialize.
pub fn query_envelope<Q: Query>(query: &Q) -> Result<Envelope, BusError> {
    let mut envelope = Envelope::query(Q::TYPE, serde_json::to_value(query)?)?;
    envelope.cache_key = query.cache_key();
    envelope.cache_duration = query.cache_duration();
    Ok(envelope)
}

/// On-wire representation of a message: serialized payload plus minimal
/// routing metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Serialized payload bytes
    pub payload: Vec<u8>,
    /// MIME-style content type of the payload
    pub content_type: String,
    /// Type tag of the enclosed message
    pub message_type: MessageType,
    /// Logical origin label
    pub source: Option<String>,
    /// Logical destination label
    pub destination: Option<String>,
    /// Admission priority carried across the wire
    pub priority: MessagePriority,
    /// Remaining time to live at send
    pub ttl: Option<Duration>,
    /// Opaque headers
    pub headers: Headers,
    /// Send timestamp
    pub timestamp: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_without_ttl_never_expires() {
        let envelope = Envelope::command("test.cmd", serde_json::json!({})).unwrap();
        assert!(!envelope.is_expired());
        assert_eq!(envelope.expires_at(), None);
    }

    #[test]
    fn envelope_past_ttl_is_expired() {
        let mut envelope = Envelope::command("test.cmd", serde_json::json!({})).unwrap();
        envelope.timestamp = SystemTime::now() - Duration::from_secs(10);
        envelope.ttl = Some(Duration::from_secs(5));
        assert!(envelope.is_expired());
    }

    #[test]
    fn envelope_within_ttl_is_not_expired() {
        let envelope = Envelope::command("test.cmd", serde_json::json!({}))
            .unwrap()
            .with_ttl(Duration::from_secs(60));
        assert!(!envelope.is_expired());
    }

    #[test]
    fn empty_type_tag_is_rejected() {
        assert!(Envelope::command("", serde_json::json!({})).is_err());
    }

    #[test]
    fn child_inherits_correlation_and_records_causation() {
        let parent = Envelope::command("parent.cmd", serde_json::json!({}))
            .unwrap()
            .with_correlation(CorrelationId::generate());
        let child = parent.child(Envelope::event("child.evt", serde_json::json!({})).unwrap());

        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.causation_id, Some(parent.id));
    }

    #[test]
    fn child_of_uncorrelated_parent_gets_fresh_correlation() {
        let parent = Envelope::command("parent.cmd", serde_json::json!({})).unwrap();
        let child = parent.child(Envelope::event("child.evt", serde_json::json!({})).unwrap());
        assert!(child.correlation_id.is_some());
    }

    #[test]
    fn cache_key_on_command_fails_validation() {
        let mut envelope = Envelope::command("test.cmd", serde_json::json!({})).unwrap();
        envelope.cache_key = Some("k".to_string());
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn aggregate_version_requires_aggregate_id() {
        let mut envelope = Envelope::event("test.evt", serde_json::json!({})).unwrap();
        envelope.aggregate_version = Some(3);
        assert!(envelope.validate().is_err());
        envelope.aggregate_id = Some("order-1".to_string());
        assert!(envelope.validate().is_ok());
    }
}
