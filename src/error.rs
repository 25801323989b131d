//! Error taxonomy for the Switchyard runtime
//!
//! Every subsystem surfaces errors from this module to its direct caller.
//! Behaviors downstream of a handler may inspect and transform these errors,
//! but must not silently swallow them unless they reach a terminal outcome.

use crate::domain_types::{MessageId, MessageType};
use crate::message::MessageCategory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an envelope was moved to the dead-letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// TTL elapsed before dispatch
    Expired,
    /// The handler raised and retries were exhausted
    HandlerError,
    /// Handler or transport operation exceeded its deadline
    Timeout,
    /// Envelope failed invariant validation
    Validation,
    /// Transport I/O failed while the envelope was in flight
    WireError,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Expired => "expired",
            Self::HandlerError => "handler_error",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::WireError => "wire_error",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by message bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no handler registered for {category} message type: {message_type}")]
    NoHandler {
        message_type: MessageType,
        category: MessageCategory,
    },

    #[error("message {message_id} expired before dispatch (type: {message_type})")]
    Expired {
        message_id: MessageId,
        message_type: MessageType,
    },

    #[error("admission rejected: {reason}")]
    Rejected { reason: String },

    #[error("handler '{handler}' failed after {attempts} attempt(s): {source}")]
    Handler {
        handler: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("operation cancelled by caller")]
    Cancelled,

    #[error("envelope validation failed: {reason}")]
    Validation { reason: String },

    #[error("serialization failed: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },
}

impl BusError {
    /// Whether the retry behavior may re-attempt after this error.
    ///
    /// Timeouts are retryable unless the handler registration marks them
    /// non-retryable; handler errors follow the configured retry policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Handler { .. } | Self::Timeout { .. } | Self::Transport { .. }
        )
    }

    /// The dead-letter reason for this error, if the error dead-letters at all.
    ///
    /// `Rejected` and `Cancelled` never dead-letter: the caller may simply
    /// retry the whole operation.
    #[must_use]
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Expired { .. } => Some(FailureReason::Expired),
            Self::Handler { .. } => Some(FailureReason::HandlerError),
            Self::Timeout { .. } => Some(FailureReason::Timeout),
            Self::Validation { .. } => Some(FailureReason::Validation),
            Self::Transport { .. } => Some(FailureReason::WireError),
            _ => None,
        }
    }
}

/// One handler's failure inside an event publish
#[derive(Debug)]
pub struct HandlerFailure {
    /// Name of the failed handler registration
    pub handler: String,
    /// The error the handler pipeline surfaced
    pub error: BusError,
}

/// Composite error carrying the per-handler breakdown of a partially
/// failed event publish
#[derive(Debug, Error)]
#[error("{} of {} event handler(s) failed", .failures.len(), .handler_count)]
pub struct PublishFailure {
    /// Total number of handlers the event was dispatched to
    pub handler_count: usize,
    /// Failures, one per handler that did not reach a terminal success
    pub failures: Vec<HandlerFailure>,
}

/// Errors surfaced by transport adapters
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport rejected the send: {reason}")]
    Rejected { reason: String },

    #[error("wire I/O failed: {source}")]
    Wire {
        #[from]
        source: std::io::Error,
    },

    #[error("transport operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("framing violation: {reason}")]
    InvalidFrame { reason: String },

    #[error("peer closed the connection mid-frame")]
    PeerClosed,

    #[error("no activity within the heartbeat timeout")]
    HeartbeatTimeout,

    #[error("invalid transport state for this operation: {state}")]
    InvalidState { state: String },

    #[error("payload serialization failed: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("connection pool error: {source}")]
    Pool {
        #[from]
        source: PoolError,
    },
}

/// Errors surfaced by the connection pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no connection available within {waited_ms}ms")]
    AcquireTimeout { waited_ms: u64 },

    #[error("pool is closed")]
    Closed,

    #[error("acquire cancelled by caller")]
    Cancelled,

    #[error("failed to establish connection: {source}")]
    Establish {
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced by the component lifecycle machinery.
///
/// Illegal transitions are programming errors: fatal for the component and
/// bubbled to the registry.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("illegal lifecycle transition for '{component}': {from} -> {to}")]
    InvalidTransition {
        component: String,
        from: String,
        to: String,
    },

    #[error("component '{component}' failed during {phase}: {source}")]
    ComponentFailed {
        component: String,
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("component '{component}' failed because dependency '{dependency}' failed")]
    UpstreamFailed {
        component: String,
        dependency: String,
    },

    #[error("unknown component: {component}")]
    UnknownComponent { component: String },

    #[error("unknown dependency '{dependency}' declared by '{component}'")]
    UnknownDependency {
        component: String,
        dependency: String,
    },

    #[error("component already registered: {component}")]
    AlreadyRegistered { component: String },

    #[error("configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },
}

/// Configuration validation errors; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("behavior placement cycle involving: {ids:?}")]
    PlacementCycle { ids: Vec<String> },

    #[error("behavior placement conflict for '{id}': {reason}")]
    PlacementConflict { id: String, reason: String },

    #[error("component dependency cycle: {path:?}")]
    DependencyCycle { path: Vec<String> },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_and_cancelled_never_dead_letter() {
        let rejected = BusError::Rejected {
            reason: "over limit".to_string(),
        };
        assert_eq!(rejected.failure_reason(), None);
        assert_eq!(BusError::Cancelled.failure_reason(), None);
    }

    #[test]
    fn expired_dead_letters_with_expired_reason() {
        let err = BusError::Expired {
            message_id: MessageId::generate(),
            message_type: MessageType::try_new("x".to_string()).unwrap(),
        };
        assert_eq!(err.failure_reason(), Some(FailureReason::Expired));
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeouts_are_retryable() {
        assert!(BusError::Timeout { elapsed_ms: 10 }.is_retryable());
        assert!(!BusError::Cancelled.is_retryable());
    }
}
