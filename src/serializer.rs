//! Byte-oriented serialization boundary between envelopes and the wire
//!
//! The core depends only on the [`MessageSerializer`] trait; concrete formats
//! are pluggable. A JSON implementation ships as the default.

use crate::error::TransportError;
use crate::message::{Envelope, TransportMessage};
use std::time::SystemTime;

/// Converts envelopes to transport messages and transport messages back to
/// envelopes, via an opaque byte payload.
///
/// The framing layer is serializer-agnostic: it only ever sees the encoded
/// transport-message bytes.
pub trait MessageSerializer: Send + Sync {
    /// Content type tag written into outgoing transport messages
    fn content_type(&self) -> &str;

    /// Encodes an envelope into a transport message
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Serialization` if the payload cannot be encoded.
    fn to_transport(&self, envelope: &Envelope) -> Result<TransportMessage, TransportError>;

    /// Decodes a transport message back into an envelope
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Serialization` if the payload cannot be decoded.
    fn from_transport(&self, message: &TransportMessage) -> Result<Envelope, TransportError>;

    /// Encodes a transport message into wire bytes
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Serialization` on encoding failure.
    fn encode(&self, message: &TransportMessage) -> Result<Vec<u8>, TransportError>;

    /// Decodes wire bytes into a transport message
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Serialization` on decoding failure.
    fn decode(&self, bytes: &[u8]) -> Result<TransportMessage, TransportError>;
}

/// JSON serializer used by default across transports
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Creates a new JSON serializer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn to_transport(&self, envelope: &Envelope) -> Result<TransportMessage, TransportError> {
        let payload = serde_json::to_vec(envelope)?;
        Ok(TransportMessage {
            payload,
            content_type: self.content_type().to_string(),
            message_type: envelope.message_type.clone(),
            source: envelope.source.clone(),
            destination: envelope.destination.clone(),
            priority: envelope.priority,
            ttl: envelope.ttl,
            headers: envelope.headers.clone(),
            timestamp: SystemTime::now(),
        })
    }

    fn from_transport(&self, message: &TransportMessage) -> Result<Envelope, TransportError> {
        let envelope: Envelope = serde_json::from_slice(&message.payload)?;
        Ok(envelope)
    }

    fn encode(&self, message: &TransportMessage) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<TransportMessage, TransportError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
