//! Frame delimiting for byte-stream transports
//!
//! Four protocols delimit message boundaries: big-endian length prefixing
//! (binary-safe, recommended), newline, CRLF, or a custom delimiter. A frame
//! declaring a length above the configured maximum is a framing violation
//! and closes the connection; EOF mid-frame is a peer-closed error.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const LENGTH_PREFIX: usize = 4;

/// How frames are delimited on the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramingProtocol {
    /// `BE u32 length` then payload; binary-safe
    LengthPrefixed,
    /// Payload then LF; payload must not contain LF
    NewlineDelimited,
    /// Payload then CR LF; payload must not contain CR LF
    CrlfDelimited,
    /// Payload then a custom delimiter; payload must not contain it
    CustomDelimiter(Vec<u8>),
}

impl FramingProtocol {
    fn delimiter(&self) -> Option<&[u8]> {
        match self {
            Self::LengthPrefixed => None,
            Self::NewlineDelimited => Some(b"\n"),
            Self::CrlfDelimited => Some(b"\r\n"),
            Self::CustomDelimiter(delim) => Some(delim),
        }
    }
}

/// Encodes one frame for the wire
///
/// # Errors
///
/// `InvalidFrame` when the payload exceeds `max_frame` or contains the
/// protocol's delimiter.
pub fn encode_frame(
    payload: &[u8],
    protocol: &FramingProtocol,
    max_frame: usize,
) -> Result<Bytes, TransportError> {
    if payload.len() > max_frame {
        return Err(TransportError::InvalidFrame {
            reason: format!("payload of {} bytes exceeds limit {max_frame}", payload.len()),
        });
    }
    match protocol.delimiter() {
        None => {
            let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
            frame.put_u32(payload.len() as u32);
            frame.put_slice(payload);
            Ok(frame.freeze())
        }
        Some(delim) => {
            if find_subsequence(payload, delim).is_some() {
                return Err(TransportError::InvalidFrame {
                    reason: "payload contains the frame delimiter".to_string(),
                });
            }
            let mut frame = BytesMut::with_capacity(payload.len() + delim.len());
            frame.put_slice(payload);
            frame.put_slice(delim);
            Ok(frame.freeze())
        }
    }
}

/// Incremental frame decoder over received bytes
#[derive(Debug)]
pub struct FrameDecoder {
    protocol: FramingProtocol,
    max_frame: usize,
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a decoder for one connection
    #[must_use]
    pub fn new(protocol: FramingProtocol, max_frame: usize) -> Self {
        Self {
            protocol,
            max_frame,
            buffer: BytesMut::new(),
        }
    }

    /// Appends received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently buffered without a complete frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame, if any.
    ///
    /// Empty frames are valid; the transport uses them as heartbeats.
    ///
    /// # Errors
    ///
    /// `InvalidFrame` when a declared length exceeds the maximum or a
    /// delimited payload grows past it; the connection must be closed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.protocol.delimiter() {
            None => self.next_length_prefixed(),
            Some(delim) => {
                let delim = delim.to_vec();
                self.next_delimited(&delim)
            }
        }
    }

    fn next_length_prefixed(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if declared > self.max_frame {
            return Err(TransportError::InvalidFrame {
                reason: format!("declared length {declared} exceeds limit {}", self.max_frame),
            });
        }
        if self.buffer.len() < LENGTH_PREFIX + declared {
            return Ok(None);
        }
        self.buffer.advance(LENGTH_PREFIX);
        Ok(Some(self.buffer.split_to(declared).freeze()))
    }

    fn next_delimited(&mut self, delim: &[u8]) -> Result<Option<Bytes>, TransportError> {
        match find_subsequence(&self.buffer, delim) {
            Some(index) => {
                if index > self.max_frame {
                    return Err(TransportError::InvalidFrame {
                        reason: format!("frame of {index} bytes exceeds limit {}", self.max_frame),
                    });
                }
                let frame = self.buffer.split_to(index).freeze();
                self.buffer.advance(delim.len());
                Ok(Some(frame))
            }
            None => {
                if self.buffer.len() > self.max_frame + delim.len() {
                    return Err(TransportError::InvalidFrame {
                        reason: format!(
                            "unterminated frame exceeds limit {}",
                            self.max_frame
                        ),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Checks for a clean end of stream
    ///
    /// # Errors
    ///
    /// `PeerClosed` when bytes of an incomplete frame remain buffered.
    pub fn finish(&self) -> Result<(), TransportError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(TransportError::PeerClosed)
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
