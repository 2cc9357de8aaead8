//! Status codes and error types for the CBPP codec layer.
//!
//! A [`ProtocolViolation`] is what the decoder raises when the byte stream
//! breaks the framing rules; it carries the [`StatusCode`] that the session
//! reports back to the peer before shutting the connection down.

use std::io;

use thiserror::Error;

/// Numeric status carried by CBPP error replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    /// No error.
    Ok = 0,
    /// Unexpected failure inside a request handler.
    InternalError = -1,
    /// The peer closed the stream mid-message.
    EndOfStream = -2,
    /// No handler registered for the message id.
    NotFound = -3,
    /// Payload larger than the configured acceptance bound.
    RequestTooLarge = -4,
    /// Structurally malformed message.
    BadMessage = -5,
    /// Length field inconsistent or out of range.
    LengthOverflow = -6,
}

impl StatusCode {
    /// The value transmitted in the error reply's varint parameter.
    #[must_use]
    pub const fn as_i64(self) -> i64 { self as i32 as i64 }

    /// Map a received varint parameter back to a known status, if any.
    #[must_use]
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            -1 => Some(Self::InternalError),
            -2 => Some(Self::EndOfStream),
            -3 => Some(Self::NotFound),
            -4 => Some(Self::RequestTooLarge),
            -5 => Some(Self::BadMessage),
            -6 => Some(Self::LengthOverflow),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InternalError => "internal error",
            Self::EndOfStream => "end of stream",
            Self::NotFound => "not found",
            Self::RequestTooLarge => "request too large",
            Self::BadMessage => "bad message",
            Self::LengthOverflow => "length overflow",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), *self as i32)
    }
}

/// A structural violation of the CBPP framing rules.
///
/// Raised synchronously by the decoder; the session layer converts it into
/// a peer-visible error reply plus bidirectional shutdown.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{status}: {reason}")]
pub struct ProtocolViolation {
    /// Status reported to the peer.
    pub status: StatusCode,
    /// Human-readable reason.
    pub reason: String,
}

impl ProtocolViolation {
    /// Construct a violation with the given status and reason.
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// Top-level codec error taxonomy.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The byte stream violated the framing rules.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Transport-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            CodecError::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}
