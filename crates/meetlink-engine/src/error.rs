//! Error types for the engine layer.

use std::fmt;

use meetlink_common::protocol::ProtocolError;
use meetlink_transport::channel::CapacityExceeded;
use meetlink_transport::reconnect::{classify, Retriability};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Establishing the connection or a channel failed.
    Connect,
    /// The connection or channel closed.
    Closed,
    Io,
    /// The peer violated the framing or handshake.
    Protocol,
    /// A channel's outbound queue is full.
    CapacityExceeded,
    /// No connection is open.
    NotConnected,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Connect => "connect failed",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::Io => "i/o error",
            TransportErrorKind::Protocol => "protocol error",
            TransportErrorKind::CapacityExceeded => "capacity exceeded",
            TransportErrorKind::NotConnected => "not connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn not_connected() -> Self {
        Self::new(TransportErrorKind::NotConnected, "no open connection")
    }

    /// Whether a reconnect could help.
    pub fn is_retriable(&self) -> bool {
        match self.kind {
            TransportErrorKind::Protocol => false,
            _ => classify(self.message_opt()) == Retriability::Retriable,
        }
    }

    /// The message, or `None` when empty (a graceful close).
    pub fn message_opt(&self) -> Option<&str> {
        if self.message.is_empty() {
            None
        } else {
            Some(&self.message)
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => TransportErrorKind::Closed,
            _ => TransportErrorKind::Io,
        };
        TransportError::new(kind, e.to_string())
    }
}

impl From<CapacityExceeded> for TransportError {
    fn from(e: CapacityExceeded) -> Self {
        TransportError::new(TransportErrorKind::CapacityExceeded, e.to_string())
    }
}

/// Failures of the media collaborators, reported as status events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Errors returned by publisher and subscriber operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("control message: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    State(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriability_follows_message() {
        assert!(TransportError::closed("").is_retriable());
        assert!(TransportError::connect("connection refused").is_retriable());
        assert!(!TransportError::connect("HTTP 401 Unauthorized").is_retriable());
        assert!(!TransportError::protocol("bad hello").is_retriable());
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let e: TransportError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert_eq!(e.kind, TransportErrorKind::Closed);
        let e: TransportError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(e.kind, TransportErrorKind::Io);
    }

    #[test]
    fn capacity_error_converts() {
        let e: TransportError = CapacityExceeded { queued: 10, limit: 8 }.into();
        assert_eq!(e.kind, TransportErrorKind::CapacityExceeded);
        assert!(e.to_string().starts_with("capacity exceeded"));
    }
}
