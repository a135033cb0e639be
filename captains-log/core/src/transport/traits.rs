//! Transport Types
//!
//! Stream abstraction and error type shared by every layer that moves bytes:
//! discovery hands out [`BoxedStream`]s, the security layer wraps them, and
//! the framing layer reads and writes messages over them.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

/// Unique identifier for one established connection
///
/// A peer link gets a new id every time it reconnects, so stale signals from
/// a superseded connection can be told apart from the live one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a new unique connection ID using cryptographically random 128-bit value
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(format!("conn_{}", hex::encode(bytes)))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw bidirectional byte stream
///
/// Implemented for anything that is readable, writable and sendable:
/// TCP sockets, TLS streams, in-memory duplex pipes.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream passed between discovery, security and framing
pub type BoxedStream = Box<dyn AsyncStream>;

/// Errors that can occur while moving bytes
#[derive(Debug)]
pub enum TransportError {
    /// Connection to peer failed
    ConnectionFailed(String),
    /// Connection was closed by the peer
    ConnectionClosed,
    /// Message serialization/deserialization error
    SerializationError(String),
    /// A frame header announced more than the allowed payload size
    FrameTooLarge {
        /// Announced size
        size: u64,
        /// Configured maximum
        max: usize,
    },
    /// An operation did not complete in time
    Timeout(String),
    /// IO error from underlying stream
    IoError(std::io::Error),
    /// Transport not in expected state
    InvalidState(String),
}

impl TransportError {
    /// Whether the payload itself was at fault rather than the stream
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::SerializationError(_) | Self::FrameTooLarge { .. }
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {size} bytes (max: {max})")
            }
            Self::Timeout(msg) => write!(f, "Timed out: {msg}"),
            Self::IoError(e) => write!(f, "IO error: {e}"),
            Self::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => Self::IoError(err),
        }
    }
}
