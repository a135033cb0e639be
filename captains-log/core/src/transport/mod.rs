//! Transport Layer
//!
//! Moves typed messages over raw byte streams:
//! - `traits`: the type-erased stream, connection ids and `TransportError`
//! - `frame`: the length-prefixed JSON wire format and framed readers/writers
//! - `config`: discovery backend selection and link timing
//!
//! Streams come from a [`crate::discovery::ServiceDirectory`] and are
//! secured by [`crate::security`] before any frame is exchanged.

pub mod config;
pub mod frame;
pub mod traits;

// Re-exports for convenience
pub use config::{DiscoveryBackend, TransportConfig};
pub use frame::{encode, FrameDecoder, FrameReader, FrameWriter, FramedStream, MAX_FRAME_SIZE};
pub use traits::{AsyncStream, BoxedStream, ConnectionId, TransportError};
