//! Captain's Log Core - Streaming app logs to a viewer on the LAN
//!
//! An application (the *producer*) finds log viewers advertised on the local
//! network, opens a pinned TLS connection to each one and streams its log
//! items in order. When a link drops the producer reconnects and resumes from
//! the last item that viewer received.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐              ┌──────────────────────────────┐
//! │ Producer (CaptainsLog)       │              │ Viewer (CaptainsLogServer)   │
//! │                              │   browse     │                              │
//! │  Supervisor ─────────────────┼─────────────►│  Advertisement               │
//! │   │  history                 │              │   │                          │
//! │   │  connect + backoff       │  mode byte   │   │  accept loop             │
//! │   ▼                          │  TLS (pinned)│   ▼                          │
//! │  LogSender ──────────────────┼─────────────►│  LogReceiver ── CursorStore  │
//! │   single in-flight flush     │  frames      │   deliver, then record       │
//! └──────────────────────────────┘              └──────────────────────────────┘
//! ```
//!
//! # Connection Sequence
//!
//! 1. Producer writes one mode byte (`0` TLS, `1` plaintext)
//! 2. TLS handshake; the producer pins the seed root certificate
//! 3. Viewer sends [`LogViewer`], producer sends [`ApplicationRun`]
//! 4. Viewer sends [`LastItemId`] for that run
//! 5. Producer replays history after the cursor, then streams new items
//!
//! Every message is a frame: an 8-byte big-endian length, then JSON.
//!
//! # Module Overview
//!
//! - [`models`]: wire types (runs, viewers, log items, cursors)
//! - [`transport`]: framing, stream abstraction and link configuration
//! - [`discovery`]: advertising and browsing (mDNS or in-process)
//! - [`security`]: mode negotiation and pinned-root TLS
//! - [`handshake`]: the three-message exchange after security
//! - [`connection`]: discovery + security + handshake for one link
//! - [`sender`]: producer-side queue with a single in-flight flush
//! - [`receiver`]: viewer-side read loop and resumption cursors
//! - [`producer`]: the producer supervisor ([`CaptainsLog`])
//! - [`server`]: the viewer endpoint ([`CaptainsLogServer`])
//! - [`retry`]: exponential backoff
//! - [`config`]: TOML + environment configuration

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod discovery;
pub mod handshake;
pub mod models;
pub mod producer;
pub mod receiver;
pub mod retry;
pub mod security;
pub mod sender;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use config::{load_config, CaptainsLogConfig, ConfigError, ConfigOverrides, ConfigSource};
pub use connection::{ConnectError, ErrorKind};
pub use discovery::{
    DiscoveredService, DiscoveryError, MdnsDirectory, MemoryDirectory, ServiceDirectory,
};
pub use handshake::HandshakeError;
pub use models::{
    Application, ApplicationRun, CapturedRequest, CapturedResponse, Device, HttpMethod,
    LastItemId, LogItem, LogItemKind, LogLevel, LogMessage, LogViewer, OperatingSystem,
};
pub use producer::{CaptainsLog, ProducerConfig, ProducerEvent};
pub use receiver::{CursorStore, LogReceiver};
pub use retry::RetryBehavior;
pub use security::{
    ClientSecurity, Identity, IdentityPresentingSecurity, IdentityProvider, PinnedServerSecurity,
    PlaintextSecurity, ProtocolMode, SecurityError, SeedCertificate, ServerSecurity,
    StaticIdentityProvider,
};
pub use sender::{Disconnected, LogSender, SenderOptions};
pub use server::{CaptainsLogServer, ServerConfig, ServerEvent};
pub use transport::{ConnectionId, DiscoveryBackend, TransportConfig, TransportError};
