//! Connection Establishment
//!
//! Turns a raw stream from discovery into an authenticated, handshaken
//! link. Each role has one entry point:
//!
//! - [`connect_to_viewer`]: producer side. Connect, pin-verify, handshake.
//! - [`accept_logger`]: viewer side. Present identity, handshake.
//!
//! Failures are classified by [`ConnectError::kind`] so the supervisor can
//! decide whether retrying is worthwhile.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::discovery::{AcceptedStream, DiscoveredService, DiscoveryError, ServiceDirectory};
use crate::handshake::{producer_handshake, viewer_handshake, with_timeout, HandshakeError};
use crate::models::{ApplicationRun, LastItemId, LogViewer};
use crate::security::{ClientSecurity, ProtocolMode, SecurityError, ServerSecurity};
use crate::transport::{BoxedStream, ConnectionId, FramedStream, TransportError};

// =============================================================================
// Errors
// =============================================================================

/// Broad category of a connection failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Discovery,
    Transport,
    Security,
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery => write!(f, "discovery"),
            Self::Transport => write!(f, "transport"),
            Self::Security => write!(f, "security"),
            Self::Protocol => write!(f, "protocol"),
        }
    }
}

/// Why a connection attempt failed
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Protocol(#[from] HandshakeError),
}

impl ConnectError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Discovery(_) => ErrorKind::Discovery,
            Self::Transport(_) | Self::Protocol(HandshakeError::Transport(_)) => {
                ErrorKind::Transport
            }
            Self::Security(_) => ErrorKind::Security,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether another attempt with unchanged configuration could succeed
    ///
    /// Trust and identity failures recur deterministically and are surfaced
    /// instead of retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Security(e) => e.is_transient(),
            _ => true,
        }
    }
}

// =============================================================================
// Producer Side
// =============================================================================

/// An authenticated link from a producer to a viewer
pub struct ViewerConnection {
    pub id: ConnectionId,
    pub service: DiscoveredService,
    pub viewer: LogViewer,
    /// Where the viewer wants the replay to start
    pub last_item_id: LastItemId,
    pub stream: FramedStream<BoxedStream>,
}

impl fmt::Debug for ViewerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerConnection")
            .field("id", &self.id)
            .field("service", &self.service.fullname)
            .field("viewer", &self.viewer)
            .field("last_item_id", &self.last_item_id)
            .finish_non_exhaustive()
    }
}

/// Connect to a discovered viewer, verify it and run the producer handshake
pub async fn connect_to_viewer(
    directory: &dyn ServiceDirectory,
    security: &dyn ClientSecurity,
    service: &DiscoveredService,
    run: &ApplicationRun,
    handshake_timeout: Option<Duration>,
) -> Result<ViewerConnection, ConnectError> {
    let id = ConnectionId::new();
    tracing::debug!(conn_id = %id, service = %service.fullname, "Connecting to viewer");

    let raw = directory.connect(service).await?;
    let secured = security.secure(raw).await?;

    let mut stream = FramedStream::new(secured);
    let outcome = with_timeout(handshake_timeout, producer_handshake(&mut stream, run)).await?;

    tracing::info!(
        conn_id = %id,
        service = %service.fullname,
        viewer = %outcome.viewer.name,
        cursor = %outcome.last_item_id,
        "Connected to viewer"
    );

    Ok(ViewerConnection {
        id,
        service: service.clone(),
        viewer: outcome.viewer,
        last_item_id: outcome.last_item_id,
        stream,
    })
}

// =============================================================================
// Viewer Side
// =============================================================================

/// An authenticated link from a viewer to a producer
pub struct LoggerConnection {
    pub id: ConnectionId,
    pub run: ApplicationRun,
    pub peer: Option<SocketAddr>,
    pub mode: ProtocolMode,
    pub stream: FramedStream<BoxedStream>,
}

impl fmt::Debug for LoggerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerConnection")
            .field("id", &self.id)
            .field("run", &self.run.id)
            .field("peer", &self.peer)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Secure an inbound stream and run the viewer handshake
///
/// `cursor_for` supplies the resumption cursor once the producer's run id is
/// known.
pub async fn accept_logger<F>(
    accepted: AcceptedStream,
    security: &dyn ServerSecurity,
    viewer: &LogViewer,
    cursor_for: F,
    handshake_timeout: Option<Duration>,
) -> Result<LoggerConnection, ConnectError>
where
    F: FnOnce(&ApplicationRun) -> LastItemId,
{
    let id = ConnectionId::new();
    let peer = accepted.peer;

    let secured = security.accept(accepted.stream).await?;
    let mut stream = FramedStream::new(secured.stream);
    let run = with_timeout(
        handshake_timeout,
        viewer_handshake(&mut stream, viewer, cursor_for),
    )
    .await?;

    if let Some(requested) = secured.server_name.as_deref() {
        if requested != run.seed_identifier {
            tracing::warn!(
                conn_id = %id,
                requested,
                announced = %run.seed_identifier,
                "Producer announced a different seed identifier than it requested"
            );
        }
    }

    tracing::info!(
        conn_id = %id,
        producer = %run.id,
        application = %run.application.name,
        device = %run.device.name,
        mode = %secured.mode,
        "Producer connected"
    );

    Ok(LoggerConnection {
        id,
        run,
        peer,
        mode: secured.mode,
        stream,
    })
}
