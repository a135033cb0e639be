//! Handshake Protocol
//!
//! Runs over the secured, framed stream before any log item moves:
//!
//! ```text
//! Viewer                                 Producer
//!   | ---- LogViewer ----------------------> |
//!   | <--- ApplicationRun ------------------ |
//!   | ---- LastItemId (cursor for run.id) -> |
//! ```
//!
//! Each step waits until the peer is ready. No per-step timeout applies
//! unless the caller sets one; a closed stream or malformed frame aborts the
//! attempt.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::models::{ApplicationRun, LastItemId, LogViewer};
use crate::transport::{FramedStream, TransportError};

/// Why a handshake did not complete
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The stream failed or closed mid-exchange
    #[error("Handshake interrupted: {0}")]
    Transport(TransportError),

    /// The peer sent a frame that is not the expected message
    #[error("Malformed handshake message while waiting for {expected}: {reason}")]
    Malformed {
        /// Message that was expected
        expected: &'static str,
        /// Decoder error
        reason: String,
    },

    /// The configured handshake timeout elapsed
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
}

impl HandshakeError {
    fn from_transport(expected: &'static str, err: TransportError) -> Self {
        if err.is_malformed() {
            Self::Malformed {
                expected,
                reason: err.to_string(),
            }
        } else {
            Self::Transport(err)
        }
    }
}

/// What the producer learns from the viewer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerHandshake {
    pub viewer: LogViewer,
    pub last_item_id: LastItemId,
}

/// Viewer role: announce, learn the run, reply with its cursor
///
/// `cursor_for` is consulted after the run is known, so the cursor always
/// reflects the latest state for that run id.
pub async fn viewer_handshake<S, F>(
    stream: &mut FramedStream<S>,
    viewer: &LogViewer,
    cursor_for: F,
) -> Result<ApplicationRun, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&ApplicationRun) -> LastItemId,
{
    stream
        .send(viewer)
        .await
        .map_err(|e| HandshakeError::from_transport("LogViewer", e))?;

    let run: ApplicationRun = stream
        .recv()
        .await
        .map_err(|e| HandshakeError::from_transport("ApplicationRun", e))?;

    let cursor = cursor_for(&run);
    tracing::debug!(producer = %run.id, cursor = %cursor, "Sending resumption cursor");
    stream
        .send(&cursor)
        .await
        .map_err(|e| HandshakeError::from_transport("LastItemId", e))?;

    Ok(run)
}

/// Producer role: learn the viewer, announce the run, receive the cursor
pub async fn producer_handshake<S>(
    stream: &mut FramedStream<S>,
    run: &ApplicationRun,
) -> Result<ProducerHandshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let viewer: LogViewer = stream
        .recv()
        .await
        .map_err(|e| HandshakeError::from_transport("LogViewer", e))?;

    stream
        .send(run)
        .await
        .map_err(|e| HandshakeError::from_transport("ApplicationRun", e))?;

    let last_item_id: LastItemId = stream
        .recv()
        .await
        .map_err(|e| HandshakeError::from_transport("LastItemId", e))?;

    tracing::debug!(viewer = %viewer.name, cursor = %last_item_id, "Handshake complete");
    Ok(ProducerHandshake {
        viewer,
        last_item_id,
    })
}

/// Bound a handshake future when a timeout is configured
pub async fn with_timeout<T, Fut>(limit: Option<Duration>, fut: Fut) -> Result<T, HandshakeError>
where
    Fut: Future<Output = Result<T, HandshakeError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HandshakeError::Timeout(limit))?,
        None => fut.await,
    }
}
