//! Viewer Server
//!
//! [`CaptainsLogServer`] advertises the viewer, accepts producers, runs the
//! viewer handshake with each and keeps one [`LogReceiver`] per producer run.
//!
//! # Connection Handling
//!
//! ```text
//! advertisement ─► accept loop ─► handshake task ─► receiver task
//!                                  (per stream)      (per run id)
//! ```
//!
//! A producer that reconnects under the same run id supersedes its previous
//! receiver. Items and lifecycle changes are reported as [`ServerEvent`]s.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::Instrument;

use crate::connection::{accept_logger, LoggerConnection};
use crate::discovery::{
    AcceptedStream, Advertisement, DiscoveryError, LoggerTxt, ServiceDirectory, ServiceRecord,
    DEFAULT_DOMAIN, DEFAULT_PORT, DEFAULT_SERVICE_TYPE,
};
use crate::models::{ApplicationRun, LastItemId, LogItem, LogViewer};
use crate::receiver::{CursorStore, LogReceiver};
use crate::security::ServerSecurity;
use crate::transport::{ConnectionId, TransportConfig};

/// Viewer server settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Advertised instance name, also the viewer's display name
    pub name: String,
    pub service_type: String,
    pub domain: String,
    /// Listening port (0 = pick a free port)
    pub port: u16,
    /// Seed identifier published in the TXT record
    pub identifier: String,
    pub handshake_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            port: DEFAULT_PORT,
            identifier: identifier.into(),
            handshake_timeout: None,
        }
    }

    pub fn from_transport(
        name: impl Into<String>,
        identifier: impl Into<String>,
        transport: &TransportConfig,
    ) -> Self {
        Self {
            service_type: transport.service_type.clone(),
            domain: transport.domain.clone(),
            port: transport.port,
            handshake_timeout: transport.handshake_timeout(),
            ..Self::new(name, identifier)
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn record(&self) -> ServiceRecord {
        ServiceRecord::new(&self.name, LoggerTxt::new(&self.identifier))
            .with_type(&self.service_type, &self.domain)
            .with_port(self.port)
    }
}

/// What the viewer observes
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    /// A producer completed the handshake
    ConnectionEstablished {
        connection: ConnectionId,
        run: ApplicationRun,
    },

    /// An item arrived; the producer's cursor now points at it
    ItemReceived { producer_id: String, item: LogItem },

    /// A producer's receiver stopped
    ConnectionLost {
        producer_id: String,
        connection: ConnectionId,
        reason: String,
    },

    /// An inbound stream failed security or handshake
    ConnectionFailed {
        peer: Option<SocketAddr>,
        error: String,
    },
}

struct ActiveReceiver {
    connection: ConnectionId,
    run: ApplicationRun,
    task: AbortHandle,
}

struct Shared {
    viewer: LogViewer,
    cursors: CursorStore,
    receivers: DashMap<String, ActiveReceiver>,
    events: mpsc::UnboundedSender<ServerEvent>,
    handshake_timeout: Option<Duration>,
    closed: AtomicBool,
}

/// Viewer-side server
///
/// Dropping it stops advertising and aborts every receiver.
pub struct CaptainsLogServer {
    shared: Arc<Shared>,
    fullname: String,
    port: u16,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptainsLogServer {
    /// Advertise and start accepting producers
    pub async fn start(
        directory: &dyn ServiceDirectory,
        security: Arc<dyn ServerSecurity>,
        config: ServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), DiscoveryError> {
        Self::start_with_cursors(directory, security, config, CursorStore::new()).await
    }

    /// Like [`CaptainsLogServer::start`], resuming from existing cursors
    pub async fn start_with_cursors(
        directory: &dyn ServiceDirectory,
        security: Arc<dyn ServerSecurity>,
        config: ServerConfig,
        cursors: CursorStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), DiscoveryError> {
        let advertisement = directory.advertise(config.record()).await?;
        let fullname = advertisement.fullname().to_string();
        let port = advertisement.port();
        let (events, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            viewer: LogViewer::new(&config.name),
            cursors,
            receivers: DashMap::new(),
            events,
            handshake_timeout: config.handshake_timeout,
            closed: AtomicBool::new(false),
        });

        let accept_task = tokio::spawn(accept_loop(Arc::clone(&shared), advertisement, security));

        tracing::info!(
            service = %fullname,
            port,
            identifier = %config.identifier,
            "Viewer advertised"
        );

        Ok((
            Self {
                shared,
                fullname,
                port,
                accept_task: Mutex::new(Some(accept_task)),
            },
            event_rx,
        ))
    }

    #[must_use]
    pub fn viewer(&self) -> &LogViewer {
        &self.shared.viewer
    }

    /// Fully qualified advertised name
    #[must_use]
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Port actually bound
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resumption cursor currently held for a producer run
    #[must_use]
    pub fn last_item_id(&self, producer_id: &str) -> LastItemId {
        self.shared.cursors.get(producer_id)
    }

    #[must_use]
    pub fn cursors(&self) -> CursorStore {
        self.shared.cursors.clone()
    }

    /// Runs with a live receiver
    #[must_use]
    pub fn active_producers(&self) -> Vec<ApplicationRun> {
        let mut runs: Vec<ApplicationRun> = self
            .shared
            .receivers
            .iter()
            .map(|entry| entry.value().run.clone())
            .collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        runs
    }

    /// Close the connection of one producer run
    ///
    /// The producer will reconnect on its own while it still sees the
    /// advertisement.
    pub fn disconnect(&self, producer_id: &str) -> bool {
        let Some((producer_id, active)) = self.shared.receivers.remove(producer_id) else {
            return false;
        };
        active.task.abort();
        tracing::info!(producer = %producer_id, conn_id = %active.connection, "Producer disconnected");
        let _ = self.shared.events.send(ServerEvent::ConnectionLost {
            producer_id,
            connection: active.connection,
            reason: "disconnected by viewer".to_string(),
        });
        true
    }

    /// Stop advertising and abort all receivers
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            // Cancellation is the expected outcome
            let _ = task.await;
        }
        tracing::info!(service = %self.fullname, "Viewer stopped");
    }

    fn stop(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(task) = self.accept_task.lock().as_ref() {
            task.abort();
        }
        self.shared.receivers.retain(|_, active| {
            active.task.abort();
            false
        });
    }
}

impl Drop for CaptainsLogServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CaptainsLogServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptainsLogServer")
            .field("fullname", &self.fullname)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn accept_loop(
    shared: Arc<Shared>,
    mut advertisement: Advertisement,
    security: Arc<dyn ServerSecurity>,
) {
    // Dropping the set (on abort) cancels handshakes still in progress
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            accepted = advertisement.accept() => {
                let Some(accepted) = accepted else {
                    break;
                };
                let span = tracing::info_span!("connection", peer = ?accepted.peer);
                handshakes.spawn(
                    handle_connection(Arc::clone(&shared), Arc::clone(&security), accepted)
                        .instrument(span),
                );
            }
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }

    tracing::info!(service = %advertisement.fullname(), "Stopped accepting producers");
}

async fn handle_connection(
    shared: Arc<Shared>,
    security: Arc<dyn ServerSecurity>,
    accepted: AcceptedStream,
) {
    let peer = accepted.peer;
    let cursors = shared.cursors.clone();

    let result = accept_logger(
        accepted,
        security.as_ref(),
        &shared.viewer,
        |run| cursors.get(&run.id),
        shared.handshake_timeout,
    )
    .await;

    match result {
        Ok(connection) => shared.attach(connection),
        Err(e) => {
            tracing::warn!(kind = %e.kind(), error = %e, "Producer connection failed");
            let _ = shared.events.send(ServerEvent::ConnectionFailed {
                peer,
                error: e.to_string(),
            });
        }
    }
}

impl Shared {
    fn attach(self: &Arc<Self>, connection: LoggerConnection) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let LoggerConnection { id, run, stream, .. } = connection;
        let producer_id = run.id.clone();
        let (reader, writer) = stream.into_split();
        let receiver = LogReceiver::new(producer_id.clone(), reader, self.cursors.clone());

        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let shared = Arc::clone(self);
        let connection = id.clone();
        let span = tracing::info_span!("receiver", producer = %producer_id, conn_id = %id);
        let task = tokio::spawn(
            async move {
                // The write half stays open for the lifetime of the link
                let _writer = writer;
                if registered_rx.await.is_err() {
                    return;
                }

                let events = shared.events.clone();
                let item_producer = producer_id.clone();
                let error = receiver
                    .run(|item| {
                        let _ = events.send(ServerEvent::ItemReceived {
                            producer_id: item_producer.clone(),
                            item,
                        });
                    })
                    .await;

                shared.detach(producer_id, connection, error.to_string());
            }
            .instrument(span),
        );

        let previous = self.receivers.insert(
            run.id.clone(),
            ActiveReceiver {
                connection: id.clone(),
                run: run.clone(),
                task: task.abort_handle(),
            },
        );

        if let Some(previous) = previous {
            previous.task.abort();
            tracing::info!(producer = %run.id, old = %previous.connection, new = %id, "Connection superseded");
            let _ = self.events.send(ServerEvent::ConnectionLost {
                producer_id: run.id.clone(),
                connection: previous.connection,
                reason: "superseded by a new connection".to_string(),
            });
        }

        let _ = self.events.send(ServerEvent::ConnectionEstablished {
            connection: id,
            run,
        });
        let _ = registered_tx.send(());
    }

    fn detach(&self, producer_id: String, connection: ConnectionId, reason: String) {
        self.receivers
            .remove_if(&producer_id, |_, active| active.connection == connection);
        tracing::info!(producer = %producer_id, conn_id = %connection, reason = %reason, "Producer connection lost");
        let _ = self.events.send(ServerEvent::ConnectionLost {
            producer_id,
            connection,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDirectory;
    use crate::security::test_pki::TestCa;
    use crate::security::{IdentityPresentingSecurity, StaticIdentityProvider};

    const SEED: &str = "captainslog-seed";

    fn security(ca: &TestCa) -> Arc<dyn ServerSecurity> {
        Arc::new(IdentityPresentingSecurity::new(Arc::new(
            StaticIdentityProvider::new().with_identity(SEED, ca.issue("viewer")),
        )))
    }

    #[test]
    fn test_config_record() {
        let record = ServerConfig::new("Desk", SEED).with_port(0).record();
        assert_eq!(record.name, "Desk");
        assert_eq!(record.port, 0);
        assert_eq!(record.txt.identifier, SEED);
        assert_eq!(record.service_type, DEFAULT_SERVICE_TYPE);
    }

    #[tokio::test]
    async fn test_start_advertises_and_shutdown_withdraws() {
        let ca = TestCa::new("seed");
        let directory = MemoryDirectory::new();
        let config = ServerConfig::new("Desk", SEED).with_port(0);

        let (server, _events) = CaptainsLogServer::start(&directory, security(&ca), config)
            .await
            .unwrap();
        let services = directory.services();
        let service = services.get(server.fullname()).unwrap();
        assert_eq!(service.identifier(), Some(SEED));
        assert_eq!(service.port, server.port());

        server.shutdown().await;
        assert!(directory.services().is_empty());
    }

    #[tokio::test]
    async fn test_failed_handshake_is_reported() {
        let ca = TestCa::new("seed");
        let directory = MemoryDirectory::new();
        let config = ServerConfig::new("Desk", SEED).with_port(0);
        let (server, mut events) = CaptainsLogServer::start(&directory, security(&ca), config)
            .await
            .unwrap();

        let service = directory.services().get(server.fullname()).unwrap().clone();
        let mut raw = directory.connect(&service).await.unwrap();
        tokio::io::AsyncWriteExt::write_u8(&mut raw, 9).await.unwrap();

        match events.recv().await.unwrap() {
            ServerEvent::ConnectionFailed { error, .. } => {
                assert!(error.contains("Unknown protocol"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(server.active_producers().is_empty());
    }
}
