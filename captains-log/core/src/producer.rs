//! Producer
//!
//! [`CaptainsLog`] is what an instrumented application holds. It keeps the
//! run's item history, browses for viewers and keeps one [`LogSender`] per
//! connected viewer.
//!
//! # Supervisor
//!
//! A single task owns the link lifecycle of every discovered viewer:
//!
//! ```text
//! browse -> connect -> pin-verify -> handshake -> replay + attach sender
//!              ^                                          |
//!              +------------ backoff on failure ----------+
//! ```
//!
//! Connection attempts run on their own tasks under the reconnect policy.
//! Trust and identity failures are not retried; the link is marked failed
//! until the viewer's record changes or it is rediscovered.
//!
//! # Ordering
//!
//! `log` appends to the history and pushes to every attached sender under
//! one lock, and attaching replays from the history under the same lock, so
//! each viewer sees the run's items in order with nothing skipped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

use crate::connection::{connect_to_viewer, ConnectError, ErrorKind, ViewerConnection};
use crate::discovery::{
    DiscoveredService, ServiceBrowser, ServiceDirectory, ServiceSet, DEFAULT_DOMAIN,
    DEFAULT_SERVICE_TYPE,
};
use crate::models::{ApplicationRun, LastItemId, LogItem, LogViewer};
use crate::retry::RetryBehavior;
use crate::security::ClientSecurity;
use crate::sender::{Disconnected, LogSender, SenderOptions};
use crate::transport::{ConnectionId, TransportConfig};

/// Default number of items kept for replay
pub const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Pause before browsing again after the backend went away
const BROWSE_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Producer tuning
#[derive(Clone, Debug, PartialEq)]
pub struct ProducerConfig {
    /// Service type browsed for viewers
    pub service_type: String,
    pub domain: String,
    /// Policy for whole connection attempts
    pub reconnect: RetryBehavior,
    /// Policy and limits for frame writes
    pub sender: SenderOptions,
    pub handshake_timeout: Option<Duration>,
    /// Items kept for replay; older items rotate out
    pub max_history: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            reconnect: RetryBehavior::default(),
            sender: SenderOptions::default(),
            handshake_timeout: None,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl ProducerConfig {
    #[must_use]
    pub fn from_transport(transport: &TransportConfig) -> Self {
        Self {
            service_type: transport.service_type.clone(),
            domain: transport.domain.clone(),
            reconnect: transport.reconnect_policy(),
            sender: SenderOptions {
                write_timeout: transport.write_timeout(),
                ..SenderOptions::default()
            },
            handshake_timeout: transport.handshake_timeout(),
            ..Self::default()
        }
    }
}

/// Link lifecycle notifications
#[derive(Clone, Debug, PartialEq)]
pub enum ProducerEvent {
    /// A viewer completed the handshake and its backlog was queued
    Connected {
        service: String,
        connection: ConnectionId,
        viewer: LogViewer,
        /// Items queued as replay
        replayed: usize,
    },

    /// An attached viewer went away; a reconnect follows if it is still
    /// advertised
    Disconnected { service: String, reason: String },

    /// Connecting to a viewer failed for good
    PeerFailed {
        service: String,
        kind: ErrorKind,
        error: String,
    },
}

/// Items after the cursor, or the whole history when the cursor is unknown
#[must_use]
pub fn replay_from(history: &VecDeque<LogItem>, cursor: &LastItemId) -> Vec<LogItem> {
    let start = cursor
        .assigned()
        .and_then(|id| history.iter().rposition(|item| item.id == id))
        .map_or(0, |pos| pos + 1);
    history.iter().skip(start).cloned().collect()
}

// =============================================================================
// Shared State
// =============================================================================

/// A connect task in flight
///
/// Results carry the attempt id; anything else reaching the supervisor
/// belongs to an attempt that was already abandoned.
struct Attempt {
    id: u64,
    task: AbortHandle,
}

enum LinkState {
    Connecting(Attempt),
    Attached(LogSender),
    Failed,
}

impl LinkState {
    fn is_attempt(&self, attempt: u64) -> bool {
        matches!(self, Self::Connecting(current) if current.id == attempt)
    }
}

struct Link {
    service: DiscoveredService,
    state: LinkState,
}

struct ProducerState {
    history: VecDeque<LogItem>,
    max_history: usize,
    links: HashMap<String, Link>,
}

enum Command {
    DisconnectAll,
    Shutdown(oneshot::Sender<()>),
}

enum LinkEvent {
    Ready {
        fullname: String,
        attempt: u64,
        connection: Box<ViewerConnection>,
    },
    Failed {
        fullname: String,
        attempt: u64,
        error: ConnectError,
    },
}

// =============================================================================
// Public Handle
// =============================================================================

/// Producer handle
///
/// Dropping it stops the supervisor and closes all links.
pub struct CaptainsLog {
    run: ApplicationRun,
    state: Arc<Mutex<ProducerState>>,
    commands: mpsc::UnboundedSender<Command>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CaptainsLog {
    /// Start browsing for viewers
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        run: ApplicationRun,
        directory: Arc<dyn ServiceDirectory>,
        security: Arc<dyn ClientSecurity>,
        config: ProducerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProducerEvent>) {
        let state = Arc::new(Mutex::new(ProducerState {
            history: VecDeque::new(),
            max_history: config.max_history.max(1),
            links: HashMap::new(),
        }));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();

        let span = tracing::info_span!("producer", run = %run.id);
        let supervisor = Supervisor {
            run: run.clone(),
            directory,
            security,
            config,
            state: Arc::clone(&state),
            events,
            link_tx,
            disconnect_tx,
            known: ServiceSet::new(),
            next_attempt: AtomicU64::new(0),
        };
        let task = tokio::spawn(
            supervisor
                .run(command_rx, link_rx, disconnect_rx)
                .instrument(span),
        );

        tracing::info!(run = %run.id, application = %run.application.name, "Captain's Log started");

        (
            Self {
                run,
                state,
                commands,
                supervisor: Mutex::new(Some(task)),
            },
            event_rx,
        )
    }

    #[must_use]
    pub fn run(&self) -> &ApplicationRun {
        &self.run
    }

    /// Record an item and queue it on every attached viewer
    ///
    /// Never blocks on the network.
    pub fn log(&self, item: LogItem) {
        let mut state = self.state.lock();
        for link in state.links.values() {
            if let LinkState::Attached(sender) = &link.state {
                sender.push(item.clone());
            }
        }
        state.history.push_back(item);
        while state.history.len() > state.max_history {
            state.history.pop_front();
        }
    }

    /// Items currently kept for replay
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Full names of the viewers with an attached sender
    #[must_use]
    pub fn connected_viewers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .links
            .iter()
            .filter(|(_, link)| matches!(link.state, LinkState::Attached(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop every viewer link and reconnect, as if the network blipped
    pub fn disconnect_all(&self) {
        let _ = self.commands.send(Command::DisconnectAll);
    }

    /// Stop browsing and close all links
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let task = self.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "Supervisor task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for CaptainsLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptainsLog")
            .field("run", &self.run.id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Supervisor {
    run: ApplicationRun,
    directory: Arc<dyn ServiceDirectory>,
    security: Arc<dyn ClientSecurity>,
    config: ProducerConfig,
    state: Arc<Mutex<ProducerState>>,
    events: mpsc::UnboundedSender<ProducerEvent>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    disconnect_tx: mpsc::UnboundedSender<Disconnected>,
    /// Last accepted snapshot
    known: ServiceSet,
    next_attempt: AtomicU64,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut disconnects: mpsc::UnboundedReceiver<Disconnected>,
    ) {
        let mut browser = self.browse().await;
        let restart = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(restart);
        let mut restarting = false;

        loop {
            tokio::select! {
                snapshot = browser.next(), if !restarting => match snapshot {
                    Some(snapshot) => self.reconcile(&snapshot),
                    None => {
                        tracing::debug!(delay = ?BROWSE_RESTART_DELAY, "Browse ended, restarting");
                        restart.as_mut().reset(tokio::time::Instant::now() + BROWSE_RESTART_DELAY);
                        restarting = true;
                    }
                },
                () = &mut restart, if restarting => {
                    restarting = false;
                    browser = self.browse().await;
                },
                Some(event) = link_events.recv() => self.on_link_event(event),
                Some(disconnected) = disconnects.recv() => self.on_disconnected(disconnected).await,
                command = commands.recv() => match command {
                    Some(Command::DisconnectAll) => self.disconnect_all().await,
                    Some(Command::Shutdown(ack)) => {
                        browser.stop();
                        self.close_all().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        browser.stop();
                        self.close_all().await;
                        break;
                    }
                },
            }
        }

        tracing::info!("Captain's Log stopped");
    }

    async fn browse(&self) -> ServiceBrowser {
        self.directory
            .browse(&self.config.service_type, &self.config.domain)
            .await
    }

    /// Viewers advertising a different seed cannot present a trusted chain
    fn accepts(&self, service: &DiscoveredService) -> bool {
        match (self.security.seed_identifier(), service.identifier()) {
            (Some(ours), Some(theirs)) if ours != theirs => {
                tracing::debug!(
                    service = %service.fullname,
                    advertised = theirs,
                    expected = ours,
                    "Skipping viewer with a different seed"
                );
                false
            }
            _ => true,
        }
    }

    fn reconcile(&mut self, snapshot: &ServiceSet) {
        let accepted: ServiceSet = snapshot
            .iter()
            .filter(|service| self.accepts(service))
            .cloned()
            .collect();

        let mut state = self.state.lock();

        state.links.retain(|fullname, link| {
            if accepted.contains(fullname) {
                return true;
            }
            match &link.state {
                // A live stream outlives its record
                LinkState::Attached(_) => true,
                LinkState::Connecting(attempt) => {
                    tracing::debug!(service = %fullname, "Viewer vanished, abandoning connect");
                    attempt.task.abort();
                    false
                }
                LinkState::Failed => false,
            }
        });

        for service in accepted.iter() {
            match state.links.get_mut(&service.fullname) {
                None => {
                    tracing::info!(service = %service.fullname, "Viewer discovered");
                    let attempt = self.spawn_connect(service.clone(), Duration::ZERO);
                    state.links.insert(
                        service.fullname.clone(),
                        Link {
                            service: service.clone(),
                            state: LinkState::Connecting(attempt),
                        },
                    );
                }
                Some(link) if matches!(link.state, LinkState::Failed) && link.service != *service => {
                    tracing::info!(service = %service.fullname, "Failed viewer re-advertised, retrying");
                    link.state = LinkState::Connecting(self.spawn_connect(service.clone(), Duration::ZERO));
                    link.service = service.clone();
                }
                Some(link) => link.service = service.clone(),
            }
        }

        drop(state);
        self.known = accepted;
    }

    fn spawn_connect(&self, service: DiscoveredService, delay: Duration) -> Attempt {
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let directory = Arc::clone(&self.directory);
        let security = Arc::clone(&self.security);
        let run = self.run.clone();
        let policy = self.config.reconnect.clone();
        let handshake_timeout = self.config.handshake_timeout;
        let link_tx = self.link_tx.clone();
        let span = tracing::info_span!("connect", service = %service.fullname, attempt);

        let task = tokio::spawn(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let result = policy
                    .run_while(
                        |_attempt| {
                            connect_to_viewer(
                                directory.as_ref(),
                                security.as_ref(),
                                &service,
                                &run,
                                handshake_timeout,
                            )
                        },
                        ConnectError::is_retryable,
                    )
                    .await;

                let fullname = service.fullname.clone();
                let event = match result {
                    Ok(connection) => LinkEvent::Ready {
                        fullname,
                        attempt,
                        connection: Box::new(connection),
                    },
                    Err(error) => LinkEvent::Failed {
                        fullname,
                        attempt,
                        error,
                    },
                };
                let _ = link_tx.send(event);
            }
            .instrument(span),
        );
        Attempt {
            id: attempt,
            task: task.abort_handle(),
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Ready {
                fullname,
                attempt,
                connection,
            } => self.attach(&fullname, attempt, *connection),
            LinkEvent::Failed {
                fullname,
                attempt,
                error,
            } => {
                let mut state = self.state.lock();
                let Some(link) = state.links.get_mut(&fullname) else {
                    return;
                };
                if !link.state.is_attempt(attempt) {
                    tracing::debug!(service = %fullname, attempt, error = %error, "Ignoring failure of an abandoned attempt");
                    return;
                }
                link.state = LinkState::Failed;
                drop(state);

                tracing::warn!(service = %fullname, kind = %error.kind(), error = %error, "Giving up on viewer");
                let _ = self.events.send(ProducerEvent::PeerFailed {
                    service: fullname,
                    kind: error.kind(),
                    error: error.to_string(),
                });
            }
        }
    }

    fn attach(&mut self, fullname: &str, attempt: u64, connection: ViewerConnection) {
        let ViewerConnection {
            id,
            service,
            viewer,
            last_item_id,
            stream,
        } = connection;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(link) = state.links.get_mut(fullname) else {
            tracing::debug!(service = %fullname, "Viewer forgotten before attach, dropping connection");
            return;
        };
        if !link.state.is_attempt(attempt) {
            // Dropping the stream closes it
            tracing::debug!(service = %fullname, attempt, "Connection from an abandoned attempt, dropping");
            return;
        }

        let (reader, writer) = stream.into_split();
        let sender = LogSender::spawn(
            id.clone(),
            reader,
            writer,
            self.config.sender.clone(),
            self.disconnect_tx.clone(),
        );
        let replay = replay_from(&state.history, &last_item_id);
        let replayed = replay.len();
        sender.push_all(replay);

        link.service = service;
        link.state = LinkState::Attached(sender);
        drop(guard);

        tracing::info!(service = %fullname, conn_id = %id, replayed, "Viewer attached");
        let _ = self.events.send(ProducerEvent::Connected {
            service: fullname.to_string(),
            connection: id,
            viewer,
            replayed,
        });
    }

    async fn on_disconnected(&mut self, disconnected: Disconnected) {
        let Some((fullname, previous)) = self.detach(&disconnected.connection) else {
            // Already replaced or closed
            return;
        };

        if let LinkState::Attached(sender) = previous {
            sender.close().await;
        }

        let _ = self.events.send(ProducerEvent::Disconnected {
            service: fullname,
            reason: disconnected.reason,
        });
    }

    /// Take the sender of a lost connection out of its link, scheduling a
    /// reconnect while the viewer is still advertised
    fn detach(&self, connection: &ConnectionId) -> Option<(String, LinkState)> {
        let mut state = self.state.lock();
        let fullname = state
            .links
            .iter()
            .find(|(_, link)| {
                matches!(&link.state, LinkState::Attached(sender) if sender.id() == connection)
            })
            .map(|(name, _)| name.clone())?;

        if self.known.contains(&fullname) {
            let link = state.links.get_mut(&fullname)?;
            let attempt = self.spawn_connect(link.service.clone(), self.config.reconnect.initial_delay);
            let previous = std::mem::replace(&mut link.state, LinkState::Connecting(attempt));
            Some((fullname, previous))
        } else {
            tracing::debug!(service = %fullname, "Lost viewer is no longer advertised");
            state.links.remove(&fullname).map(|link| (fullname, link.state))
        }
    }

    async fn disconnect_all(&mut self) {
        let mut closed = Vec::new();
        {
            let mut state = self.state.lock();
            for (fullname, link) in &mut state.links {
                if matches!(link.state, LinkState::Attached(_)) {
                    let attempt = self.spawn_connect(link.service.clone(), self.config.reconnect.initial_delay);
                    let previous = std::mem::replace(&mut link.state, LinkState::Connecting(attempt));
                    closed.push((fullname.clone(), previous));
                }
            }
        }

        tracing::info!(links = closed.len(), "Disconnecting all viewers");
        for (fullname, previous) in closed {
            if let LinkState::Attached(sender) = previous {
                sender.close().await;
            }
            let _ = self.events.send(ProducerEvent::Disconnected {
                service: fullname,
                reason: "disconnect requested".to_string(),
            });
        }
    }

    async fn close_all(&mut self) {
        let links: Vec<Link> = self.state.lock().links.drain().map(|(_, link)| link).collect();
        for link in links {
            match link.state {
                LinkState::Connecting(attempt) => attempt.task.abort(),
                LinkState::Attached(sender) => sender.close().await,
                LinkState::Failed => {}
            }
        }
    }
}
