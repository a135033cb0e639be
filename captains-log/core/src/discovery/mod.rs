//! Service Discovery
//!
//! Viewers advertise themselves on the local network; producers browse for
//! them and connect. The [`ServiceDirectory`] trait covers both roles so the
//! rest of the crate never sees a concrete discovery backend:
//! - `MdnsDirectory`: multicast DNS on the LAN
//! - `MemoryDirectory`: in-process registry (embedded mode and tests)
//!
//! # Snapshots, not deltas
//!
//! Browsing yields complete [`ServiceSet`] snapshots. Backends report finds
//! and removals in bursts; a burst is coalesced into a single snapshot so
//! consumers never act on a partial view.
//!
//! # Security
//!
//! Discovery is unauthenticated. The TXT record only tells a producer which
//! seed identifier the viewer expects; trust is established later by TLS.

pub mod browser;
pub mod mdns;
pub mod memory;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::transport::{BoxedStream, TransportError};

pub use mdns::MdnsDirectory;
pub use memory::MemoryDirectory;

/// TXT record key carrying the JSON-encoded [`LoggerTxt`]
pub const TXT_KEY: &str = "OK";

/// Default service type advertised by viewers
pub const DEFAULT_SERVICE_TYPE: &str = "_captainslog-server._tcp";

/// Default discovery domain
pub const DEFAULT_DOMAIN: &str = "local";

/// Default viewer port
pub const DEFAULT_PORT: u16 = 1111;

/// Errors raised by a discovery backend
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The backend could not be started
    #[error("Discovery backend unavailable: {0}")]
    Unavailable(String),

    /// Registering an advertisement failed
    #[error("Failed to advertise {name}: {reason}")]
    AdvertiseFailed {
        /// Service instance name
        name: String,
        /// Backend error
        reason: String,
    },

    /// Binding the listening socket failed
    #[error("Failed to listen on port {port}: {source}")]
    Listen {
        /// Requested port
        port: u16,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Browsing could not be started
    #[error("Failed to browse {service_type}: {reason}")]
    BrowseFailed {
        /// Service type being browsed
        service_type: String,
        /// Backend error
        reason: String,
    },
}

/// TXT payload published under [`TXT_KEY`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerTxt {
    /// Seed identifier of the identity the viewer presents
    pub identifier: String,
}

impl LoggerTxt {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    /// Decode from the raw TXT value, ignoring anything malformed
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(txt) => Some(txt),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed TXT record");
                None
            }
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a single string field cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// An endpoint to publish
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Instance name, e.g. the viewer's display name
    pub name: String,
    /// Service type, e.g. `_captainslog-server._tcp`
    pub service_type: String,
    /// Domain, e.g. `local`
    pub domain: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    pub txt: LoggerTxt,
}

impl ServiceRecord {
    /// A record with the default type, domain and port
    pub fn new(name: impl Into<String>, txt: LoggerTxt) -> Self {
        Self {
            name: name.into(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            port: DEFAULT_PORT,
            txt,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_type(mut self, service_type: impl Into<String>, domain: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self.domain = domain.into();
        self
    }
}

/// Fully qualified type string, `<type>.<domain>.`
#[must_use]
pub fn qualified_type(service_type: &str, domain: &str) -> String {
    format!(
        "{}.{}.",
        service_type.trim_end_matches('.'),
        domain.trim_end_matches('.')
    )
}

/// Fully qualified instance name, `<name>.<type>.<domain>.`
#[must_use]
pub fn fullname(name: &str, service_type: &str, domain: &str) -> String {
    format!("{name}.{}", qualified_type(service_type, domain))
}

/// A resolved endpoint seen while browsing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Fully qualified instance name, unique within a snapshot
    pub fullname: String,
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Decoded TXT record, if present and well formed
    pub txt: Option<LoggerTxt>,
}

impl DiscoveredService {
    /// Seed identifier advertised by the viewer
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.txt.as_ref().map(|txt| txt.identifier.as_str())
    }
}

/// A complete view of the services currently known
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSet {
    services: BTreeMap<String, DiscoveredService>,
}

impl ServiceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a service, returning whether the set changed
    pub fn upsert(&mut self, service: DiscoveredService) -> bool {
        match self.services.get(&service.fullname) {
            Some(existing) if *existing == service => false,
            _ => {
                self.services.insert(service.fullname.clone(), service);
                true
            }
        }
    }

    /// Remove a service by full name, returning whether it was present
    pub fn remove(&mut self, fullname: &str) -> bool {
        self.services.remove(fullname).is_some()
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }

    #[must_use]
    pub fn get(&self, fullname: &str) -> Option<&DiscoveredService> {
        self.services.get(fullname)
    }

    #[must_use]
    pub fn contains(&self, fullname: &str) -> bool {
        self.services.contains_key(fullname)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredService> {
        self.services.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl FromIterator<DiscoveredService> for ServiceSet {
    fn from_iter<I: IntoIterator<Item = DiscoveredService>>(iter: I) -> Self {
        let mut set = Self::new();
        for service in iter {
            set.upsert(service);
        }
        set
    }
}

/// A raw inbound connection accepted by an advertisement
pub struct AcceptedStream {
    pub stream: BoxedStream,
    /// Remote address, when the backend has one
    pub peer: Option<SocketAddr>,
}

impl std::fmt::Debug for AcceptedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptedStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

type StopFn = Box<dyn FnOnce() + Send>;

/// A live advertisement
///
/// Dropping it (or calling [`Advertisement::stop`]) withdraws the record and
/// stops accepting connections.
pub struct Advertisement {
    fullname: String,
    port: u16,
    incoming: mpsc::Receiver<AcceptedStream>,
    stop: Option<StopFn>,
}

impl Advertisement {
    /// Assemble an advertisement from a backend's parts
    pub fn new(
        fullname: String,
        port: u16,
        incoming: mpsc::Receiver<AcceptedStream>,
        stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            fullname,
            port,
            incoming,
            stop: Some(Box::new(stop)),
        }
    }

    #[must_use]
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Port actually bound
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next inbound connection
    ///
    /// Returns `None` once the advertisement has been withdrawn.
    pub async fn accept(&mut self) -> Option<AcceptedStream> {
        self.incoming.recv().await
    }

    /// Withdraw the record
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
            self.incoming.close();
        }
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advertisement")
            .field("fullname", &self.fullname)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrowserState {
    Running,
    /// The final empty snapshot is still owed
    Ending,
    Finished,
}

/// A running browse
///
/// Yields complete snapshots until stopped. After [`ServiceBrowser::stop`]
/// (or when the backend goes away) it yields exactly one empty snapshot and
/// then `None`.
pub struct ServiceBrowser {
    snapshots: mpsc::Receiver<ServiceSet>,
    stop: Option<StopFn>,
    state: BrowserState,
}

impl ServiceBrowser {
    /// Assemble a browser from a backend's parts
    pub fn new(snapshots: mpsc::Receiver<ServiceSet>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            snapshots,
            stop: Some(Box::new(stop)),
            state: BrowserState::Running,
        }
    }

    /// A browser whose backend failed to start
    ///
    /// Yields one empty snapshot; the caller may browse again later.
    #[must_use]
    pub fn failed() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self {
            snapshots: rx,
            stop: None,
            state: BrowserState::Ending,
        }
    }

    /// Wait for the next snapshot
    pub async fn next(&mut self) -> Option<ServiceSet> {
        match self.state {
            BrowserState::Running => match self.snapshots.recv().await {
                Some(snapshot) => Some(snapshot),
                None => {
                    self.state = BrowserState::Finished;
                    Some(ServiceSet::new())
                }
            },
            BrowserState::Ending => {
                self.state = BrowserState::Finished;
                Some(ServiceSet::new())
            }
            BrowserState::Finished => None,
        }
    }

    /// Dispose the backend subscription
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
        self.snapshots.close();
        if self.state == BrowserState::Running {
            self.state = BrowserState::Ending;
        }
    }

    /// Whether the final snapshot has been delivered
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == BrowserState::Finished
    }
}

impl Drop for ServiceBrowser {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for ServiceBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBrowser")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Advertise, browse and connect
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Publish an endpoint and start accepting raw connections on it
    async fn advertise(&self, record: ServiceRecord) -> Result<Advertisement, DiscoveryError>;

    /// Start browsing for endpoints of a type within a domain
    ///
    /// Never fails: a backend error is logged and surfaces as a browser that
    /// yields a single empty snapshot.
    async fn browse(&self, service_type: &str, domain: &str) -> ServiceBrowser;

    /// Open a raw stream to a discovered endpoint
    async fn connect(&self, service: &DiscoveredService) -> Result<BoxedStream, TransportError>;
}
