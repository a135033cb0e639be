//! In-Process Directory
//!
//! A [`ServiceDirectory`] backed by a shared registry instead of the
//! network. Connections are `tokio::io::duplex` pipes, so a producer and a
//! viewer in the same process exchange exactly the bytes they would over TCP.
//!
//! Used for embedded setups and for exercising the full protocol in tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{
    fullname, AcceptedStream, Advertisement, DiscoveredService, DiscoveryError, ServiceBrowser,
    ServiceDirectory, ServiceRecord, ServiceSet,
};
use crate::transport::{BoxedStream, TransportError};

/// Buffer size of each in-memory pipe direction
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Pending inbound connections per advertisement
const ACCEPT_BACKLOG: usize = 32;

/// First port handed out when a record asks for port 0
const EPHEMERAL_PORT_START: u16 = 49152;

struct Published {
    service: DiscoveredService,
    acceptor: mpsc::Sender<AcceptedStream>,
}

#[derive(Default)]
struct Registry {
    published: HashMap<String, Published>,
}

struct Inner {
    registry: Mutex<Registry>,
    /// Bumped on every registry change
    version: watch::Sender<u64>,
    next_port: AtomicU16,
}

/// Shared in-process service registry
///
/// Clones share the same registry.
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<Inner>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                version,
                next_port: AtomicU16::new(EPHEMERAL_PORT_START),
            }),
        }
    }

    /// Remove a record as if its publisher vanished from the network
    ///
    /// Returns whether the record existed.
    pub fn withdraw(&self, fullname: &str) -> bool {
        let removed = self.inner.registry.lock().published.remove(fullname).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Snapshot of everything currently published
    #[must_use]
    pub fn services(&self) -> ServiceSet {
        self.inner
            .registry
            .lock()
            .published
            .values()
            .map(|p| p.service.clone())
            .collect()
    }

    fn bump(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }

    fn snapshot_for(&self, service_type: &str, domain: &str) -> ServiceSet {
        self.inner
            .registry
            .lock()
            .published
            .values()
            .filter(|p| {
                p.service.service_type.trim_end_matches('.') == service_type.trim_end_matches('.')
                    && p.service.domain.trim_end_matches('.') == domain.trim_end_matches('.')
            })
            .map(|p| p.service.clone())
            .collect()
    }
}

#[async_trait]
impl ServiceDirectory for MemoryDirectory {
    async fn advertise(&self, record: ServiceRecord) -> Result<Advertisement, DiscoveryError> {
        let name = fullname(&record.name, &record.service_type, &record.domain);
        let port = if record.port == 0 {
            self.inner.next_port.fetch_add(1, Ordering::Relaxed)
        } else {
            record.port
        };

        let (acceptor, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let service = DiscoveredService {
            fullname: name.clone(),
            name: record.name.clone(),
            service_type: record.service_type.clone(),
            domain: record.domain.clone(),
            addresses: vec![IpAddr::from([127, 0, 0, 1])],
            port,
            txt: Some(record.txt.clone()),
        };

        {
            let mut registry = self.inner.registry.lock();
            if registry.published.contains_key(&name) {
                return Err(DiscoveryError::AdvertiseFailed {
                    name: record.name,
                    reason: "name already published".to_string(),
                });
            }
            registry
                .published
                .insert(name.clone(), Published { service, acceptor });
        }
        self.bump();

        tracing::debug!(service = %name, port, "Published in-memory service");

        let directory = self.clone();
        let withdraw_name = name.clone();
        Ok(Advertisement::new(name, port, incoming, move || {
            directory.withdraw(&withdraw_name);
        }))
    }

    async fn browse(&self, service_type: &str, domain: &str) -> ServiceBrowser {
        let (tx, rx) = mpsc::channel(16);
        let directory = self.clone();
        let service_type = service_type.to_string();
        let domain = domain.to_string();
        let mut changes = self.inner.version.subscribe();

        let task = tokio::spawn(async move {
            let mut last: Option<ServiceSet> = None;
            loop {
                changes.borrow_and_update();
                let snapshot = directory.snapshot_for(&service_type, &domain);
                if last.as_ref() != Some(&snapshot) {
                    if tx.send(snapshot.clone()).await.is_err() {
                        return;
                    }
                    last = Some(snapshot);
                }

                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = tx.closed() => return,
                }
            }
        });

        ServiceBrowser::new(rx, move || task.abort())
    }

    async fn connect(&self, service: &DiscoveredService) -> Result<BoxedStream, TransportError> {
        let acceptor = self
            .inner
            .registry
            .lock()
            .published
            .get(&service.fullname)
            .map(|p| p.acceptor.clone())
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("{} is not published", service.fullname))
            })?;

        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        acceptor
            .send(AcceptedStream {
                stream: Box::new(remote),
                peer: None,
            })
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!("{} refused the connection", service.fullname))
            })?;

        Ok(Box::new(local))
    }
}
