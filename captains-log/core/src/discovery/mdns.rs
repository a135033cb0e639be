//! mDNS-based LAN discovery using mdns-sd.
//!
//! Viewers register `<name>.<type>.<domain>.` with a TXT record
//! `OK={"identifier": ...}` and accept TCP connections on the advertised
//! port. Producers browse the same type and connect to the resolved
//! addresses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::browser::{spawn_coalescer, BrowseEvent, DEFAULT_COALESCE_WINDOW};
use super::{
    qualified_type, AcceptedStream, Advertisement, DiscoveredService, DiscoveryError, LoggerTxt,
    ServiceBrowser, ServiceDirectory, ServiceRecord, TXT_KEY,
};
use crate::transport::{BoxedStream, TransportError};

/// How often the blocking browse loop checks for a stop request
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pending inbound connections per advertisement
const ACCEPT_BACKLOG: usize = 32;

/// Multicast DNS service directory
#[derive(Clone)]
pub struct MdnsDirectory {
    daemon: ServiceDaemon,
}

impl MdnsDirectory {
    /// Start the mDNS daemon
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(Self { daemon })
    }

    /// Stop the daemon; outstanding advertisements and browses end
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            tracing::warn!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim_end_matches(".local").to_string())
        .unwrap_or_else(|| "captainslog-viewer".into())
}

fn to_discovered(info: &ServiceInfo, service_type: &str, domain: &str) -> DiscoveredService {
    let fullname = info.get_fullname().to_string();
    let suffix = format!(".{}", qualified_type(service_type, domain));
    let name = fullname
        .strip_suffix(&suffix)
        .unwrap_or(&fullname)
        .to_string();

    let txt = info
        .get_properties()
        .get(TXT_KEY)
        .and_then(|v| LoggerTxt::decode(v.val_str()));

    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    // IPv4 first, then stable order
    addresses.sort_by_key(|addr| (addr.is_ipv6(), *addr));

    DiscoveredService {
        fullname,
        name,
        service_type: service_type.to_string(),
        domain: domain.to_string(),
        addresses,
        port: info.get_port(),
        txt,
    }
}

#[async_trait]
impl ServiceDirectory for MdnsDirectory {
    async fn advertise(&self, record: ServiceRecord) -> Result<Advertisement, DiscoveryError> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, record.port)))
            .await
            .map_err(|source| DiscoveryError::Listen {
                port: record.port,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| DiscoveryError::Listen {
                port: record.port,
                source,
            })?
            .port();

        let ty_domain = qualified_type(&record.service_type, &record.domain);
        let host = format!("{}.{}.", host_name(), record.domain.trim_end_matches('.'));
        let properties = [(TXT_KEY.to_string(), record.txt.encode())];

        let info = ServiceInfo::new(&ty_domain, &record.name, &host, "", port, &properties[..])
            .map_err(|e| DiscoveryError::AdvertiseFailed {
                name: record.name.clone(),
                reason: e.to_string(),
            })?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::AdvertiseFailed {
                name: record.name.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(service = %fullname, port, "mDNS: registered");

        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                        }
                        let accepted = AcceptedStream {
                            stream: Box::new(stream),
                            peer: Some(peer),
                        };
                        if tx.send(accepted).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        let daemon = self.daemon.clone();
        let unregister_name = fullname.clone();
        Ok(Advertisement::new(fullname, port, incoming, move || {
            accept_task.abort();
            if let Err(e) = daemon.unregister(&unregister_name) {
                tracing::warn!(service = %unregister_name, error = %e, "mDNS: failed to unregister");
            }
        }))
    }

    async fn browse(&self, service_type: &str, domain: &str) -> ServiceBrowser {
        let ty_domain = qualified_type(service_type, domain);
        let receiver = match self.daemon.browse(&ty_domain) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::warn!(service_type = %ty_domain, error = %e, "mDNS: browse failed");
                return ServiceBrowser::failed();
            }
        };

        let (events_tx, events_rx) = mpsc::channel(64);
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stopped);
        let service_type = service_type.to_string();
        let domain = domain.to_string();

        // mdns-sd delivers on a blocking channel
        tokio::task::spawn_blocking(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                let event = match receiver.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => event,
                    Err(_) if !receiver.is_disconnected() => continue,
                    Err(_) => {
                        let _ = events_tx.blocking_send(BrowseEvent::Failed(
                            "mDNS browse channel closed".to_string(),
                        ));
                        break;
                    }
                };

                let mapped = match event {
                    ServiceEvent::ServiceResolved(info) => Some(BrowseEvent::Resolved(
                        to_discovered(&info, &service_type, &domain),
                    )),
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        Some(BrowseEvent::Removed { fullname })
                    }
                    ServiceEvent::SearchStarted(_) => {
                        tracing::trace!("mDNS: browse started");
                        None
                    }
                    _ => None,
                };

                if let Some(event) = mapped {
                    if events_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            }
            tracing::debug!("mDNS: browse loop ended");
        });

        let snapshots = spawn_coalescer(events_rx, DEFAULT_COALESCE_WINDOW);
        let daemon = self.daemon.clone();
        ServiceBrowser::new(snapshots, move || {
            stopped.store(true, Ordering::SeqCst);
            if let Err(e) = daemon.stop_browse(&ty_domain) {
                tracing::debug!(error = %e, "mDNS: stop_browse failed");
            }
        })
    }

    async fn connect(&self, service: &DiscoveredService) -> Result<BoxedStream, TransportError> {
        let mut last_error = None;
        for addr in &service.addresses {
            match TcpStream::connect(SocketAddr::new(*addr, service.port)).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    tracing::debug!(service = %service.fullname, %addr, "Connected");
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    tracing::debug!(service = %service.fullname, %addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError::ConnectionFailed(match last_error {
            Some(e) => format!("{}: {e}", service.fullname),
            None => format!("{}: no addresses resolved", service.fullname),
        }))
    }
}
