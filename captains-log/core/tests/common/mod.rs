//! Shared fixtures for integration tests
//!
//! A throwaway seed authority, sample producer runs, and helpers that wire a
//! producer and a viewer together over an in-process directory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::mpsc;

use captains_log_core::{
    Application, ApplicationRun, CaptainsLog, CaptainsLogServer, CursorStore, Device, Identity,
    IdentityPresentingSecurity, LogItem, LogItemKind, LogLevel, LogMessage, MemoryDirectory,
    OperatingSystem, PinnedServerSecurity, ProducerConfig, ProducerEvent, RetryBehavior,
    SeedCertificate, ServerConfig, ServerEvent, StaticIdentityProvider,
};

pub const SEED_ID: &str = "captainslog-seed";

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Seed Authority
// =============================================================================

pub struct SeedAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl SeedAuthority {
    pub fn new(common_name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn seed(&self, identifier: &str) -> SeedCertificate {
        SeedCertificate::new(identifier, self.cert.der().clone())
    }

    pub fn issue(&self, common_name: &str) -> Identity {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Identity::new(
            vec![CertificateDer::from(cert.der().to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }
}

// =============================================================================
// Sample Data
// =============================================================================

pub fn run(id: &str) -> ApplicationRun {
    ApplicationRun::new(
        Application {
            name: "Sampler".to_string(),
            identifier: "com.example.sampler".to_string(),
        },
        Device {
            id: "device-1".to_string(),
            name: "Test Device".to_string(),
            operating_system: OperatingSystem::Linux,
            system_version: "6.1".to_string(),
        },
        "1.0.0",
        SEED_ID,
    )
    .with_id(id)
}

pub fn item(id: impl Into<String>) -> LogItem {
    let id = id.into();
    let message = LogMessage::new(LogLevel::Info, format!("message {id}"));
    LogItem::with_id(id, LogItemKind::Log(message))
}

pub fn ids(items: &[LogItem]) -> Vec<String> {
    items.iter().map(|item| item.id.clone()).collect()
}

/// Fast reconnects so tests do not wait on production delays
pub fn producer_config() -> ProducerConfig {
    ProducerConfig {
        reconnect: RetryBehavior::new(5, Duration::from_millis(20)),
        handshake_timeout: Some(Duration::from_secs(5)),
        ..ProducerConfig::default()
    }
}

// =============================================================================
// Wiring
// =============================================================================

pub async fn start_viewer(
    directory: &MemoryDirectory,
    authority: &SeedAuthority,
    name: &str,
    cursors: CursorStore,
) -> (CaptainsLogServer, mpsc::UnboundedReceiver<ServerEvent>) {
    let identities = StaticIdentityProvider::new().with_identity(SEED_ID, authority.issue(name));
    let security = IdentityPresentingSecurity::new(Arc::new(identities));
    let config = ServerConfig::new(name, SEED_ID).with_port(0);
    CaptainsLogServer::start_with_cursors(directory, Arc::new(security), config, cursors)
        .await
        .unwrap()
}

pub fn start_producer(
    directory: &MemoryDirectory,
    trusted: &SeedAuthority,
    run: ApplicationRun,
) -> (CaptainsLog, mpsc::UnboundedReceiver<ProducerEvent>) {
    let security = PinnedServerSecurity::new(trusted.seed(SEED_ID)).unwrap();
    CaptainsLog::start(
        run,
        Arc::new(directory.clone()),
        Arc::new(security),
        producer_config(),
    )
}

// =============================================================================
// Event Helpers
// =============================================================================

/// Wait for the first event matching `pick`, skipping others
pub async fn wait_for<E, T>(
    events: &mut mpsc::UnboundedReceiver<E>,
    mut pick: impl FnMut(E) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect `count` received items, ignoring connection events
pub async fn receive_items(
    events: &mut mpsc::UnboundedReceiver<ServerEvent>,
    count: usize,
) -> Vec<LogItem> {
    let mut items = Vec::with_capacity(count);
    while items.len() < count {
        let item = wait_for(events, |event| match event {
            ServerEvent::ItemReceived { item, .. } => Some(item),
            _ => None,
        })
        .await;
        items.push(item);
    }
    items
}

pub async fn wait_connected(events: &mut mpsc::UnboundedReceiver<ProducerEvent>) -> usize {
    wait_for(events, |event| match event {
        ProducerEvent::Connected { replayed, .. } => Some(replayed),
        _ => None,
    })
    .await
}

/// Assert nothing further arrives for a short while
pub async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<ServerEvent>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match events.recv().await {
                Some(ServerEvent::ItemReceived { item, .. }) => return Some(item),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await;
    if let Ok(Some(item)) = extra {
        panic!("unexpected item {}", item.id);
    }
}
