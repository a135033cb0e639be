//! Stream Security
//!
//! Secures a raw stream obtained from discovery before any frame is
//! exchanged.
//!
//! # Roles
//!
//! - Producer: TLS client. Trusts only the pinned seed certificate shipped
//!   with the application ([`PinnedServerSecurity`]).
//! - Viewer: TLS server. Presents the identity issued under the seed the
//!   producer asked for, selected by the TLS server name
//!   ([`IdentityPresentingSecurity`]).
//!
//! # Protocol byte
//!
//! The producer writes one byte before any TLS traffic:
//!
//! | Byte | Mode        |
//! |------|-------------|
//! | 0    | TLS         |
//! | 1    | Plaintext   |
//!
//! Plaintext is refused by viewers unless explicitly allowed.

pub mod identity;
pub mod pinned;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::transport::BoxedStream;

pub use identity::IdentityPresentingSecurity;
pub use pinned::PinnedServerSecurity;

/// Errors raised while securing a stream
#[derive(Debug, Error)]
pub enum SecurityError {
    /// No trust anchor is available to validate the peer
    #[error("Missing trust anchor: {0}")]
    MissingTrust(String),

    /// Trust evaluation could not be carried out
    #[error("Trust evaluation failed: {0}")]
    TrustEvaluationFailed(String),

    /// The peer's chain is not rooted at the pinned certificate
    #[error("Untrusted certificate: {0}")]
    UntrustedCertificate(String),

    /// No local identity exists for the requested seed identifier
    #[error("No identity for seed identifier {0:?}")]
    IdentityNotFound(String),

    /// A local identity could not be used
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// The seed identifier cannot be used as a TLS server name
    #[error("Invalid seed identifier {0:?}")]
    InvalidSeedIdentifier(String),

    /// PEM material could not be parsed
    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    /// The peer asked for plaintext and this side does not allow it
    #[error("Plaintext connections are not allowed")]
    PlaintextRefused,

    /// The peer sent an unknown protocol byte
    #[error("Unknown protocol mode {0}")]
    UnknownProtocol(u8),

    /// The TLS handshake failed for a reason other than trust
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// IO error from the underlying stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecurityError {
    /// Whether the same attempt could succeed if repeated unchanged
    ///
    /// Trust and identity failures recur deterministically until the
    /// configuration changes.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Tls(_))
    }
}

/// Mode selected by the producer's first byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolMode {
    Tls = 0,
    Plaintext = 1,
}

impl ProtocolMode {
    /// Write the mode byte
    pub async fn write_to(self, stream: &mut BoxedStream) -> Result<(), SecurityError> {
        stream.write_u8(self as u8).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read and validate the mode byte
    pub async fn read_from(stream: &mut BoxedStream) -> Result<Self, SecurityError> {
        match stream.read_u8().await? {
            0 => Ok(Self::Tls),
            1 => Ok(Self::Plaintext),
            other => Err(SecurityError::UnknownProtocol(other)),
        }
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls => write!(f, "tls"),
            Self::Plaintext => write!(f, "plaintext"),
        }
    }
}

/// Crypto backend shared by both roles
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// =============================================================================
// Key Material
// =============================================================================

/// A certificate chain and its private key
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }

    /// Parse a PEM certificate chain (leaf first) and PEM private key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, SecurityError> {
        let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SecurityError::InvalidPem(e.to_string()))?;
        if cert_chain.is_empty() {
            return Err(SecurityError::InvalidPem(
                "no certificate in identity chain".to_string(),
            ));
        }

        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| SecurityError::InvalidPem(e.to_string()))?
            .ok_or_else(|| SecurityError::InvalidPem("no private key found".to_string()))?;

        Ok(Self { cert_chain, key })
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("certificates", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// Resolves the identity a viewer presents for a seed identifier
///
/// Certificate storage and import live outside this crate; implementors
/// adapt whatever keystore the host uses.
pub trait IdentityProvider: Send + Sync {
    fn identity(&self, identifier: &str) -> Option<Identity>;
}

/// Identities held in memory
#[derive(Clone, Debug, Default)]
pub struct StaticIdentityProvider {
    identities: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_identity(mut self, identifier: impl Into<String>, identity: Identity) -> Self {
        self.insert(identifier, identity);
        self
    }

    pub fn insert(&mut self, identifier: impl Into<String>, identity: Identity) {
        self.identities.insert(identifier.into(), identity);
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn identity(&self, identifier: &str) -> Option<Identity> {
        self.identities.get(identifier).cloned()
    }
}

/// The root certificate a producer pins, with the identifier that selects
/// the matching viewer identity
#[derive(Clone, Debug)]
pub struct SeedCertificate {
    identifier: String,
    certificate: CertificateDer<'static>,
}

impl SeedCertificate {
    pub fn new(identifier: impl Into<String>, certificate: CertificateDer<'static>) -> Self {
        Self {
            identifier: identifier.into(),
            certificate,
        }
    }

    /// Use the first certificate in a PEM bundle
    pub fn from_pem(identifier: impl Into<String>, pem: &str) -> Result<Self, SecurityError> {
        let certificate = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .ok_or_else(|| SecurityError::MissingTrust("no certificate in seed PEM".to_string()))?
            .map_err(|e| SecurityError::InvalidPem(e.to_string()))?;
        Ok(Self::new(identifier, certificate))
    }

    pub fn from_pem_file(
        identifier: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self, SecurityError> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::MissingTrust(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_pem(identifier, &pem)
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }
}

// =============================================================================
// Role Traits
// =============================================================================

/// Producer side: secure an outbound stream to a viewer
#[async_trait]
pub trait ClientSecurity: Send + Sync {
    async fn secure(&self, stream: BoxedStream) -> Result<BoxedStream, SecurityError>;

    /// Seed identifier the producer expects viewers to present, if any
    fn seed_identifier(&self) -> Option<&str>;
}

/// A stream accepted and secured by a viewer
pub struct SecuredStream {
    pub stream: BoxedStream,
    pub mode: ProtocolMode,
    /// TLS server name the producer asked for
    pub server_name: Option<String>,
}

/// Viewer side: secure an inbound stream from a producer
#[async_trait]
pub trait ServerSecurity: Send + Sync {
    async fn accept(&self, stream: BoxedStream) -> Result<SecuredStream, SecurityError>;
}

/// Producer side without TLS, for development setups
///
/// Only viewers configured to allow plaintext will accept it.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaintextSecurity;

#[async_trait]
impl ClientSecurity for PlaintextSecurity {
    async fn secure(&self, mut stream: BoxedStream) -> Result<BoxedStream, SecurityError> {
        ProtocolMode::Plaintext.write_to(&mut stream).await?;
        Ok(stream)
    }

    fn seed_identifier(&self) -> Option<&str> {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::test_pki::TestCa;
    use super::*;

    #[test]
    fn test_identity_from_pem() {
        let ca = TestCa::new("seed");
        let (cert_pem, key_pem) = ca.issue_pem("viewer");

        let identity = Identity::from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
        assert_eq!(identity.clone().cert_chain, identity.cert_chain);
    }

    #[test]
    fn test_identity_without_key_is_rejected() {
        let ca = TestCa::new("seed");
        let (cert_pem, _) = ca.issue_pem("viewer");

        let result = Identity::from_pem(&cert_pem, "");
        assert!(matches!(result, Err(SecurityError::InvalidPem(_))));
    }

    #[test]
    fn test_seed_from_empty_pem_is_missing_trust() {
        let result = SeedCertificate::from_pem("seed", "");
        assert!(matches!(result, Err(SecurityError::MissingTrust(_))));
    }

    #[test]
    fn test_seed_from_pem() {
        let ca = TestCa::new("seed");
        let seed = SeedCertificate::from_pem("captainslog-seed", &ca.cert.pem()).unwrap();
        assert_eq!(seed.identifier(), "captainslog-seed");
        assert_eq!(seed.certificate(), ca.cert.der());
    }

    #[test]
    fn test_static_provider_lookup() {
        let ca = TestCa::new("seed");
        let provider = StaticIdentityProvider::new().with_identity("a", ca.issue("viewer"));
        assert!(provider.identity("a").is_some());
        assert!(provider.identity("b").is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SecurityError::Tls("reset".into()).is_transient());
        assert!(!SecurityError::UntrustedCertificate("x".into()).is_transient());
        assert!(!SecurityError::IdentityNotFound("x".into()).is_transient());
    }

    #[tokio::test]
    async fn test_protocol_byte_roundtrip() {
        let (a, b) = tokio::io::duplex(16);
        let mut reader: BoxedStream = Box::new(b);

        let writer = PlaintextSecurity.secure(Box::new(a)).await.unwrap();
        assert_eq!(
            ProtocolMode::read_from(&mut reader).await.unwrap(),
            ProtocolMode::Plaintext
        );
        drop(writer);
    }

    #[tokio::test]
    async fn test_unknown_protocol_byte() {
        let (mut a, b) = tokio::io::duplex(16);
        a.write_u8(7).await.unwrap();
        let mut reader: BoxedStream = Box::new(b);

        let result = ProtocolMode::read_from(&mut reader).await;
        assert!(matches!(result, Err(SecurityError::UnknownProtocol(7))));
    }
}
