//! Viewer-side TLS presenting a looked-up identity
//!
//! The viewer reads the producer's protocol byte, then the TLS ClientHello.
//! The server name in the hello is the producer's seed identifier; the
//! identity issued under that seed is fetched from the
//! [`IdentityProvider`] and presented. The viewer does not validate a
//! client chain: the producer is the side pinning trust.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use tokio_rustls::LazyConfigAcceptor;

use super::{
    crypto_provider, IdentityProvider, ProtocolMode, SecuredStream, SecurityError, ServerSecurity,
};
use crate::transport::BoxedStream;

/// TLS server that selects its certificate by seed identifier
pub struct IdentityPresentingSecurity {
    identities: Arc<dyn IdentityProvider>,
    provider: Arc<CryptoProvider>,
    allow_plaintext: bool,
    fallback_identifier: Option<String>,
}

impl IdentityPresentingSecurity {
    pub fn new(identities: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identities,
            provider: crypto_provider(),
            allow_plaintext: false,
            fallback_identifier: None,
        }
    }

    /// Accept producers that select plaintext
    #[must_use]
    pub fn allow_plaintext(mut self, allow: bool) -> Self {
        self.allow_plaintext = allow;
        self
    }

    /// Identifier used when a producer sends no server name
    #[must_use]
    pub fn with_fallback_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.fallback_identifier = Some(identifier.into());
        self
    }

    fn server_config(&self, identifier: &str) -> Result<Arc<ServerConfig>, SecurityError> {
        let identity = self
            .identities
            .identity(identifier)
            .ok_or_else(|| SecurityError::IdentityNotFound(identifier.to_string()))?;

        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| SecurityError::InvalidIdentity(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain, identity.key)
            .map_err(|e| SecurityError::InvalidIdentity(e.to_string()))?;

        Ok(Arc::new(config))
    }
}

fn handshake_error(err: std::io::Error) -> SecurityError {
    if err.kind() == std::io::ErrorKind::InvalidData {
        SecurityError::Tls(err.to_string())
    } else {
        SecurityError::Io(err)
    }
}

#[async_trait]
impl ServerSecurity for IdentityPresentingSecurity {
    async fn accept(&self, mut stream: BoxedStream) -> Result<SecuredStream, SecurityError> {
        let mode = ProtocolMode::read_from(&mut stream).await?;

        if mode == ProtocolMode::Plaintext {
            if !self.allow_plaintext {
                return Err(SecurityError::PlaintextRefused);
            }
            tracing::debug!("Accepted plaintext producer");
            return Ok(SecuredStream {
                stream,
                mode,
                server_name: None,
            });
        }

        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(handshake_error)?;

        let requested = start.client_hello().server_name().map(str::to_string);
        let identifier = requested
            .clone()
            .or_else(|| self.fallback_identifier.clone())
            .ok_or_else(|| SecurityError::IdentityNotFound("<no server name>".to_string()))?;

        let config = self.server_config(&identifier)?;
        let tls = start.into_stream(config).await.map_err(handshake_error)?;

        tracing::debug!(seed = %identifier, "Presented identity");
        Ok(SecuredStream {
            stream: Box::new(tls),
            mode,
            server_name: Some(identifier),
        })
    }
}

impl std::fmt::Debug for IdentityPresentingSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityPresentingSecurity")
            .field("allow_plaintext", &self.allow_plaintext)
            .field("fallback_identifier", &self.fallback_identifier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::test_pki::TestCa;
    use crate::security::{
        ClientSecurity, PinnedServerSecurity, PlaintextSecurity, StaticIdentityProvider,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SEED: &str = "captainslog-seed";

    fn viewer_security(ca: &TestCa) -> IdentityPresentingSecurity {
        let identities = StaticIdentityProvider::new().with_identity(SEED, ca.issue("viewer"));
        IdentityPresentingSecurity::new(Arc::new(identities))
    }

    #[tokio::test]
    async fn test_tls_roundtrip_with_pinned_seed() {
        let ca = TestCa::new("seed");
        let viewer = viewer_security(&ca);
        let producer = PinnedServerSecurity::new(ca.seed(SEED)).unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { viewer.accept(Box::new(b)).await });

        let mut client = producer.secure(Box::new(a)).await.unwrap();
        let mut secured = server.await.unwrap().unwrap();
        assert_eq!(secured.mode, ProtocolMode::Tls);
        assert_eq!(secured.server_name.as_deref(), Some(SEED));

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 5];
        secured.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_unknown_seed_identifier_is_identity_not_found() {
        let ca = TestCa::new("seed");
        let viewer = viewer_security(&ca);
        let producer = PinnedServerSecurity::new(ca.seed("other-seed")).unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { viewer.accept(Box::new(b)).await });

        let client = producer.secure(Box::new(a)).await;
        assert!(client.is_err());
        assert!(matches!(
            server.await.unwrap(),
            Err(SecurityError::IdentityNotFound(id)) if id == "other-seed"
        ));
    }

    #[tokio::test]
    async fn test_plaintext_refused_by_default() {
        let ca = TestCa::new("seed");
        let viewer = viewer_security(&ca);

        let (a, b) = tokio::io::duplex(1024);
        let _client = PlaintextSecurity.secure(Box::new(a)).await.unwrap();
        let result = viewer.accept(Box::new(b)).await;
        assert!(matches!(result, Err(SecurityError::PlaintextRefused)));
    }

    #[tokio::test]
    async fn test_plaintext_allowed_when_configured() {
        let ca = TestCa::new("seed");
        let viewer = viewer_security(&ca).allow_plaintext(true);

        let (a, b) = tokio::io::duplex(1024);
        let _client = PlaintextSecurity.secure(Box::new(a)).await.unwrap();
        let secured = viewer.accept(Box::new(b)).await.unwrap();
        assert_eq!(secured.mode, ProtocolMode::Plaintext);
        assert!(secured.server_name.is_none());
    }
}
