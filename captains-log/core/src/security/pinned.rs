//! Producer-side TLS with a pinned root
//!
//! The producer accepts a viewer only if the viewer's chain is rooted at the
//! seed certificate shipped with the application. No platform roots are
//! consulted and no client certificate is sent.
//!
//! Host name policy is not applied: viewers are found by discovery, not by
//! name, so a chain that validates up to the seed (the "unspecified" trust
//! result) is sufficient. Any other outcome fails with
//! [`SecurityError::UntrustedCertificate`].

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use super::{crypto_provider, ClientSecurity, ProtocolMode, SecurityError, SeedCertificate};
use crate::transport::BoxedStream;

/// Validates the peer chain against the seed certificate only
#[derive(Debug)]
struct PinnedRootVerifier {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
}

impl PinnedRootVerifier {
    fn new(seed: &SeedCertificate, provider: Arc<CryptoProvider>) -> Result<Self, SecurityError> {
        let mut roots = RootCertStore::empty();
        roots
            .add(seed.certificate().clone())
            .map_err(|e| SecurityError::TrustEvaluationFailed(format!("unusable seed: {e}")))?;
        Ok(Self { roots, provider })
    }
}

impl ServerCertVerifier for PinnedRootVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS client that trusts only the pinned seed certificate
pub struct PinnedServerSecurity {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    seed: SeedCertificate,
}

impl PinnedServerSecurity {
    /// Build from the seed shipped with the application
    ///
    /// The seed identifier is sent as the TLS server name so the viewer can
    /// pick the matching identity; it must therefore be a valid DNS name.
    pub fn new(seed: SeedCertificate) -> Result<Self, SecurityError> {
        let provider = crypto_provider();
        let verifier = PinnedRootVerifier::new(&seed, Arc::clone(&provider))?;

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| SecurityError::TrustEvaluationFailed(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        let server_name = ServerName::try_from(seed.identifier().to_string())
            .map_err(|_| SecurityError::InvalidSeedIdentifier(seed.identifier().to_string()))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
            seed,
        })
    }
}

/// Map a failed TLS handshake onto the security taxonomy
fn classify_handshake_error(err: std::io::Error) -> SecurityError {
    let rustls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match rustls_error {
        Some(rustls::Error::InvalidCertificate(reason)) => {
            SecurityError::UntrustedCertificate(format!("{reason:?}"))
        }
        Some(rustls::Error::NoCertificatesPresented) => {
            SecurityError::MissingTrust("viewer presented no certificate".to_string())
        }
        Some(other) => SecurityError::Tls(other.to_string()),
        None if err.kind() == std::io::ErrorKind::InvalidData => {
            SecurityError::Tls(err.to_string())
        }
        None => SecurityError::Io(err),
    }
}

#[async_trait]
impl ClientSecurity for PinnedServerSecurity {
    async fn secure(&self, mut stream: BoxedStream) -> Result<BoxedStream, SecurityError> {
        ProtocolMode::Tls.write_to(&mut stream).await?;

        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(classify_handshake_error)?;

        tracing::debug!(seed = %self.seed.identifier(), "Viewer certificate trusted");
        Ok(Box::new(tls))
    }

    fn seed_identifier(&self) -> Option<&str> {
        Some(self.seed.identifier())
    }
}

impl std::fmt::Debug for PinnedServerSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedServerSecurity")
            .field("seed", &self.seed.identifier())
            .finish_non_exhaustive()
    }
}
