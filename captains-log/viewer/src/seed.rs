//! Seed Generation
//!
//! Creates a self-signed seed certificate and one viewer identity issued by
//! it. The seed certificate ships with the producing application; the
//! identity stays with the viewer.
//!
//! # Layout
//!
//! ```text
//! <out>/seed.pem                         seed certificate (give to producers)
//! <out>/seed-key.pem                     seed signing key (keep offline)
//! <out>/identities/<identifier>/cert.pem viewer certificate
//! <out>/identities/<identifier>/key.pem  viewer private key
//! ```

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use thiserror::Error;

use crate::identities::{CERT_FILE, KEY_FILE};

pub const SEED_FILE: &str = "seed.pem";
pub const SEED_KEY_FILE: &str = "seed-key.pem";
pub const IDENTITIES_DIR: &str = "identities";

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("{path} already exists (use --force to replace it)")]
    AlreadyExists { path: PathBuf },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
}

#[derive(Clone, Debug)]
pub struct SeedOptions {
    pub out_dir: PathBuf,
    /// Seed identifier; also the seed's common name
    pub identifier: String,
    /// Common name of the viewer certificate
    pub viewer_name: String,
    /// Replace existing files
    pub force: bool,
}

impl SeedOptions {
    pub fn new(out_dir: impl Into<PathBuf>, identifier: impl Into<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            identifier: identifier.into(),
            viewer_name: "Captain's Log Viewer".to_string(),
            force: false,
        }
    }
}

/// Paths written by [`generate`]
#[derive(Clone, Debug)]
pub struct SeedFiles {
    pub seed_cert: PathBuf,
    pub seed_key: PathBuf,
    pub identity_dir: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl SeedFiles {
    fn under(out_dir: &Path, identifier: &str) -> Self {
        let identity_dir = out_dir.join(IDENTITIES_DIR);
        Self {
            seed_cert: out_dir.join(SEED_FILE),
            seed_key: out_dir.join(SEED_KEY_FILE),
            cert: identity_dir.join(identifier).join(CERT_FILE),
            key: identity_dir.join(identifier).join(KEY_FILE),
            identity_dir,
        }
    }
}

/// Generate a seed and a viewer identity issued by it
pub fn generate(options: &SeedOptions) -> Result<SeedFiles, SeedError> {
    let files = SeedFiles::under(&options.out_dir, &options.identifier);

    if !options.force {
        for path in [&files.seed_cert, &files.seed_key, &files.cert, &files.key] {
            if path.exists() {
                return Err(SeedError::AlreadyExists { path: path.clone() });
            }
        }
    }

    let seed_key = KeyPair::generate()?;
    let mut seed_params = CertificateParams::new(Vec::<String>::new())?;
    seed_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    seed_params
        .distinguished_name
        .push(DnType::CommonName, options.identifier.as_str());
    seed_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let seed_cert = seed_params.self_signed(&seed_key)?;

    let viewer_key = KeyPair::generate()?;
    let mut viewer_params = CertificateParams::new(vec![options.identifier.clone()])?;
    viewer_params
        .distinguished_name
        .push(DnType::CommonName, options.viewer_name.as_str());
    viewer_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    viewer_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let viewer_cert = viewer_params.signed_by(&viewer_key, &seed_cert, &seed_key)?;

    write_file(&files.seed_cert, &seed_cert.pem(), false)?;
    write_file(&files.seed_key, &seed_key.serialize_pem(), true)?;
    write_file(&files.cert, &viewer_cert.pem(), false)?;
    write_file(&files.key, &viewer_key.serialize_pem(), true)?;

    tracing::info!(
        identifier = %options.identifier,
        seed = %files.seed_cert.display(),
        identity = %files.cert.display(),
        "Seed generated"
    );

    Ok(files)
}

fn write_file(path: &Path, contents: &str, secret: bool) -> Result<(), SeedError> {
    let io_error = |source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(path, contents).map_err(io_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if secret {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_error)?;
        }
    }
    #[cfg(not(unix))]
    let _ = secret;

    Ok(())
}
