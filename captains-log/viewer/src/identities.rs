//! Identity Directory
//!
//! Viewer identities stored as PEM files, one subdirectory per seed
//! identifier:
//!
//! ```text
//! identities/
//! └── captainslog-seed/
//!     ├── cert.pem   (leaf first, then any intermediates)
//!     └── key.pem
//! ```
//!
//! Files are read on every lookup so identities can be rotated without a
//! restart.

use std::path::{Path, PathBuf};

use captains_log_core::{Identity, IdentityProvider};

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

/// [`IdentityProvider`] backed by a directory of PEM files
#[derive(Clone, Debug)]
pub struct PemDirectoryProvider {
    root: PathBuf,
}

impl PemDirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the identity for `identifier`
    ///
    /// `None` for identifiers that would escape the root. The identifier
    /// arrives as a TLS server name, so it is peer-controlled.
    pub fn identity_dir(&self, identifier: &str) -> Option<PathBuf> {
        let usable = !identifier.is_empty()
            && identifier != "."
            && identifier != ".."
            && !identifier.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
        usable.then(|| self.root.join(identifier))
    }

    /// Identifiers with both files present
    pub fn identifiers(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut found: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let dir = entry.path();
                dir.join(CERT_FILE).is_file() && dir.join(KEY_FILE).is_file()
            })
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        found.sort();
        found
    }

    fn load(&self, dir: &Path) -> Result<Identity, String> {
        let cert_pem = std::fs::read_to_string(dir.join(CERT_FILE))
            .map_err(|e| format!("{}: {e}", dir.join(CERT_FILE).display()))?;
        let key_pem = std::fs::read_to_string(dir.join(KEY_FILE))
            .map_err(|e| format!("{}: {e}", dir.join(KEY_FILE).display()))?;
        Identity::from_pem(&cert_pem, &key_pem).map_err(|e| e.to_string())
    }
}

impl IdentityProvider for PemDirectoryProvider {
    fn identity(&self, identifier: &str) -> Option<Identity> {
        let Some(dir) = self.identity_dir(identifier) else {
            tracing::warn!(identifier = %identifier, "Rejected identity lookup");
            return None;
        };

        match self.load(&dir) {
            Ok(identity) => Some(identity),
            Err(error) => {
                tracing::warn!(identifier = %identifier, error = %error, "Identity unavailable");
                None
            }
        }
    }
}
