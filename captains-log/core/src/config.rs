//! TOML Configuration File Support
//!
//! Configuration for hosts embedding Captain's Log, from a TOML file at
//! `~/.config/captains-log/viewer.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [service]
//! name = "Desk"
//! type = "_captainslog-server._tcp"
//! domain = "local"
//! port = 1111
//! discovery = "mdns"
//!
//! [security]
//! identifier = "captainslog-seed"
//! identity_dir = "/home/me/.config/captains-log/identities"
//! allow_plaintext = false
//!
//! [retry]
//! reconnect_attempts = 10
//! reconnect_delay_ms = 100
//! handshake_timeout_ms = 0
//! write_timeout_ms = 0
//!
//! [history]
//! max_items = 10000
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::producer::{ProducerConfig, DEFAULT_MAX_HISTORY};
use crate::security::{SecurityError, SeedCertificate};
use crate::server::ServerConfig;
use crate::transport::{DiscoveryBackend, TransportConfig};

/// Seed identifier used when none is configured
pub const DEFAULT_IDENTIFIER: &str = "captainslog-seed";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Service section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceToml {
    /// Advertised viewer name
    pub name: Option<String>,

    /// Service type to advertise and browse
    #[serde(rename = "type")]
    pub service_type: Option<String>,

    /// Discovery domain
    pub domain: Option<String>,

    /// Viewer listening port
    pub port: Option<u16>,

    /// Discovery backend ("mdns" or "memory")
    pub discovery: Option<DiscoveryBackend>,
}

/// Security section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityToml {
    /// Seed identifier advertised and used to select identities
    pub identifier: Option<String>,

    /// Directory of `<identifier>/cert.pem` + `key.pem` identities
    pub identity_dir: Option<PathBuf>,

    /// Seed certificate pinned by producers
    pub seed_certificate: Option<PathBuf>,

    /// Accept producers that skip TLS
    pub allow_plaintext: Option<bool>,
}

/// Retry section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Reconnection attempts after the first failure
    pub reconnect_attempts: Option<u32>,

    /// Initial reconnection delay in milliseconds
    pub reconnect_delay_ms: Option<u64>,

    /// Handshake timeout in milliseconds (0 = none)
    pub handshake_timeout_ms: Option<u64>,

    /// Frame write timeout in milliseconds (0 = none)
    pub write_timeout_ms: Option<u64>,
}

/// History section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryToml {
    /// Items a producer keeps for replay
    pub max_items: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptainsLogToml {
    pub service: ServiceToml,
    pub security: SecurityToml,
    pub retry: RetryToml,
    pub history: HistoryToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Consolidated configuration with its origin
#[derive(Clone, Debug)]
pub struct CaptainsLogConfig {
    /// Discovery and link settings
    pub transport: TransportConfig,

    /// Advertised viewer name
    pub name: String,

    /// Seed identifier
    pub identifier: String,

    /// Directory holding viewer identities
    pub identity_dir: Option<PathBuf>,

    /// Seed certificate pinned by producers
    pub seed_certificate: Option<PathBuf>,

    /// Items a producer keeps for replay
    pub max_history: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim_end_matches(".local").to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "Captain's Log".to_string())
}

impl Default for CaptainsLogConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            name: default_name(),
            identifier: DEFAULT_IDENTIFIER.to_string(),
            identity_dir: default_identity_dir(),
            seed_certificate: None,
            max_history: DEFAULT_MAX_HISTORY,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl CaptainsLogConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check values that would only fail later, at connect time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service name must not be empty".to_string(),
            ));
        }
        if self.identifier.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "seed identifier must not be empty".to_string(),
            ));
        }
        if !self.transport.service_type.starts_with('_') {
            return Err(ConfigError::ValidationError(format!(
                "service type {:?} must start with '_'",
                self.transport.service_type
            )));
        }
        if self.max_history == 0 {
            return Err(ConfigError::ValidationError(
                "history.max_items must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::from_transport(&self.name, &self.identifier, &self.transport)
    }

    /// Seed certificate a producer pins, when one is configured
    pub fn load_seed(&self) -> Result<Option<SeedCertificate>, SecurityError> {
        self.seed_certificate
            .as_ref()
            .map(|path| SeedCertificate::from_pem_file(&self.identifier, path))
            .transpose()
    }

    #[must_use]
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            max_history: self.max_history,
            ..ProducerConfig::from_transport(&self.transport)
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/captains-log/viewer.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("captains-log").join("viewer.toml"))
}

/// Default identity directory, `$XDG_CONFIG_HOME/captains-log/identities`
#[must_use]
pub fn default_identity_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("captains-log").join("identities"))
}

/// Load configuration from the default path, then the environment
///
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<CaptainsLogConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<CaptainsLogConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

fn load_config_with_env<F>(
    path: Option<PathBuf>,
    lookup: F,
) -> Result<CaptainsLogConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = CaptainsLogConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: CaptainsLogToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, lookup);

    Ok(config)
}

fn apply_toml_config(config: &mut CaptainsLogConfig, toml: &CaptainsLogToml) {
    // Service settings
    if let Some(ref name) = toml.service.name {
        config.name = name.clone();
    }
    if let Some(ref service_type) = toml.service.service_type {
        config.transport.service_type = service_type.clone();
    }
    if let Some(ref domain) = toml.service.domain {
        config.transport.domain = domain.clone();
    }
    if let Some(port) = toml.service.port {
        config.transport.port = port;
    }
    if let Some(discovery) = toml.service.discovery {
        config.transport.discovery = discovery;
    }

    // Security settings
    if let Some(ref identifier) = toml.security.identifier {
        config.identifier = identifier.clone();
    }
    if toml.security.identity_dir.is_some() {
        config.identity_dir = toml.security.identity_dir.clone();
    }
    if toml.security.seed_certificate.is_some() {
        config.seed_certificate = toml.security.seed_certificate.clone();
    }
    if let Some(allow) = toml.security.allow_plaintext {
        config.transport.allow_plaintext = allow;
    }

    // Retry settings
    if let Some(attempts) = toml.retry.reconnect_attempts {
        config.transport.reconnect_attempts = attempts;
    }
    if let Some(delay) = toml.retry.reconnect_delay_ms {
        config.transport.reconnect_delay_ms = delay;
    }
    if let Some(timeout) = toml.retry.handshake_timeout_ms {
        config.transport.handshake_timeout_ms = timeout;
    }
    if let Some(timeout) = toml.retry.write_timeout_ms {
        config.transport.write_timeout_ms = timeout;
    }

    // History settings
    if let Some(max_items) = toml.history.max_items {
        config.max_history = max_items;
    }
}

/// Environment variables read by [`load_config`]
const ENV_VARS: &[&str] = &[
    "CAPTAINS_LOG_NAME",
    "CAPTAINS_LOG_IDENTIFIER",
    "CAPTAINS_LOG_IDENTITY_DIR",
    "CAPTAINS_LOG_SEED",
    "CAPTAINS_LOG_DISCOVERY",
    "CAPTAINS_LOG_SERVICE_TYPE",
    "CAPTAINS_LOG_DOMAIN",
    "CAPTAINS_LOG_PORT",
    "CAPTAINS_LOG_ALLOW_PLAINTEXT",
    "CAPTAINS_LOG_HANDSHAKE_TIMEOUT",
    "CAPTAINS_LOG_WRITE_TIMEOUT",
    "CAPTAINS_LOG_RECONNECT_ATTEMPTS",
    "CAPTAINS_LOG_RECONNECT_DELAY",
    "CAPTAINS_LOG_MAX_HISTORY",
];

fn parse_discovery(value: &str) -> Option<DiscoveryBackend> {
    match value.to_lowercase().as_str() {
        "memory" | "embedded" => Some(DiscoveryBackend::Memory),
        "mdns" | "bonjour" => Some(DiscoveryBackend::Mdns),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value, "Ignoring unparseable environment value");
    }
    parsed
}

/// Apply `CAPTAINS_LOG_*` values obtained through `lookup`
fn apply_env_config<F>(config: &mut CaptainsLogConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if ENV_VARS.iter().any(|key| lookup(key).is_some()) {
        config.source = ConfigSource::Env;
    }

    if let Some(name) = lookup("CAPTAINS_LOG_NAME") {
        config.name = name;
    }
    if let Some(identifier) = lookup("CAPTAINS_LOG_IDENTIFIER") {
        config.identifier = identifier;
    }
    if let Some(dir) = lookup("CAPTAINS_LOG_IDENTITY_DIR") {
        config.identity_dir = Some(PathBuf::from(dir));
    }
    if let Some(path) = lookup("CAPTAINS_LOG_SEED") {
        config.seed_certificate = Some(PathBuf::from(path));
    }
    if let Some(discovery) = lookup("CAPTAINS_LOG_DISCOVERY") {
        match parse_discovery(&discovery) {
            Some(backend) => config.transport.discovery = backend,
            None => tracing::warn!(value = %discovery, "Unknown discovery backend"),
        }
    }
    if let Some(service_type) = lookup("CAPTAINS_LOG_SERVICE_TYPE") {
        config.transport.service_type = service_type;
    }
    if let Some(domain) = lookup("CAPTAINS_LOG_DOMAIN") {
        config.transport.domain = domain;
    }
    if let Some(port) = lookup("CAPTAINS_LOG_PORT") {
        if let Some(p) = parse_env("CAPTAINS_LOG_PORT", &port) {
            config.transport.port = p;
        }
    }
    if let Some(allow) = lookup("CAPTAINS_LOG_ALLOW_PLAINTEXT") {
        config.transport.allow_plaintext = allow == "1" || allow.eq_ignore_ascii_case("true");
    }
    if let Some(timeout) = lookup("CAPTAINS_LOG_HANDSHAKE_TIMEOUT") {
        if let Some(ms) = parse_env("CAPTAINS_LOG_HANDSHAKE_TIMEOUT", &timeout) {
            config.transport.handshake_timeout_ms = ms;
        }
    }
    if let Some(timeout) = lookup("CAPTAINS_LOG_WRITE_TIMEOUT") {
        if let Some(ms) = parse_env("CAPTAINS_LOG_WRITE_TIMEOUT", &timeout) {
            config.transport.write_timeout_ms = ms;
        }
    }
    if let Some(attempts) = lookup("CAPTAINS_LOG_RECONNECT_ATTEMPTS") {
        if let Some(n) = parse_env("CAPTAINS_LOG_RECONNECT_ATTEMPTS", &attempts) {
            config.transport.reconnect_attempts = n;
        }
    }
    if let Some(delay) = lookup("CAPTAINS_LOG_RECONNECT_DELAY") {
        if let Some(ms) = parse_env("CAPTAINS_LOG_RECONNECT_DELAY", &delay) {
            config.transport.reconnect_delay_ms = ms;
        }
    }
    if let Some(max_items) = lookup("CAPTAINS_LOG_MAX_HISTORY") {
        if let Some(n) = parse_env("CAPTAINS_LOG_MAX_HISTORY", &max_items) {
            config.max_history = n;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub identifier: Option<String>,
    pub identity_dir: Option<PathBuf>,
    pub allow_plaintext: Option<bool>,
}

impl ConfigOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: String) -> Self {
        self.identifier = Some(identifier);
        self
    }

    #[must_use]
    pub fn with_identity_dir(mut self, dir: PathBuf) -> Self {
        self.identity_dir = Some(dir);
        self
    }

    #[must_use]
    pub fn with_allow_plaintext(mut self, allow: bool) -> Self {
        self.allow_plaintext = Some(allow);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut CaptainsLogConfig) {
        if self.name.is_some()
            || self.port.is_some()
            || self.identifier.is_some()
            || self.identity_dir.is_some()
            || self.allow_plaintext.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref name) = self.name {
            config.name = name.clone();
        }
        if let Some(port) = self.port {
            config.transport.port = port;
        }
        if let Some(ref identifier) = self.identifier {
            config.identifier = identifier.clone();
        }
        if let Some(ref dir) = self.identity_dir {
            config.identity_dir = Some(dir.clone());
        }
        if let Some(allow) = self.allow_plaintext {
            config.transport.allow_plaintext = allow;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    use std::collections::HashMap;

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CaptainsLogConfig::default();

        assert_eq!(config.identifier, DEFAULT_IDENTIFIER);
        assert_eq!(config.max_history, 10_000);
        assert_eq!(config.transport.port, 1111);
        assert!(!config.transport.allow_plaintext);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "Desk"
port = 2222

[security]
identifier = "team-seed"
allow_plaintext = true

[retry]
reconnect_attempts = 4
handshake_timeout_ms = 1500

[history]
max_items = 50
"#
        )
        .unwrap();

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.name, "Desk");
        assert_eq!(config.transport.port, 2222);
        assert_eq!(config.identifier, "team-seed");
        assert!(config.transport.allow_plaintext);
        assert_eq!(config.transport.reconnect_attempts, 4);
        assert_eq!(config.max_history, 50);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));

        let server = config.server_config();
        assert_eq!(server.name, "Desk");
        assert_eq!(server.handshake_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.producer_config().max_history, 50);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_with_env(Some(dir.path().join("absent.toml")), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[service\nname = ").unwrap();
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[service]\nname = \"Desk\"\ndomain = \"lan\"\nport = 2222").unwrap();

        let env = env_of(&[
            ("CAPTAINS_LOG_DISCOVERY", "Memory"),
            ("CAPTAINS_LOG_DOMAIN", "office"),
            ("CAPTAINS_LOG_PORT", "3333"),
            ("CAPTAINS_LOG_WRITE_TIMEOUT", "750"),
            ("CAPTAINS_LOG_RECONNECT_DELAY", "40"),
            ("CAPTAINS_LOG_RECONNECT_ATTEMPTS", "2"),
        ]);
        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.name, "Desk");
        assert_eq!(config.transport.discovery, DiscoveryBackend::Memory);
        assert_eq!(config.transport.domain, "office");
        assert_eq!(config.transport.port, 3333);
        assert_eq!(config.transport.write_timeout(), Some(Duration::from_millis(750)));
        assert_eq!(
            config.transport.reconnect_policy(),
            crate::retry::RetryBehavior::new(2, Duration::from_millis(40))
        );
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let env = env_of(&[
            ("CAPTAINS_LOG_DISCOVERY", "carrier-pigeon"),
            ("CAPTAINS_LOG_PORT", "eleven"),
            ("CAPTAINS_LOG_WRITE_TIMEOUT", "-5"),
        ]);
        let config = load_config_with_env(None, env).unwrap();

        let defaults = TransportConfig::default();
        assert_eq!(config.transport.discovery, defaults.discovery);
        assert_eq!(config.transport.port, defaults.port);
        assert_eq!(config.transport.write_timeout_ms, 0);
    }

    #[test]
    fn test_overrides_win() {
        let mut config = CaptainsLogConfig::default();
        ConfigOverrides::new()
            .with_name("Laptop".to_string())
            .with_port(0)
            .with_allow_plaintext(true)
            .apply(&mut config);

        assert_eq!(config.name, "Laptop");
        assert_eq!(config.transport.port, 0);
        assert!(config.transport.allow_plaintext);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_missing_seed_file_is_missing_trust() {
        let mut config = CaptainsLogConfig::default();
        assert!(config.load_seed().unwrap().is_none());

        let dir = tempfile::tempdir().unwrap();
        config.seed_certificate = Some(dir.path().join("seed.pem"));
        assert!(matches!(config.load_seed(), Err(SecurityError::MissingTrust(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = CaptainsLogConfig::default();
        config.transport.service_type = "captainslog._tcp".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = CaptainsLogConfig::default();
        config.max_history = 0;
        assert!(config.validate().is_err());
    }
}
