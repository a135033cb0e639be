//! Transport Configuration
//!
//! Settings shared by both roles: which discovery backend to use, what to
//! browse or advertise, and the timing knobs of a link.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::{DEFAULT_DOMAIN, DEFAULT_PORT, DEFAULT_SERVICE_TYPE};
use crate::retry::RetryBehavior;

/// Discovery backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryBackend {
    /// Multicast DNS on the local network
    #[default]
    Mdns,

    /// In-process registry (embedded mode)
    ///
    /// Producer and viewer must share the same `MemoryDirectory`.
    Memory,
}

/// Transport configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Which discovery backend to use
    pub discovery: DiscoveryBackend,

    /// Service type, e.g. `_captainslog-server._tcp`
    pub service_type: String,

    /// Discovery domain
    pub domain: String,

    /// Viewer listening port (0 = pick a free port)
    pub port: u16,

    /// Accept producers that skip TLS
    ///
    /// Viewer side only. Intended for development setups.
    pub allow_plaintext: bool,

    /// Handshake timeout in milliseconds (0 = wait until ready)
    pub handshake_timeout_ms: u64,

    /// Per-frame write timeout in milliseconds (0 = no timeout)
    pub write_timeout_ms: u64,

    /// Reconnection attempts after the first failure
    pub reconnect_attempts: u32,

    /// Delay before the first reconnection attempt in milliseconds
    ///
    /// Doubles with each further attempt.
    pub reconnect_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryBackend::default(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            port: DEFAULT_PORT,
            allow_plaintext: false,
            handshake_timeout_ms: 0,
            write_timeout_ms: 0,
            reconnect_attempts: 10,
            reconnect_delay_ms: 100,
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TransportConfig {
    /// Configuration for embedded (in-process) mode
    pub fn embedded() -> Self {
        Self {
            discovery: DiscoveryBackend::Memory,
            port: 0,
            ..Default::default()
        }
    }

    /// Check if this is an in-process (embedded) configuration
    pub fn is_embedded(&self) -> bool {
        self.discovery == DiscoveryBackend::Memory
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.write_timeout_ms)
    }

    /// Backoff applied to whole connection attempts
    pub fn reconnect_policy(&self) -> RetryBehavior {
        RetryBehavior::new(
            self.reconnect_attempts,
            Duration::from_millis(self.reconnect_delay_ms),
        )
    }
}
