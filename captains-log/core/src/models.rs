//! Wire Model
//!
//! Messages exchanged between a producing application and a viewer. Every
//! type here is serialized as JSON inside a length-prefixed frame (see
//! [`crate::transport::frame`]).
//!
//! # Encoding Conventions
//!
//! - Field names are camelCase
//! - Dates are milliseconds since the Unix epoch
//! - Tagged unions are adjacently tagged: `{"kind": "log", "value": {...}}`
//!   for [`LogItemKind`], `{"type": "assigned", "value": "..."}` for
//!   [`LastItemId`]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Producer Identity
// =============================================================================

/// One running instance of the producing application
///
/// Created once at process start. The `id` identifies the producer across
/// reconnects and keys the viewer's resumption cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRun {
    /// Unique per run
    pub id: String,
    /// When the run started
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    /// Version string of the producing application
    pub application_version: String,
    /// Selects the TLS identity the viewer must present
    pub seed_identifier: String,
    /// The producing application
    pub application: Application,
    /// The device the application runs on
    pub device: Device,
}

impl ApplicationRun {
    /// Create a new run with a fresh id, dated now
    #[must_use]
    pub fn new(
        application: Application,
        device: Device,
        application_version: impl Into<String>,
        seed_identifier: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            date: Utc::now(),
            application_version: application_version.into(),
            seed_identifier: seed_identifier.into(),
            application,
            device,
        }
    }

    /// Replace the generated id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Application descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    /// Bundle/package identifier
    pub identifier: String,
}

/// Device descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub operating_system: OperatingSystem,
    pub system_version: String,
}

/// Operating system of the producing device
///
/// Unrecognized names decode as [`OperatingSystem::Unknown`] so newer
/// producers never break older viewers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperatingSystem {
    Ios,
    MacOs,
    Android,
    Linux,
    Unknown,
}

impl OperatingSystem {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "iOS",
            Self::MacOs => "macOS",
            Self::Android => "android",
            Self::Linux => "linux",
            Self::Unknown => "unknown",
        }
    }
}

impl From<String> for OperatingSystem {
    fn from(value: String) -> Self {
        match value.as_str() {
            "iOS" => Self::Ios,
            "macOS" => Self::MacOs,
            "android" => Self::Android,
            "linux" => Self::Linux,
            _ => Self::Unknown,
        }
    }
}

impl From<OperatingSystem> for String {
    fn from(value: OperatingSystem) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Viewer Identity
// =============================================================================

/// Identity of the consuming side, sent first in every handshake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogViewer {
    pub id: String,
    pub name: String,
}

impl LogViewer {
    /// Create a viewer identity with a fresh id
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
        }
    }
}

// =============================================================================
// Log Items
// =============================================================================

/// A single streamed event
///
/// The `id` is the ordering and resumption token. Items are immutable once
/// created; delivery order is the order they were passed to the producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogItem {
    pub id: String,
    pub kind: LogItemKind,
}

impl LogItem {
    /// Wrap a payload under a freshly generated id
    #[must_use]
    pub fn new(kind: LogItemKind) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind)
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>, kind: LogItemKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Shorthand for a log line item
    #[must_use]
    pub fn log(message: LogMessage) -> Self {
        Self::new(LogItemKind::Log(message))
    }

    /// Shorthand for a captured request item
    #[must_use]
    pub fn request(request: CapturedRequest) -> Self {
        Self::new(LogItemKind::Request(request))
    }

    /// Time the underlying event happened
    #[must_use]
    pub fn time(&self) -> DateTime<Utc> {
        match &self.kind {
            LogItemKind::Log(message) => message.time,
            LogItemKind::Request(request) => request.time,
        }
    }
}

/// Payload of a [`LogItem`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum LogItemKind {
    Log(LogMessage),
    Request(CapturedRequest),
}

/// Severity of a log line, encoded as an integer on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum LogLevel {
    Verbose = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Unknown = 5,
}

impl From<u8> for LogLevel {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Verbose,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warning,
            4 => Self::Error,
            _ => Self::Unknown,
        }
    }
}

impl From<LogLevel> for u8 {
    fn from(value: LogLevel) -> Self {
        value as u8
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Verbose => "VERBOSE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        };
        f.pad(label)
    }
}

/// A log line emitted by the producing application
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl LogMessage {
    /// A message timestamped now, without source location
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level,
            message: message.into(),
            thread: None,
            file: None,
            function: None,
            line: None,
        }
    }

    /// Attach source location
    #[must_use]
    pub fn at(mut self, file: impl Into<String>, function: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.function = Some(function.into());
        self.line = Some(line);
        self
    }

    #[must_use]
    pub fn on_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }
}

/// HTTP method of a captured request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Connect,
    Trace,
}

/// An HTTP exchange captured by the producing application
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
}

impl CapturedRequest {
    /// Time between the request and its response, if one arrived
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.response
            .as_ref()
            .map(|response| response.time - self.time)
    }
}

/// Response half of a [`CapturedRequest`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

// =============================================================================
// Resumption Cursor
// =============================================================================

/// Last item a viewer observed from a given producer run
///
/// Sent by the viewer at the end of the handshake. The producer replays
/// everything after the assigned id, or its whole buffer when the id is
/// unknown or unassigned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum LastItemId {
    #[default]
    Unassigned,
    Assigned(String),
}

impl LastItemId {
    #[must_use]
    pub fn assigned(&self) -> Option<&str> {
        match self {
            Self::Unassigned => None,
            Self::Assigned(id) => Some(id),
        }
    }
}

impl fmt::Display for LastItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unassigned => f.write_str("unassigned"),
            Self::Assigned(id) => write!(f, "assigned({id})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run() -> ApplicationRun {
        ApplicationRun {
            id: "app-1".to_string(),
            date: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            application_version: "2.1".to_string(),
            seed_identifier: "captainslog-seed".to_string(),
            application: Application {
                name: "Demo".to_string(),
                identifier: "com.example.demo".to_string(),
            },
            device: Device {
                id: "dev-1".to_string(),
                name: "Test Phone".to_string(),
                operating_system: OperatingSystem::Ios,
                system_version: "17.2".to_string(),
            },
        }
    }

    #[test]
    fn test_application_run_wire_shape() {
        let value = serde_json::to_value(run()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "app-1",
                "date": 1_700_000_000_123_i64,
                "applicationVersion": "2.1",
                "seedIdentifier": "captainslog-seed",
                "application": {"name": "Demo", "identifier": "com.example.demo"},
                "device": {
                    "id": "dev-1",
                    "name": "Test Phone",
                    "operatingSystem": "iOS",
                    "systemVersion": "17.2"
                }
            })
        );
    }

    #[test]
    fn test_unknown_operating_system_falls_back() {
        let mut value = serde_json::to_value(run()).unwrap();
        value["device"]["operatingSystem"] = json!("tvOS");

        let decoded: ApplicationRun = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.device.operating_system, OperatingSystem::Unknown);
    }

    #[test]
    fn test_log_item_is_adjacently_tagged() {
        let mut message = LogMessage::new(LogLevel::Warning, "disk almost full");
        message.time = Utc.timestamp_millis_opt(1_000).unwrap();
        let item = LogItem::with_id("7", LogItemKind::Log(message));

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "7",
                "kind": {
                    "kind": "log",
                    "value": {"time": 1000, "level": 3, "message": "disk almost full"}
                }
            })
        );
    }

    #[test]
    fn test_request_item_decodes() {
        let value = json!({
            "id": "r1",
            "kind": {
                "kind": "request",
                "value": {
                    "method": "POST",
                    "url": "https://example.com/api",
                    "headers": {"Accept": "application/json"},
                    "time": 2000,
                    "response": {"time": 2250, "code": 201, "headers": {}}
                }
            }
        });

        let item: LogItem = serde_json::from_value(value).unwrap();
        let LogItemKind::Request(request) = &item.kind else {
            panic!("expected request, got {:?}", item.kind);
        };
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.duration(), Some(chrono::Duration::milliseconds(250)));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_unknown_log_level_decodes_as_unknown() {
        let level: LogLevel = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(level, LogLevel::Unknown);
        assert!(LogLevel::Error > LogLevel::Info);
    }

    #[test]
    fn test_last_item_id_wire_shape() {
        assert_eq!(
            serde_json::to_value(LastItemId::Unassigned).unwrap(),
            json!({"type": "unassigned"})
        );
        assert_eq!(
            serde_json::to_value(LastItemId::Assigned("2".into())).unwrap(),
            json!({"type": "assigned", "value": "2"})
        );

        let decoded: LastItemId =
            serde_json::from_value(json!({"type": "assigned", "value": "i6"})).unwrap();
        assert_eq!(decoded.assigned(), Some("i6"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = LogItem::log(LogMessage::new(LogLevel::Info, "a"));
        let b = LogItem::log(LogMessage::new(LogLevel::Info, "b"));
        assert_ne!(a.id, b.id);
        assert_ne!(LogViewer::new("x").id, LogViewer::new("x").id);
    }
}
