//! Viewer Loop
//!
//! Runs a [`CaptainsLogServer`] until shutdown and prints what it receives.
//! Each item is printed as one line, either human-readable or as the JSON
//! wire form of the item together with its producer.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use captains_log_core::{
    ApplicationRun, CaptainsLogConfig, CaptainsLogServer, DiscoveryBackend,
    IdentityPresentingSecurity, IdentityProvider, LogItem, LogItemKind, MdnsDirectory,
    ServerEvent,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::identities::PemDirectoryProvider;

/// How items are written to stdout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct JsonLine<'a> {
    producer: &'a str,
    application: Option<&'a str>,
    item: &'a LogItem,
}

/// Formats items for one output stream, remembering producer names
pub struct ItemPrinter {
    format: OutputFormat,
    runs: HashMap<String, ApplicationRun>,
}

impl ItemPrinter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            runs: HashMap::new(),
        }
    }

    pub fn remember(&mut self, run: ApplicationRun) {
        self.runs.insert(run.id.clone(), run);
    }

    fn application(&self, producer_id: &str) -> Option<&str> {
        self.runs
            .get(producer_id)
            .map(|run| run.application.name.as_str())
    }

    /// One output line for an item
    pub fn format(&self, producer_id: &str, item: &LogItem) -> Result<String> {
        match self.format {
            OutputFormat::Json => {
                let line = JsonLine {
                    producer: producer_id,
                    application: self.application(producer_id),
                    item,
                };
                serde_json::to_string(&line).context("Failed to encode item")
            }
            OutputFormat::Text => {
                let source = self.application(producer_id).unwrap_or(producer_id);
                let time = item.time().format("%H:%M:%S%.3f");
                let body = match &item.kind {
                    LogItemKind::Log(message) => {
                        let mut line = format!("{:<7} ", message.level);
                        if let Some(thread) = &message.thread {
                            line.push_str(&format!("<{thread}> "));
                        }
                        line.push_str(&message.message);
                        if let (Some(file), Some(number)) = (&message.file, message.line) {
                            line.push_str(&format!(" ({file}:{number})"));
                        }
                        line
                    }
                    LogItemKind::Request(request) => {
                        let status = request
                            .response
                            .as_ref()
                            .map_or_else(|| "...".to_string(), |r| r.code.to_string());
                        let elapsed = request
                            .duration()
                            .map(|d| format!(" {}ms", d.num_milliseconds()))
                            .unwrap_or_default();
                        format!("{:?} {} -> {status}{elapsed}", request.method, request.url)
                    }
                };
                Ok(format!("{time} [{source}] {body}"))
            }
        }
    }
}

/// Advertise the viewer and print items until `shutdown` flips
pub async fn run(
    config: &CaptainsLogConfig,
    format: OutputFormat,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if config.transport.discovery == DiscoveryBackend::Memory {
        anyhow::bail!("In-process discovery is only available to embedded viewers; use mdns");
    }

    let identity_dir = config
        .identity_dir
        .clone()
        .context("No identity directory configured (set security.identity_dir)")?;
    let identities = PemDirectoryProvider::new(identity_dir);
    if identities.identity(&config.identifier).is_none() {
        warn!(
            identifier = %config.identifier,
            dir = %identities.root().display(),
            available = ?identities.identifiers(),
            "No identity for the configured seed; run `captains-log-viewer seed` first"
        );
    }

    let security = IdentityPresentingSecurity::new(Arc::new(identities))
        .allow_plaintext(config.transport.allow_plaintext)
        .with_fallback_identifier(config.identifier.clone());

    let directory = MdnsDirectory::new().context("Failed to start mDNS")?;
    let (server, events) =
        CaptainsLogServer::start(&directory, Arc::new(security), config.server_config())
            .await
            .context("Failed to advertise viewer")?;

    info!(service = %server.fullname(), port = server.port(), "Viewer ready");

    let mut printer = ItemPrinter::new(format);
    let result = tokio::select! {
        result = print_events(events, &mut printer) => result,
        _ = shutdown.changed() => Ok(()),
    };

    server.shutdown().await;
    directory.shutdown();
    result
}

async fn print_events(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    printer: &mut ItemPrinter,
) -> Result<()> {
    let stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::ConnectionEstablished { connection, run } => {
                info!(
                    conn_id = %connection,
                    producer = %run.id,
                    application = %run.application.name,
                    device = %run.device.name,
                    version = %run.application_version,
                    "Producer connected"
                );
                printer.remember(run);
            }
            ServerEvent::ItemReceived { producer_id, item } => {
                let line = printer.format(&producer_id, &item)?;
                let mut out = stdout.lock();
                writeln!(out, "{line}").context("Failed to write to stdout")?;
            }
            ServerEvent::ConnectionLost {
                producer_id,
                connection,
                reason,
            } => {
                info!(conn_id = %connection, producer = %producer_id, reason = %reason, "Producer disconnected");
            }
            ServerEvent::ConnectionFailed { peer, error } => {
                warn!(peer = ?peer, error = %error, "Inbound connection failed");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use captains_log_core::{Application, Device, LogLevel, LogMessage, OperatingSystem};
    use pretty_assertions::assert_eq;

    fn sample_run() -> ApplicationRun {
        ApplicationRun::new(
            Application {
                name: "Sampler".to_string(),
                identifier: "com.example.sampler".to_string(),
            },
            Device {
                id: "device-1".to_string(),
                name: "Test Phone".to_string(),
                operating_system: OperatingSystem::Ios,
                system_version: "17.0".to_string(),
            },
            "1.0",
            "captainslog-seed",
        )
        .with_id("app-1")
    }

    fn item() -> LogItem {
        LogItem::with_id(
            "7",
            LogItemKind::Log(LogMessage::new(LogLevel::Warning, "disk almost full").at(
                "store.rs",
                "save",
                42,
            )),
        )
    }

    #[test]
    fn test_text_line_uses_application_name() {
        let mut printer = ItemPrinter::new(OutputFormat::Text);
        printer.remember(sample_run());

        let line = printer.format("app-1", &item()).unwrap();
        assert!(line.contains("[Sampler] WARNING disk almost full (store.rs:42)"));
    }

    #[test]
    fn test_text_line_shows_thread() {
        let printer = ItemPrinter::new(OutputFormat::Text);
        let message = LogMessage::new(LogLevel::Info, "synced").on_thread("worker-2");
        let line = printer
            .format("app-1", &LogItem::with_id("8", LogItemKind::Log(message)))
            .unwrap();
        assert!(line.ends_with("INFO    <worker-2> synced"), "{line}");
    }

    #[test]
    fn test_text_line_falls_back_to_producer_id() {
        let printer = ItemPrinter::new(OutputFormat::Text);
        let line = printer.format("app-9", &item()).unwrap();
        assert!(line.contains("[app-9]"));
    }

    #[test]
    fn test_json_line_embeds_wire_item() {
        let mut printer = ItemPrinter::new(OutputFormat::Json);
        printer.remember(sample_run());

        let line = printer.format("app-1", &item()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["producer"], "app-1");
        assert_eq!(value["application"], "Sampler");
        assert_eq!(value["item"]["id"], "7");
        assert_eq!(value["item"]["kind"]["kind"], "log");
    }
}
