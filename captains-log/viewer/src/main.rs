//! Captain's Log Viewer - LAN log viewer daemon
//!
//! Advertises a viewer on the local network and prints log items streamed by
//! producing applications that trust its seed.
//!
//! # Usage
//!
//! ```bash
//! # Create a seed and a viewer identity (once)
//! captains-log-viewer seed
//!
//! # Start with defaults from ~/.config/captains-log/viewer.toml
//! captains-log-viewer
//!
//! # Custom name, JSON lines on stdout
//! captains-log-viewer run --name "Desk" --json
//!
//! # Verbose logging
//! RUST_LOG=debug captains-log-viewer
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (withdraws the advertisement)

mod identities;
mod seed;
mod viewer;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use captains_log_core::config::{load_config_from_path, ConfigOverrides};
use captains_log_core::{CaptainsLogConfig, ConfigSource};

use crate::seed::{SeedOptions, IDENTITIES_DIR};
use crate::viewer::OutputFormat;

/// Captain's Log Viewer - Stream app logs over the LAN
#[derive(Parser, Debug)]
#[command(name = "captains-log-viewer")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Advertise the viewer and print received items (default)
    Run(RunArgs),

    /// Generate a seed certificate and a viewer identity
    Seed(SeedArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CAPTAINS_LOG_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Advertised viewer name
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Listening port (0 picks a free port)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Seed identifier whose identity is presented
    #[arg(short = 'i', long)]
    identifier: Option<String>,

    /// Directory of viewer identities
    #[arg(long, value_name = "DIR")]
    identity_dir: Option<PathBuf>,

    /// Accept producers that do not use TLS
    #[arg(long)]
    allow_plaintext: bool,

    /// Print items as JSON lines
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CAPTAINS_LOG_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Args, Debug)]
struct SeedArgs {
    /// Output directory (defaults to the configuration directory)
    #[arg(short = 'o', long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Seed identifier
    #[arg(short = 'i', long, default_value = captains_log_core::config::DEFAULT_IDENTIFIER)]
    identifier: String,

    /// Common name of the viewer certificate
    #[arg(long, default_value = "Captain's Log Viewer")]
    viewer_name: String,

    /// Replace existing files
    #[arg(short = 'f', long)]
    force: bool,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref name) = self.name {
            overrides = overrides.with_name(name.clone());
        }
        if let Some(port) = self.port {
            overrides = overrides.with_port(port);
        }
        if let Some(ref identifier) = self.identifier {
            overrides = overrides.with_identifier(identifier.clone());
        }
        if let Some(ref dir) = self.identity_dir {
            overrides = overrides.with_identity_dir(dir.clone());
        }
        if self.allow_plaintext {
            overrides = overrides.with_allow_plaintext(true);
        }
        overrides
    }

    fn load(&self) -> Result<CaptainsLogConfig> {
        let path = self
            .config
            .clone()
            .or_else(captains_log_core::config::default_config_path);
        let mut config = load_config_from_path(path).context("Failed to load configuration")?;
        self.overrides().apply(&mut config);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "captains_log_viewer={level},captains_log_core={level}"
        ))
    });

    // stdout carries the items
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Flip the returned watch on SIGINT or SIGTERM
fn shutdown_signal() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating shutdown"),
            }
            let _ = tx.send(true);
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, initiating shutdown");
            }
            let _ = tx.send(true);
        });
    }

    Ok(rx)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.load()?;

    info!("Captain's Log viewer starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        name = %config.name,
        identifier = %config.identifier,
        port = config.transport.port,
        source = %config.source(),
        "Configuration"
    );
    if config.source() == ConfigSource::Default {
        info!("No configuration file found, using defaults");
    }
    if config.transport.allow_plaintext {
        info!("Plaintext producers are accepted");
    }

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let shutdown = shutdown_signal()?;
    let result = viewer::run(&config, format, shutdown).await;

    match result {
        Ok(()) => {
            info!("Viewer stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Viewer stopped with error");
            Err(e)
        }
    }
}

fn seed(args: SeedArgs) -> Result<()> {
    let out_dir = match args.out {
        Some(dir) => dir,
        None => dirs::config_dir()
            .map(|dir| dir.join("captains-log"))
            .context("No configuration directory; pass --out")?,
    };

    let options = SeedOptions {
        out_dir,
        identifier: args.identifier,
        viewer_name: args.viewer_name,
        force: args.force,
    };
    let files = seed::generate(&options)?;

    println!("Seed certificate:  {}", files.seed_cert.display());
    println!("Seed signing key:  {}", files.seed_key.display());
    println!("Viewer identity:   {}", files.cert.display());
    println!();
    println!("Ship the seed certificate with your application and set");
    println!(
        "  security.identity_dir = {:?}",
        options.out_dir.join(IDENTITIES_DIR)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run(cli.run));

    match command {
        Command::Run(args) => {
            init_logging(&args.log_level);
            run(args).await
        }
        Command::Seed(args) => {
            init_logging("info");
            seed(args)
        }
    }
}
