//! # ecglink
//!
//! Command-line client for a BLE ECG sensor.
//!
//! This binary provides:
//! - A live scan listing (name, address, RSSI)
//! - A one-shot GATT tree dump of the target
//! - A notification stream printed as hex or JSON lines
//!
//! ## Running
//!
//! ```bash
//! # Against the built-in simulated sensor
//! ecglink --simulate stream
//!
//! # Against the real radio (Linux, built with --features bluetooth)
//! ecglink stream --name ECG-7
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ecglink_cli::commands::{self, StreamOptions};
use ecglink_cli::logging::{self, LogSettings};
use ecglink_cli::simulator::Simulator;
use ecglink_core::{BleTransport, Config, DeviceAddress, MockTransport};
use tracing::info;

#[derive(Parser)]
#[command(name = "ecglink")]
#[command(about = "Find, inspect and stream from a BLE ECG sensor", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the built-in simulated sensor instead of the radio
    #[arg(long, global = true)]
    simulate: bool,

    /// JSON file logging in addition to stderr
    #[arg(long, global = true)]
    production: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Directory for production log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Radio(RadioCommand),

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum RadioCommand {
    /// List advertising devices
    Scan {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Connect to the target and print its services and characteristics
    Services {
        /// Advertised name to look for
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Connect to the target and print every notification
    Stream {
        /// Advertised name to look for
        #[arg(short, long)]
        name: Option<String>,
        /// Only accept this device address
        #[arg(short, long)]
        address: Option<DeviceAddress>,
        /// Deliver the latest value per characteristic at a fixed cadence
        #[arg(long)]
        buffered: bool,
        /// Print JSON lines instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogSettings {
        production: cli.production,
        verbosity: cli.verbose,
        quiet: cli.quiet,
        directory: cli.log_dir.clone(),
    })?;

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Show => commands::config_show(cli.config.as_deref()),
            ConfigAction::Init { force } => commands::config_init(cli.config.as_deref(), force),
            ConfigAction::Path => commands::config_path(cli.config.as_deref()),
        },
        Command::Radio(command) => {
            let config =
                Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
            info!(name = %config.target.name, "Starting ecglink");
            run(command, config, cli.simulate).await
        }
    }
}

#[cfg(all(feature = "bluetooth", target_os = "linux"))]
async fn run(command: RadioCommand, config: Config, simulate: bool) -> Result<()> {
    if simulate {
        return run_simulated(command, config).await;
    }
    let transport = ecglink_core::BluezTransport::new()
        .await
        .context("Bluetooth is not available")?;
    dispatch(Arc::new(transport), command, config).await
}

#[cfg(not(all(feature = "bluetooth", target_os = "linux")))]
async fn run(command: RadioCommand, config: Config, simulate: bool) -> Result<()> {
    if !simulate {
        tracing::warn!("Built without Bluetooth support; using the simulated sensor");
    }
    run_simulated(command, config).await
}

async fn run_simulated(command: RadioCommand, config: Config) -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let _simulator = Simulator::spawn(Arc::clone(&transport), &config.target.name);
    dispatch(transport, command, config).await
}

async fn dispatch<T: BleTransport>(
    transport: Arc<T>,
    command: RadioCommand,
    config: Config,
) -> Result<()> {
    match command {
        RadioCommand::Scan { duration } => {
            commands::scan(transport, &config.session, duration.map(Duration::from_secs)).await
        }
        RadioCommand::Services { name } => {
            let name = name.unwrap_or_else(|| config.target.name.clone());
            commands::services(transport, &config, &name).await
        }
        RadioCommand::Stream {
            name,
            address,
            buffered,
            json,
        } => {
            let options = StreamOptions::from_config(&config, name, address, buffered, json);
            commands::stream(transport, options).await
        }
    }
}
