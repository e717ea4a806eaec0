//! Subcommand implementations.
//!
//! Each radio command is generic over the transport so the same code runs
//! against BlueZ and against the simulator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ecglink_core::{
    AdvertisementChannel, AdvertisementFilter, BleTransport, ChannelSink, Config, DeliveryMode,
    DiscoverySession, GattExplorer, LinkError, Scanner, SessionConfig, SessionState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::output;

/// How notifications are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Timestamp, characteristic and hex payload.
    Text,
    /// One JSON object per line.
    Json,
}

/// Options for [`stream`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Target selection.
    pub filter: AdvertisementFilter,
    /// Session settings.
    pub session: SessionConfig,
    /// Payload rendering.
    pub format: OutputFormat,
}

impl StreamOptions {
    /// Build options from the loaded configuration and command-line overrides.
    #[must_use]
    pub fn from_config(
        config: &Config,
        name: Option<String>,
        address: Option<ecglink_core::DeviceAddress>,
        buffered: bool,
        json: bool,
    ) -> Self {
        let mut filter =
            AdvertisementFilter::by_name(name.unwrap_or_else(|| config.target.name.clone()));
        if let Some(address) = address.or(config.target.address) {
            filter = filter.with_address(address);
        }
        let mut session = config.session.clone();
        if buffered {
            session.delivery.mode = DeliveryMode::Buffered;
        }
        Self {
            filter,
            session,
            format: if json { OutputFormat::Json } else { OutputFormat::Text },
        }
    }
}

/// Resolve on Ctrl-C, or on Enter when `watch_stdin` is set.
async fn interrupted(watch_stdin: bool) {
    let enter = async {
        if watch_stdin {
            let mut line = String::new();
            let mut stdin = BufReader::new(tokio::io::stdin());
            if matches!(stdin.read_line(&mut line).await, Ok(n) if n > 0) {
                return;
            }
        }
        std::future::pending::<()>().await;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = enter => {}
    }
}

/// List advertisements until `duration` elapses or the user interrupts.
///
/// # Errors
///
/// Returns an error if scanning cannot be started.
pub async fn scan<T: BleTransport>(
    transport: Arc<T>,
    session: &SessionConfig,
    duration: Option<Duration>,
) -> Result<()> {
    let (observer, mut advertisements) = AdvertisementChannel::new(session.channel_capacity);
    let scanner = Scanner::new(transport, Arc::new(observer));
    scanner
        .start(session.scan_mode)
        .await
        .context("Failed to start scanning")?;
    eprintln!("Scanning... press Ctrl-C to stop");

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let stop = interrupted(false);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            () = &mut stop => break,
            () = &mut deadline => break,
            next = advertisements.recv() => match next {
                Some(advertisement) => println!("{}", output::advertisement_line(&advertisement)),
                None => break,
            },
        }
    }

    scanner.stop().await.context("Failed to stop scanning")?;
    Ok(())
}

/// Find the target, connect, print its GATT tree and disconnect.
///
/// # Errors
///
/// Returns an error if scanning, connecting or service enumeration fails.
pub async fn services<T: BleTransport>(transport: Arc<T>, config: &Config, name: &str) -> Result<()> {
    let session = &config.session;
    let filter = AdvertisementFilter::by_name(name);
    let (observer, mut advertisements) = AdvertisementChannel::new(session.channel_capacity);
    let scanner = Scanner::new(Arc::clone(&transport), Arc::new(observer));
    scanner
        .start(session.scan_mode)
        .await
        .context("Failed to start scanning")?;
    eprintln!("Searching for {name}... press Ctrl-C to give up");

    let found = tokio::select! {
        () = interrupted(false) => None,
        found = async {
            while let Some(advertisement) = advertisements.recv().await {
                if filter.matches(&advertisement) {
                    return Some(advertisement);
                }
            }
            None
        } => found,
    };
    scanner.stop().await.context("Failed to stop scanning")?;
    let Some(target) = found else {
        return Ok(());
    };

    let address = target.address;
    info!(%address, "Found target");
    let handle = tokio::time::timeout(session.connect_timeout(), transport.connect(address))
        .await
        .map_err(|_| LinkError::Timeout {
            operation: "connect",
            after: session.connect_timeout(),
        })?
        .map_err(|e| LinkError::ConnectFailed {
            address,
            reason: e.to_string(),
        })?;

    let explorer = GattExplorer::new(Arc::clone(&transport), session.discovery_timeout());
    let tree = explorer.explore(&handle).await;
    if let Err(error) = transport.disconnect(&handle).await {
        warn!(%error, "Disconnect failed");
    }
    let tree = tree.map_err(LinkError::from).context("Service discovery failed")?;

    println!("Device {address}");
    print!("{}", output::service_tree(&tree));
    Ok(())
}

/// Run a discovery session and print every notification until interrupted.
///
/// # Errors
///
/// Returns an error if the session settings are invalid or the session
/// cannot be started.
pub async fn stream<T: BleTransport>(transport: Arc<T>, options: StreamOptions) -> Result<()> {
    let session = DiscoverySession::try_new(transport, options.session)
        .context("Invalid session settings")?;
    let (sink, mut events) = ChannelSink::new(1024);
    session.on_notification(Arc::new(sink));

    let target = options.filter.name().to_string();
    session
        .start_with_filter(options.filter)
        .await
        .context("Failed to start discovery session")?;
    eprintln!("Scanning for {target}... press Enter or Ctrl-C to stop");

    let stop = interrupted(true);
    tokio::pin!(stop);
    let mut progress = tokio::time::interval(Duration::from_millis(250));
    let mut last_state = SessionState::Scanning;

    loop {
        tokio::select! {
            () = &mut stop => break,
            _ = progress.tick() => {
                let status = session.status();
                if status.state != last_state {
                    announce(&status);
                    last_state = status.state;
                }
            }
            next = events.recv() => match next {
                Some(event) => match options.format {
                    OutputFormat::Text => println!("{}", output::notification_line(&event)),
                    OutputFormat::Json => println!("{}", output::notification_json(&event)),
                },
                None => break,
            },
        }
    }

    session.stop().await;
    for failure in session.status().failures {
        eprintln!("warning: {:?} {}: {}", failure.stage, failure.subject, failure.error);
    }
    Ok(())
}

fn announce(status: &ecglink_core::SessionStatus) {
    let device = status
        .device
        .map_or_else(|| "device".to_string(), |address| address.to_string());
    match status.state {
        SessionState::Connecting => eprintln!("Connecting to {device}..."),
        SessionState::Discovering => eprintln!("Connected to {device}, discovering services..."),
        SessionState::Subscribed => eprintln!(
            "Subscribed to {} characteristic(s) on {device}",
            status.subscriptions.len()
        ),
        SessionState::Error => eprintln!("Connection to {device} failed"),
        SessionState::Scanning => eprintln!("Scanning..."),
        SessionState::Idle | SessionState::Stopped => {}
    }
}

// =============================================================================
// CONFIG COMMANDS
// =============================================================================

/// Print the effective configuration as TOML.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or rendered.
pub fn config_show(path: Option<&Path>) -> Result<()> {
    let config = Config::load(path).context("Failed to load configuration")?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Write a default configuration file.
///
/// # Errors
///
/// Returns an error if the file exists and `force` is not set, or the write
/// fails.
pub fn config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path().context("Cannot determine config directory")?,
    };
    if path.exists() && !force {
        bail!("{} already exists. Use --force to overwrite.", path.display());
    }
    Config::default()
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Print where the configuration file is read from.
///
/// # Errors
///
/// Returns an error if no path was given and no home directory exists.
pub fn config_path(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path().context("Cannot determine config directory")?,
    };
    println!("{}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecglink_core::DeviceAddress;

    #[test]
    fn test_stream_options_prefer_flags() {
        let mut config = Config::default();
        config.target.address = Some(DeviceAddress::new(1));

        let options = StreamOptions::from_config(&config, Some("HRM".into()), None, true, true);
        assert_eq!(options.filter.name(), "HRM");
        assert_eq!(options.filter.address(), Some(DeviceAddress::new(1)));
        assert_eq!(options.session.delivery.mode, DeliveryMode::Buffered);
        assert_eq!(options.format, OutputFormat::Json);
    }

    #[test]
    fn test_stream_options_default_to_config() {
        let options = StreamOptions::from_config(&Config::default(), None, None, false, false);
        assert_eq!(options.filter.name(), "ECG-7");
        assert_eq!(options.filter.address(), None);
        assert_eq!(options.session.delivery.mode, DeliveryMode::Direct);
        assert_eq!(options.format, OutputFormat::Text);
    }
}
