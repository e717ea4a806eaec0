//! Logging setup.
//!
//! Standard output carries scan listings and payload dumps, so every log
//! record goes to standard error. `--production` adds a JSON file that rolls
//! over daily and switches the console layer to compact, uncoloured lines.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Fallback for `RUST_LOG`.
pub const LOG_LEVEL_ENV: &str = "ECGLINK_LOG_LEVEL";

const LOG_FILE_PREFIX: &str = "ecglink";

/// Non-blocking writer guards. Dropping one loses buffered records.
static GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// How logging should be set up for this run.
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Add the JSON file layer and use compact console output.
    pub production: bool,
    /// Number of `-v` flags.
    pub verbosity: u8,
    /// Only warnings and errors.
    pub quiet: bool,
    /// Overrides the per-user log directory.
    pub directory: Option<PathBuf>,
}

impl LogSettings {
    /// Level implied by the command-line flags.
    #[must_use]
    pub const fn level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Where production log files are written.
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_log_directory)
    }

    fn flags_set(&self) -> bool {
        self.quiet || self.verbosity > 0
    }
}

/// Install the global subscriber.
///
/// Filter precedence: `-v`/`-q` flags, then `RUST_LOG`, then
/// `ECGLINK_LOG_LEVEL`, then `info`.
///
/// # Errors
///
/// Returns an error if the filter does not parse, the log directory cannot
/// be created, or a subscriber is already installed.
pub fn init(settings: &LogSettings) -> anyhow::Result<()> {
    let filter = env_filter(settings)?;
    let mut guards = Vec::new();

    let file_layer = if settings.production {
        let directory = settings.directory();
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Cannot create log directory {}", directory.display()))?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &directory, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let console_layer = if settings.production {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        guards.push(guard);
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("A logger is already installed")?;

    let _ = GUARDS.set(guards);
    Ok(())
}

fn env_filter(settings: &LogSettings) -> anyhow::Result<EnvFilter> {
    if !settings.flags_set() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    let directive = if settings.flags_set() {
        settings.level().to_string()
    } else {
        std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| settings.level().to_string())
    };
    EnvFilter::try_new(&directive).with_context(|| format!("Invalid log filter {directive:?}"))
}

fn default_log_directory() -> PathBuf {
    directories::ProjectDirs::from("", "", "ecglink")
        .map(|dirs| dirs.data_local_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_follows_flags() {
        let mut settings = LogSettings::default();
        assert_eq!(settings.level(), "info");
        settings.verbosity = 1;
        assert_eq!(settings.level(), "debug");
        settings.verbosity = 4;
        assert_eq!(settings.level(), "trace");
        settings.quiet = true;
        assert_eq!(settings.level(), "warn");
    }

    #[test]
    fn test_flags_override_environment() {
        let settings = LogSettings {
            verbosity: 2,
            ..LogSettings::default()
        };
        let filter = env_filter(&settings).unwrap();
        assert_eq!(filter.to_string(), "trace");
    }

    #[test]
    fn test_directory_override() {
        let settings = LogSettings {
            directory: Some(PathBuf::from("/tmp/ecglink-logs")),
            ..LogSettings::default()
        };
        assert_eq!(settings.directory(), PathBuf::from("/tmp/ecglink-logs"));
        assert!(LogSettings::default().directory().ends_with("logs"));
    }
}
