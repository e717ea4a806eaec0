//! Application configuration management.
//!
//! Configuration is layered, lowest priority first:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. An optional TOML file
//! 3. Environment variables named `ECGLINK__<SECTION>__<KEY>`, for example
//!    `ECGLINK__SESSION__CONNECT_TIMEOUT_MS=2000`
//!
//! The merged result is validated before it is handed out. Every problem
//! found is reported at once through
//! [`ConfigError::MultipleValidationErrors`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{DeviceAddress, ScanMode};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "ECGLINK";

/// Longest local name a peripheral can advertise, in bytes.
pub const MAX_TARGET_NAME_LEN: usize = 248;

// =============================================================================
// ERRORS
// =============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but could not be read.
    #[error("Failed to read {}: {source}", .path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("Failed to write {}: {source}", .path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The layered sources could not be merged or deserialized.
    #[error("Invalid configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field has an unacceptable value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields have unacceptable values.
    #[error("{} configuration problems: {}", .0.len(), join(.0))]
    MultipleValidationErrors(Vec<ConfigError>),
}

fn join(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn checker(errors: &mut Vec<ConfigError>) -> impl FnMut(bool, &str, &str) + '_ {
    move |ok, field, message| {
        if !ok {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        }
    }
}

fn collect(mut errors: Vec<ConfigError>) -> ConfigResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ConfigError::MultipleValidationErrors(errors)),
    }
}

// =============================================================================
// CONFIGURATION TYPES
// =============================================================================

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which peripheral to look for.
    pub target: TargetConfig,
    /// Discovery session behaviour.
    pub session: SessionConfig,
}

/// The peripheral to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Advertised local name, matched exactly.
    pub name: String,
    /// Only accept advertisements from this address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: "ECG-7".to_string(),
            address: None,
        }
    }
}

/// What the session does when a connection attempt fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailurePolicy {
    /// Go back to scanning and try the next matching advertisement.
    #[default]
    Retry,
    /// Stay in the error state until stopped.
    Abort,
}

/// How notifications reach the registered sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Inline on the transport's dispatch context.
    #[default]
    Direct,
    /// Latest value per characteristic, drained periodically.
    Buffered,
}

/// Notification delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delivery design.
    pub mode: DeliveryMode,
    /// Drain cadence in buffered mode.
    pub drain_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Direct,
            drain_interval_ms: 20,
        }
    }
}

impl DeliveryConfig {
    /// Drain cadence as a [`Duration`].
    #[must_use]
    pub const fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Discovery session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Active or passive scanning.
    pub scan_mode: ScanMode,
    /// Advertisements buffered between the radio and the worker.
    pub channel_capacity: usize,
    /// Bound on a single connection attempt.
    pub connect_timeout_ms: u64,
    /// Bound on each service or characteristic discovery round trip.
    pub discovery_timeout_ms: u64,
    /// Bound on each enable-notifications write.
    pub subscribe_timeout_ms: u64,
    /// Reaction to a failed connection.
    pub on_connect_failure: ConnectFailurePolicy,
    /// How long a failed address is ignored before it is tried again.
    pub retry_backoff_ms: u64,
    /// Stop scanning once connected.
    pub stop_scan_after_connect: bool,
    /// Notification delivery.
    pub delivery: DeliveryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::Active,
            channel_capacity: 64,
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 5_000,
            subscribe_timeout_ms: 5_000,
            on_connect_failure: ConnectFailurePolicy::Retry,
            retry_backoff_ms: 1_000,
            stop_scan_after_connect: true,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Connection bound as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Discovery bound as a [`Duration`].
    #[must_use]
    pub const fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Subscription bound as a [`Duration`].
    #[must_use]
    pub const fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Retry backoff as a [`Duration`].
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Check the session settings on their own.
    ///
    /// # Errors
    ///
    /// Same as [`Config::validate`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        self.check(&mut errors);
        collect(errors)
    }

    fn check(&self, errors: &mut Vec<ConfigError>) {
        let mut check = checker(errors);
        check(self.channel_capacity > 0, "session.channel_capacity", "must be at least 1");
        check(self.connect_timeout_ms > 0, "session.connect_timeout_ms", "must be positive");
        check(
            self.discovery_timeout_ms > 0,
            "session.discovery_timeout_ms",
            "must be positive",
        );
        check(
            self.subscribe_timeout_ms > 0,
            "session.subscribe_timeout_ms",
            "must be positive",
        );
        check(
            (1..=1_000).contains(&self.delivery.drain_interval_ms),
            "session.delivery.drain_interval_ms",
            "must be between 1 and 1000",
        );
    }
}

// =============================================================================
// LOADING, SAVING, VALIDATION
// =============================================================================

impl Config {
    /// Load configuration from defaults, a TOML file and the environment.
    ///
    /// With `path` set, the file must exist. Without it, the file at
    /// [`default_config_path`](Self::default_config_path) is used if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the merged sources do
    /// not deserialize, or the result fails validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        let file = match path {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_config_path().filter(|p| p.exists()),
        };
        if let Some(file) = file {
            debug!(path = %file.display(), "Loading configuration file");
            let content = std::fs::read_to_string(&file).map_err(|source| {
                ConfigError::ReadError {
                    path: file.clone(),
                    source,
                }
            })?;
            builder = builder.add_source(::config::File::from_str(
                &content,
                ::config::FileFormat::Toml,
            ));
        }

        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: Self = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(::config::File::from_str(content, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field, reporting all problems together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single problem and
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        {
            let mut check = checker(&mut errors);
            check(!self.target.name.is_empty(), "target.name", "must not be empty");
            check(
                self.target.name.len() <= MAX_TARGET_NAME_LEN,
                "target.name",
                "longer than an advertised name can be",
            );
        }
        self.session.check(&mut errors);
        collect(errors)
    }

    /// Per-user configuration file location, if a home directory exists.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "ecglink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.target.name, "ECG-7");
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.discovery_timeout(), Duration::from_secs(5));
        assert_eq!(config.session.delivery.drain_interval(), Duration::from_millis(20));
        assert_eq!(config.session.on_connect_failure, ConnectFailurePolicy::Retry);
        assert!(config.session.stop_scan_after_connect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [target]
            name = "ECG-9"
            address = "00:11:22:33:44:55"

            [session]
            on_connect_failure = "abort"

            [session.delivery]
            mode = "buffered"
            "#,
        )
        .unwrap();

        assert_eq!(config.target.name, "ECG-9");
        assert_eq!(config.target.address, Some(DeviceAddress::new(0x0011_2233_4455)));
        assert_eq!(config.session.on_connect_failure, ConnectFailurePolicy::Abort);
        assert_eq!(config.session.delivery.mode, DeliveryMode::Buffered);
        assert_eq!(config.session.delivery.drain_interval_ms, 20);
        assert_eq!(config.session.channel_capacity, 64);
    }

    #[test]
    fn test_malformed_address_is_rejected() {
        let err = Config::from_toml("[target]\naddress = \"00:11:22\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.target.name = "HRM-1".into();
        config.session.retry_backoff_ms = 250;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_explicit_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = Config::default();
        config.target.name.clear();
        config.session.connect_timeout_ms = 0;
        config.session.delivery.drain_interval_ms = 0;

        match config.validate().unwrap_err() {
            ConfigError::MultipleValidationErrors(errors) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_session_settings_validate_alone() {
        let mut session = SessionConfig::default();
        assert!(session.validate().is_ok());
        session.subscribe_timeout_ms = 0;
        let err = session.validate().unwrap_err();
        assert_eq!(err.to_string(), "session.subscribe_timeout_ms: must be positive");
    }

    #[test]
    fn test_single_validation_error() {
        let mut config = Config::default();
        config.session.channel_capacity = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "session.channel_capacity: must be at least 1");
    }
}
