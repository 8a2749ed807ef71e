//! Application configuration management.
//!
//! Handles loading, saving, and validating discovery configuration including:
//! - The local user's identity
//! - Registry TTL and start retry behavior
//! - Per-channel cadences (Bluetooth, NFC, Location)
//! - HTTP server bind address
//!
//! Values come from a TOML file layered under environment variables
//! (`NEARBY_SECTION__KEY`, e.g. `NEARBY_IDENTITY__SELF_ID`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::Accuracy;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "NEARBY";

/// Longest accepted presence window (one day).
const MAX_PRESENCE_WINDOW_SECS: u64 = 86_400;

/// Upper bound for hour-based retention settings (one year).
const MAX_RETENTION_HOURS: u32 = 8_760;

/// Errors from loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file at the requested path.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The layered sources could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// One field holds an invalid value.
    #[error("{field}: {message}")]
    Validation {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Who the local user is.
    pub identity: IdentityConfig,
    /// Settings shared by every channel.
    pub discovery: DiscoveryConfig,
    /// Bluetooth channel.
    pub bluetooth: RadioChannelConfig,
    /// NFC channel.
    pub nfc: RadioChannelConfig,
    /// Location channel.
    pub location: LocationConfig,
    /// HTTP server.
    pub server: ServerConfig,
}

/// Local user identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Id of the local user; used as the presence key.
    pub self_id: String,
}

/// Settings shared by every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Registry entries older than this are evicted.
    pub ttl_hours: u32,
    /// Delay before an automatic start retry.
    pub retry_delay_ms: u64,
    /// Cap on consecutive automatic retries; unlimited when absent.
    pub max_retries: Option<u32>,
    /// Whether `start` requests auto-retry by default.
    pub auto_retry: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            retry_delay_ms: 5000,
            max_retries: None,
            auto_retry: false,
        }
    }
}

/// Settings for a radio-proximity channel (Bluetooth or NFC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioChannelConfig {
    /// Whether the channel may be started at all.
    pub enabled: bool,
    /// Local scan period in the foreground.
    pub scan_interval_secs: u64,
    /// Local scan period in background mode.
    pub background_scan_interval_secs: u64,
    /// Remote discovery period.
    pub discovery_interval_secs: u64,
    /// How recent another user's presence must be to count as nearby.
    pub presence_window_secs: u64,
    /// Whether "unavailable" is surfaced to the UI or treated as a silent disable.
    pub report_unavailable: bool,
}

impl Default for RadioChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 10,
            background_scan_interval_secs: 30,
            discovery_interval_secs: 3,
            presence_window_secs: 60,
            report_unavailable: true,
        }
    }
}

impl RadioChannelConfig {
    /// How far back another user's presence still counts.
    #[must_use]
    pub fn presence_window(&self) -> chrono::Duration {
        let secs = self.presence_window_secs.min(MAX_PRESENCE_WINDOW_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or_default())
    }
}

/// Settings for the location channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Whether the channel may be started at all.
    pub enabled: bool,
    /// Target interval between position fixes.
    pub update_interval_secs: u64,
    /// Remote discovery period.
    pub discovery_interval_secs: u64,
    /// Radius of the nearby query.
    pub radius_meters: f64,
    /// How recent another user's location must be.
    pub freshness_hours: u32,
    /// Requested fix accuracy.
    pub accuracy: Accuracy,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval_secs: 5,
            discovery_interval_secs: 30,
            radius_meters: 150.0,
            freshness_hours: 24,
            accuracy: Accuracy::Balanced,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            discovery: DiscoveryConfig::default(),
            bluetooth: RadioChannelConfig::default(),
            // Many devices have no NFC chip; missing hardware is not worth an error.
            nfc: RadioChannelConfig {
                report_unavailable: false,
                ..RadioChannelConfig::default()
            },
            location: LocationConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, layered under environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or a
    /// load/validation error otherwise.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::build(Some(path))
    }

    /// Like [`load`](Self::load), but a missing file means defaults plus environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be parsed or the result is invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::build(Some(path))
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Self::build(None)
        }
    }

    fn build(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration to `path` as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)
    }

    /// Checks every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns the single failure, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: &str| {
            if !ok {
                errors.push(ConfigError::Validation {
                    field: field.to_string(),
                    message: message.to_string(),
                });
            }
        };

        check(
            !self.identity.self_id.trim().is_empty(),
            "identity.self_id",
            "must be set",
        );
        check(
            (1..=MAX_RETENTION_HOURS).contains(&self.discovery.ttl_hours),
            "discovery.ttl_hours",
            "must be between 1 and 8760",
        );
        check(
            self.discovery.retry_delay_ms > 0,
            "discovery.retry_delay_ms",
            "must be positive",
        );

        for (name, radio) in [("bluetooth", &self.bluetooth), ("nfc", &self.nfc)] {
            check(
                radio.scan_interval_secs > 0,
                &format!("{name}.scan_interval_secs"),
                "must be positive",
            );
            check(
                radio.background_scan_interval_secs >= radio.scan_interval_secs,
                &format!("{name}.background_scan_interval_secs"),
                "must not be shorter than scan_interval_secs",
            );
            check(
                radio.discovery_interval_secs > 0,
                &format!("{name}.discovery_interval_secs"),
                "must be positive",
            );
            check(
                radio.presence_window_secs > 0 && radio.presence_window_secs <= MAX_PRESENCE_WINDOW_SECS,
                &format!("{name}.presence_window_secs"),
                "must be between 1 and 86400",
            );
        }

        check(
            self.location.update_interval_secs > 0,
            "location.update_interval_secs",
            "must be positive",
        );
        check(
            self.location.discovery_interval_secs > 0,
            "location.discovery_interval_secs",
            "must be positive",
        );
        check(
            self.location.radius_meters.is_finite() && self.location.radius_meters > 0.0,
            "location.radius_meters",
            "must be a positive number",
        );
        check(
            (1..=MAX_RETENTION_HOURS).contains(&self.location.freshness_hours),
            "location.freshness_hours",
            "must be between 1 and 8760",
        );
        check(!self.server.host.is_empty(), "server.host", "must be set");

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Registry TTL.
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.discovery.ttl_hours))
    }

    /// Delay before an automatic start retry.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.discovery.retry_delay_ms)
    }
}

/// Returns the default configuration file path.
///
/// On Linux: `/etc/nearby/config.toml`
/// Elsewhere: the platform config directory, e.g. `~/Library/Application Support/nearby/`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/nearby/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "nearby").map_or_else(
            || PathBuf::from("./config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            identity: IdentityConfig {
                self_id: "me".into(),
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_match_reference_cadences() {
        let config = Config::default();
        assert_eq!(config.discovery.ttl_hours, 24);
        assert_eq!(config.retry_delay(), Duration::from_millis(5000));
        assert_eq!(config.bluetooth.scan_interval_secs, 10);
        assert_eq!(config.bluetooth.background_scan_interval_secs, 30);
        assert_eq!(config.bluetooth.discovery_interval_secs, 3);
        assert_eq!(config.bluetooth.presence_window_secs, 60);
        assert!(config.bluetooth.report_unavailable);
        assert!(!config.nfc.report_unavailable);
        assert_eq!(config.location.update_interval_secs, 5);
        assert_eq!(config.location.discovery_interval_secs, 30);
        assert!((config.location.radius_meters - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_self_id_fails_validation() {
        match Config::default().validate().unwrap_err() {
            ConfigError::Validation { field, .. } => assert_eq!(field, "identity.self_id"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_multiple_validation_errors_collected() {
        let mut config = valid();
        config.discovery.ttl_hours = 0;
        config.location.radius_meters = -1.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MultipleValidationErrors(ref errs) if errs.len() == 2));
    }

    #[test]
    fn test_retention_hours_are_bounded() {
        let mut config = valid();
        config.discovery.ttl_hours = u32::MAX;
        config.location.freshness_hours = MAX_RETENTION_HOURS + 1;
        match config.validate().unwrap_err() {
            ConfigError::MultipleValidationErrors(errs) => {
                let fields: Vec<String> = errs
                    .iter()
                    .filter_map(|err| match err {
                        ConfigError::Validation { field, .. } => Some(field.clone()),
                        _ => None,
                    })
                    .collect();
                assert_eq!(fields, ["discovery.ttl_hours", "location.freshness_hours"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        config.discovery.ttl_hours = MAX_RETENTION_HOURS;
        config.location.freshness_hours = MAX_RETENTION_HOURS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_background_interval_not_shorter_than_foreground() {
        let mut config = valid();
        config.nfc.background_scan_interval_secs = 5;
        match config.validate().unwrap_err() {
            ConfigError::Validation { field, .. } => {
                assert_eq!(field, "nfc.background_scan_interval_secs");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[identity]
self_id = "user-7"

[location]
radius_meters = 300.0
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.identity.self_id, "user-7");
        assert!((config.location.radius_meters - 300.0).abs() < f64::EPSILON);
        assert_eq!(config.location.update_interval_secs, 5);
        assert_eq!(config.bluetooth.discovery_interval_secs, 3);
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = valid();
        config.discovery.max_retries = Some(3);
        config.location.accuracy = Accuracy::High;

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_default_config_path_is_toml() {
        let path = default_config_path();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("toml"));
    }
}
