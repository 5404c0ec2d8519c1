//! Daemon configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use laifen_core::{DeviceIdentity, FrameOptions, LinkConfig, RetryConfig, SessionConfig};
use serde::{Deserialize, Serialize};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Connection settings.
    pub link: LinkSection,
    /// Session settings.
    pub session: SessionSection,
    /// Presence scanning settings.
    pub scan: ScanSection,
    /// Devices to bind at startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// This checks:
    /// - Attempt counts are within 1 to 20
    /// - Timeouts are within 1 to 300 seconds
    /// - The poll interval is at least one second
    /// - The frame preamble is 7 or 8 hex digits
    /// - The minimum frame length is within 48 to 128 hex characters
    /// - Device addresses are non-empty and unique
    ///
    /// # Example
    ///
    /// ```
    /// use laifen_service::Config;
    ///
    /// let config = Config::default();
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.storage.validate());
        errors.extend(self.link.validate());
        errors.extend(self.session.validate());
        errors.extend(self.scan.validate());

        let mut seen = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !device.address.trim().is_empty() && !seen.insert(device.identity()) {
                errors.push(ValidationError::new(
                    format!("{}.address", prefix),
                    format!("duplicate device address '{}'", device.address),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Session settings for the core engine.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .link(self.link.to_link_config())
            .poll_reconnect(RetryConfig::fixed(
                self.session.reconnect_attempts,
                Duration::from_secs(self.link.connect_interval_secs),
            ))
            .frame(self.session.frame_options())
            .discard_first_notification(self.session.discard_first_notification)
    }

    /// Identities of the configured devices, in file order.
    pub fn identities(&self) -> Vec<DeviceIdentity> {
        self.devices.iter().map(DeviceConfig::identity).collect()
    }

    /// Alias configured for a device, if any.
    pub fn alias_of(&self, identity: &DeviceIdentity) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| &d.identity() == identity)
            .and_then(|d| d.alias.as_deref())
    }
}

/// Smallest accepted attempt count.
pub const MIN_ATTEMPTS: u32 = 1;
/// Largest accepted attempt count.
pub const MAX_ATTEMPTS: u32 = 20;
/// Smallest accepted timeout in seconds.
pub const MIN_TIMEOUT_SECS: u64 = 1;
/// Largest accepted timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;

fn check_attempts(field: &str, value: u32, errors: &mut Vec<ValidationError>) {
    if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&value) {
        errors.push(ValidationError::new(
            field,
            format!(
                "{} attempts is out of range ({}-{})",
                value, MIN_ATTEMPTS, MAX_ATTEMPTS
            ),
        ));
    }
}

fn check_timeout(field: &str, value: u64, errors: &mut Vec<ValidationError>) {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&value) {
        errors.push(ValidationError::new(
            field,
            format!(
                "{} seconds is out of range ({}-{})",
                value, MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
            ),
        ));
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot database path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: laifen_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }
        errors
    }
}

/// Connection timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    /// Connect attempts per batch.
    pub connect_attempts: u32,
    /// Timeout of one connect attempt.
    pub connect_timeout_secs: u64,
    /// Pause between connect attempts.
    pub connect_interval_secs: u64,
    /// Notification subscribe attempts.
    pub subscribe_attempts: u32,
    /// Pause between subscribe attempts.
    pub subscribe_interval_secs: u64,
    /// Timeout of one characteristic read.
    pub read_timeout_secs: u64,
    /// Timeout of one command write.
    pub write_timeout_secs: u64,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_timeout_secs: 60,
            connect_interval_secs: 5,
            subscribe_attempts: 5,
            subscribe_interval_secs: 1,
            read_timeout_secs: 20,
            write_timeout_secs: 10,
        }
    }
}

impl LinkSection {
    /// Validate connection timing.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check_attempts("link.connect_attempts", self.connect_attempts, &mut errors);
        check_attempts(
            "link.subscribe_attempts",
            self.subscribe_attempts,
            &mut errors,
        );
        check_timeout(
            "link.connect_timeout_secs",
            self.connect_timeout_secs,
            &mut errors,
        );
        check_timeout(
            "link.connect_interval_secs",
            self.connect_interval_secs,
            &mut errors,
        );
        check_timeout(
            "link.subscribe_interval_secs",
            self.subscribe_interval_secs,
            &mut errors,
        );
        check_timeout("link.read_timeout_secs", self.read_timeout_secs, &mut errors);
        check_timeout(
            "link.write_timeout_secs",
            self.write_timeout_secs,
            &mut errors,
        );
        errors
    }

    /// Convert to the core link configuration.
    pub fn to_link_config(&self) -> LinkConfig {
        LinkConfig::default()
            .connect_retry(RetryConfig::fixed(
                self.connect_attempts,
                Duration::from_secs(self.connect_interval_secs),
            ))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .subscribe_retry(RetryConfig::fixed(
                self.subscribe_attempts,
                Duration::from_secs(self.subscribe_interval_secs),
            ))
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .write_timeout(Duration::from_secs(self.write_timeout_secs))
    }
}

/// Session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Seconds between polls of every session.
    pub poll_interval_secs: u64,
    /// Connect attempts a poll makes when it finds the link down.
    pub reconnect_attempts: u32,
    /// How long startup waits for configured devices before reporting ready.
    pub setup_timeout_secs: u64,
    /// Drop the first notification after subscribing.
    pub discard_first_notification: bool,
    /// Hex prefix of a valid status frame.
    pub frame_preamble: String,
    /// Minimum hex length of a valid status frame.
    pub min_frame_hex_len: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        let frame = FrameOptions::default();
        Self {
            poll_interval_secs: 1,
            reconnect_attempts: 5,
            setup_timeout_secs: 15,
            discard_first_notification: false,
            frame_preamble: frame.preamble,
            min_frame_hex_len: frame.min_hex_len,
        }
    }
}

/// Accepted range of `session.min_frame_hex_len`.
pub const FRAME_HEX_LEN_RANGE: std::ops::RangeInclusive<usize> = 48..=128;

impl SessionSection {
    /// Validate session behaviour.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.poll_interval_secs == 0 {
            errors.push(ValidationError::new(
                "session.poll_interval_secs",
                "poll interval must be at least 1 second",
            ));
        }
        check_attempts(
            "session.reconnect_attempts",
            self.reconnect_attempts,
            &mut errors,
        );
        check_timeout(
            "session.setup_timeout_secs",
            self.setup_timeout_secs,
            &mut errors,
        );

        let preamble = &self.frame_preamble;
        if !(7..=8).contains(&preamble.len()) || !preamble.chars().all(|c| c.is_ascii_hexdigit())
        {
            errors.push(ValidationError::new(
                "session.frame_preamble",
                format!("'{}' is not a 7 or 8 digit hex prefix", preamble),
            ));
        }

        if !FRAME_HEX_LEN_RANGE.contains(&self.min_frame_hex_len) {
            errors.push(ValidationError::new(
                "session.min_frame_hex_len",
                format!(
                    "{} is out of range ({}-{})",
                    self.min_frame_hex_len,
                    FRAME_HEX_LEN_RANGE.start(),
                    FRAME_HEX_LEN_RANGE.end()
                ),
            ));
        }

        errors
    }

    /// Frame validation rules for the decoder.
    pub fn frame_options(&self) -> FrameOptions {
        FrameOptions::default()
            .preamble(&self.frame_preamble)
            .min_hex_len(self.min_frame_hex_len)
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Startup readiness timeout as a duration.
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

/// Presence scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    /// Minimum seconds between two reported sightings of one device.
    pub seen_debounce_secs: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            seen_debounce_secs: 5,
        }
    }
}

impl ScanSection {
    /// Validate presence scanning.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check_timeout(
            "scan.seen_debounce_secs",
            self.seen_debounce_secs,
            &mut errors,
        );
        errors
    }

    /// Debounce window as a duration.
    pub fn seen_debounce(&self) -> Duration {
        Duration::from_secs(self.seen_debounce_secs)
    }
}

/// A toothbrush to bind at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bluetooth address, or peripheral UUID on macOS.
    pub address: String,
    /// Friendly name used in logs.
    #[serde(default)]
    pub alias: Option<String>,
}

impl DeviceConfig {
    /// Normalized identity of this device.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.address)
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.address.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.address", prefix),
                "device address cannot be empty",
            ));
        }

        if let Some(alias) = &self.alias
            && alias.is_empty()
        {
            errors.push(ValidationError::new(
                format!("{}.alias", prefix),
                "alias cannot be empty string (omit it instead)",
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation failure.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g. `link.connect_attempts` or `devices[0].address`).
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
///
/// - Linux: `~/.config/laifen/config.toml`
/// - macOS: `~/Library/Application Support/laifen/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("laifen")
        .join("config.toml")
}
