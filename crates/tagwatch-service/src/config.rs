//! Service configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tagwatch_core::{
    CoordinatorConfig, Location, PolicyFlags, QueueConfig, ReconnectPolicy, RemoteDeviceRecord,
    RssiConfig, ScanConfig,
};
use tagwatch_types::{FirmwareVersion, LogicalId, command::encode_pairing_code};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Account the service acts for. Shared tags connect only for their
    /// accepted secondary user.
    pub user_id: String,
    /// Newest firmware offered to tags; older tags raise an update event.
    pub latest_firmware: Option<FirmwareVersion>,
    /// Fixed location stamped on notification history.
    pub location: Option<Location>,
    /// Coordinator timings.
    pub coordinator: CoordinatorSection,
    /// Initial policy flags.
    pub policy: PolicyFlags,
    /// Tags registered to the account.
    pub devices: Vec<RemoteDeviceRecord>,
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

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Coordinator timings are non-zero and the RSSI threshold is negative
    /// - Device ids are 12 upper-case hex digits and unique
    /// - Pairing codes are hex, nicknames are not blank
    /// - Buzz and blink durations are at least one second
    ///
    /// # Example
    ///
    /// ```
    /// use tagwatch_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.coordinator.validate();

        let mut seen = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(validate_device(device, &prefix));

            if !seen.insert(device.id.clone()) {
                errors.push(ValidationError {
                    field: format!("{}.id", prefix),
                    message: format!("duplicate device id '{}'", device.id),
                });
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

    /// Build the coordinator configuration for this service.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let section = &self.coordinator;
        CoordinatorConfig::default()
            .user_id(self.user_id.clone())
            .scan(
                ScanConfig::default()
                    .active(Duration::from_secs(section.scan_active_secs))
                    .pause(Duration::from_secs(section.scan_pause_secs)),
            )
            .rssi(
                RssiConfig::default()
                    .window(section.rssi_window)
                    .threshold(section.rssi_threshold)
                    .interval(Duration::from_secs(section.rssi_interval_secs)),
            )
            .reconnect(
                ReconnectPolicy::default()
                    .baseline(section.reconnect_baseline)
                    .extended_grace(Duration::from_secs(section.reconnect_grace_secs)),
            )
            .queue(
                QueueConfig::default()
                    .write_timeout(Duration::from_secs(section.write_timeout_secs))
                    .settle_delay(Duration::from_millis(section.settle_delay_ms)),
            )
            .tick_interval(Duration::from_secs(section.tick_interval_secs))
            .prune_interval(Duration::from_secs(section.prune_interval_secs))
            .recovery_prune_interval(Duration::from_secs(section.recovery_prune_interval_secs))
            .event_capacity(section.event_capacity)
            .pick_pocket_buffer_secs(section.pick_pocket_buffer_secs)
    }
}

fn validate_device(device: &RemoteDeviceRecord, prefix: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let canonical = LogicalId::from_hardware_uuid(device.id.as_str()).ok();
    if canonical.as_ref() != Some(&device.id) {
        errors.push(ValidationError {
            field: format!("{}.id", prefix),
            message: format!(
                "'{}' is not a logical id (expected 12 upper-case hex digits)",
                device.id
            ),
        });
    }

    if let Some(nickname) = &device.nickname
        && nickname.trim().is_empty()
    {
        errors.push(ValidationError {
            field: format!("{}.nickname", prefix),
            message: "nickname cannot be blank".to_string(),
        });
    }

    if let Some(code) = &device.pairing_code
        && let Err(e) = encode_pairing_code(code)
    {
        errors.push(ValidationError {
            field: format!("{}.pairing_code", prefix),
            message: e.to_string(),
        });
    }

    for (name, value) in [
        ("buzz_duration", device.buzz_duration),
        ("blink_duration", device.blink_duration),
    ] {
        if value == Some(0) {
            errors.push(ValidationError {
                field: format!("{}.{}", prefix, name),
                message: "duration must be at least 1 second".to_string(),
            });
        }
    }

    if let Some(sharing) = &device.sharing
        && sharing.secondary_user.trim().is_empty()
    {
        errors.push(ValidationError {
            field: format!("{}.sharing.secondary_user", prefix),
            message: "secondary user cannot be empty".to_string(),
        });
    }

    errors
}

/// Coordinator timings, in whole seconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// Policy tick period.
    pub tick_interval_secs: u64,
    /// Length of each scan window.
    pub scan_active_secs: u64,
    /// Pause between scan windows.
    pub scan_pause_secs: u64,
    /// Disconnected tags unheard for this long are pruned.
    pub prune_interval_secs: u64,
    /// Recovery-mode tags unseen for this long are forgotten.
    pub recovery_prune_interval_secs: u64,
    /// RSSI samples averaged per evaluation.
    pub rssi_window: usize,
    /// Average RSSI (dBm) below which high transmit power is enabled.
    pub rssi_threshold: i16,
    /// Seconds between RSSI reads.
    pub rssi_interval_secs: u64,
    /// Firmware at or above this version gets the extended reconnect grace.
    pub reconnect_baseline: FirmwareVersion,
    /// Extended reconnect grace.
    pub reconnect_grace_secs: u64,
    /// Per-write timeout.
    pub write_timeout_secs: u64,
    /// Pause after the pairing code write, in milliseconds.
    pub settle_delay_ms: u64,
    /// Event bus capacity.
    pub event_capacity: usize,
    /// Buffer sent with the pick-pocket command.
    pub pick_pocket_buffer_secs: u8,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            tick_interval_secs: defaults.tick_interval.as_secs(),
            scan_active_secs: defaults.scan.active.as_secs(),
            scan_pause_secs: defaults.scan.pause.as_secs(),
            prune_interval_secs: defaults.prune_interval.as_secs(),
            recovery_prune_interval_secs: defaults.recovery_prune_interval.as_secs(),
            rssi_window: defaults.rssi.window,
            rssi_threshold: defaults.rssi.threshold,
            rssi_interval_secs: defaults.rssi.interval.as_secs(),
            reconnect_baseline: defaults.reconnect.baseline,
            reconnect_grace_secs: defaults.reconnect.extended_grace.as_secs(),
            write_timeout_secs: defaults.queue.write_timeout.as_secs(),
            settle_delay_ms: defaults.queue.settle_delay.as_millis() as u64,
            event_capacity: defaults.event_capacity,
            pick_pocket_buffer_secs: defaults.pick_pocket_buffer_secs,
        }
    }
}

impl CoordinatorSection {
    /// Validate the section.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("tick_interval_secs", self.tick_interval_secs),
            ("scan_active_secs", self.scan_active_secs),
            ("prune_interval_secs", self.prune_interval_secs),
            (
                "recovery_prune_interval_secs",
                self.recovery_prune_interval_secs,
            ),
            ("rssi_interval_secs", self.rssi_interval_secs),
            ("write_timeout_secs", self.write_timeout_secs),
        ] {
            if value == 0 {
                errors.push(ValidationError {
                    field: format!("coordinator.{}", name),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        if self.rssi_window == 0 {
            errors.push(ValidationError {
                field: "coordinator.rssi_window".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.rssi_threshold >= 0 {
            errors.push(ValidationError {
                field: "coordinator.rssi_threshold".to_string(),
                message: format!("must be negative dBm, got {}", self.rssi_threshold),
            });
        }
        if self.event_capacity == 0 {
            errors.push(ValidationError {
                field: "coordinator.event_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.pick_pocket_buffer_secs == 0 {
            errors.push(ValidationError {
                field: "coordinator.pick_pocket_buffer_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
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

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `coordinator.rssi_window` or `devices[0].id`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
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
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tagwatch")
        .join("tagwatch.toml")
}
