//! Headless daemon for BLE tracker tags.
//!
//! The service opens the system Bluetooth adapter, hands it to a
//! [`tagwatch_core::ConnectionCoordinator`] and logs every event the
//! coordinator publishes until it is interrupted.
//!
//! # Configuration
//!
//! The service reads `tagwatch.toml` from the platform config directory
//! (see [`default_config_path`]):
//!
//! ```toml
//! user_id = "alice"
//! latest_firmware = "4.5.0"
//!
//! [location]
//! latitude = 52.52
//! longitude = 13.405
//!
//! [coordinator]
//! tick_interval_secs = 10
//! scan_active_secs = 20
//! scan_pause_secs = 10
//! rssi_threshold = -80
//!
//! [policy]
//! dnd = true
//!
//! [[devices]]
//! id = "E50E24DCCA9E"
//! nickname = "Keys"
//! alert_mode = "high"
//! pairing_code = "A1B2C3D4"
//! ```

pub mod config;
pub mod monitor;

pub use config::{
    Config, ConfigError, CoordinatorSection, ValidationError, default_config_path,
};
pub use monitor::{log_events, summarize};
