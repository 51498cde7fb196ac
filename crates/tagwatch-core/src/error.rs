//! Error types for tagwatch-core.
//!
//! Nothing in the coordination core is fatal. Radio errors are logged and
//! the affected device is re-evaluated on the next policy tick; the variants
//! below exist so that callers issuing explicit operations (enqueueing a
//! command, starting a firmware update) can tell what went wrong.
//!
//! | Error Type | Typical cause | Handling |
//! |------------|---------------|----------|
//! | [`Error::Bluetooth`] | Radio stack error | Logged, retried next tick |
//! | [`Error::NotConnected`] | Write to a dropped link | Queue drains, next tick reconnects |
//! | [`Error::Timeout`] | No write completion from the radio | Entry completes as timed out |
//! | [`Error::DfuInProgress`] | Second firmware update requested | Wait for the first to finish |
//! | [`Error::Parse`] | Bad command argument | Fix the argument |

use std::time::Duration;

use thiserror::Error;

use tagwatch_types::{InvalidTransition, ParseError};

/// Errors that can occur while coordinating tracker tags.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from btleplug.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Radio adapter error that did not come from btleplug.
    #[error("Radio error: {0}")]
    Radio(String),

    /// No adapter or no device for the given identifier.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation attempted while the link is down.
    #[error("Not connected to device")]
    NotConnected,

    /// Characteristic missing from the discovered services.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A firmware update is already running.
    #[error("Firmware update already in progress for {0}")]
    DfuInProgress(String),

    /// A state input had no edge from the current state.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Command argument or received data could not be encoded / decoded.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Record store read or write failed.
    #[error("Record store error: {0}")]
    Store(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(identifier.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>) -> Self {
        Self::CharacteristicNotFound { uuid: uuid.into() }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a radio error with a message.
    pub fn radio(message: impl Into<String>) -> Self {
        Self::Radio(message.into())
    }

    /// Whether the error is a transient radio condition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Bluetooth(_)
                | Error::Radio(_)
                | Error::NotConnected
                | Error::Timeout { .. }
                | Error::DeviceNotFound(_)
        )
    }
}

/// Result type alias using tagwatch-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use tagwatch_types::{ConnectionState, StateInput};

    #[test]
    fn test_error_display() {
        let err = Error::device_not_found("E50E24DCCA9E");
        assert!(err.to_string().contains("E50E24DCCA9E"));

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to device");

        let err = Error::timeout("write set_alert_mode", Duration::from_secs(10));
        assert!(err.to_string().contains("set_alert_mode"));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = ParseError::invalid_argument("rename", "name is empty").into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("rename"));
    }

    #[test]
    fn test_invalid_transition_conversion() {
        let invalid = ConnectionState::Disconnected
            .apply(StateInput::DidConnect)
            .unwrap_err();
        let err: Error = invalid.into();
        assert!(err.to_string().contains("DidConnect"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::NotConnected.is_transient());
        assert!(Error::radio("link lost").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::invalid_config("bad").is_transient());
    }
}
