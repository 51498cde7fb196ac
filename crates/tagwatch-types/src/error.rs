//! Error types for data parsing and frame encoding in tagwatch-types.

use thiserror::Error;

/// Errors that can occur when parsing tracker data or building command frames.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in tagwatch-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Data did not match the expected shape.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A firmware version string could not be parsed.
    #[error("Invalid firmware version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    /// A command argument was outside the range the firmware accepts.
    #[error("Invalid argument for {command}: {reason}")]
    InvalidArgument {
        /// The command being encoded.
        command: &'static str,
        /// Why the argument was rejected.
        reason: String,
    },
}

impl ParseError {
    /// Create an invalid-argument error for a command.
    pub fn invalid_argument(command: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            command,
            reason: reason.into(),
        }
    }
}

/// Result type alias using tagwatch-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
