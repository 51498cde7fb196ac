//! Command frames written to the tracker control characteristic.
//!
//! Every frame is a one-byte opcode followed by at least one argument byte.
//! The opcode values are fixed by the tag firmware and must be preserved
//! bit for bit.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::types::AlertMode;

/// Maximum payload the firmware accepts in one write (default ATT MTU - 3).
pub const MAX_FRAME_LEN: usize = 20;

/// Opcodes understood by the tag firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Buzz / blink control.
    Alert = 0xA1,
    /// Separation alert loudness.
    AlertMode = 0xA2,
    /// Camera shutter remote.
    Camera = 0xA3,
    /// Remove the tag from its owner.
    Deregister = 0xA5,
    /// Ask the tag to drop the link itself.
    ManualDisconnect = 0xA6,
    /// Pairing code.
    PairingCode = 0xA7,
    /// Advertised name.
    Rename = 0xA8,
    /// Buzz duration in seconds.
    BuzzDuration = 0xAB,
    /// Blink duration in seconds.
    BlinkDuration = 0xAE,
    /// Transmit power.
    TxPower = 0xC2,
    /// Low-power adaptive connection negotiation.
    AdaptiveMode = 0xCE,
    /// Pick-pocket buffer timing.
    PickPocket = 0xE1,
}

impl Opcode {
    /// The wire byte.
    pub const fn byte(self) -> u8 {
        self as u8
    }
}

/// Argument bytes for [`Opcode::Alert`].
pub mod alert {
    /// Buzz only.
    pub const BUZZ: u8 = 0x01;
    /// Blink only.
    pub const BLINK: u8 = 0x02;
    /// Buzz and blink.
    pub const BUZZ_AND_BLINK: u8 = 0x03;
    /// Stop any running alert.
    pub const STOP: u8 = 0x04;
}

/// Argument bytes for [`Opcode::AlertMode`].
pub mod alert_mode {
    /// Low alert.
    pub const LOW: u8 = 0x00;
    /// High alert.
    pub const HIGH: u8 = 0x03;
}

/// Argument bytes for [`Opcode::Camera`].
pub mod camera {
    /// Camera mode on.
    pub const ON: u8 = 0x01;
    /// Camera mode off.
    pub const OFF: u8 = 0x02;
}

/// A command the coordinator can write to a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "command", content = "value", rename_all = "snake_case"))]
pub enum Command {
    /// Buzz only.
    Buzz,
    /// Blink only.
    Blink,
    /// Buzz and blink together.
    BuzzAndBlink,
    /// Stop buzzing / blinking.
    StopBuzz,
    /// Set the separation alert loudness.
    SetAlertMode(AlertMode),
    /// Toggle camera remote mode.
    Camera(bool),
    /// Remove the tag from its owner.
    Deregister,
    /// Ask the tag to drop the link.
    ManualDisconnect,
    /// Write the pairing code (hex string).
    WritePairingCode(String),
    /// Rename the tag.
    Rename(String),
    /// Buzz duration in seconds.
    SetBuzzDuration(u8),
    /// Blink duration in seconds.
    SetBlinkDuration(u8),
    /// Enable or disable high transmit power.
    SetTxPower(bool),
    /// Enable or disable the low-power adaptive negotiation.
    SetAdaptiveMode(bool),
    /// Enable pick-pocket mode with the given buffer seconds, or disable it.
    SetPickPocketMode {
        /// Whether pick-pocket mode is on.
        enabled: bool,
        /// Buffer before a separation alert fires.
        buffer_secs: u8,
    },
}

impl Command {
    /// The opcode this command is written with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Buzz | Command::Blink | Command::BuzzAndBlink | Command::StopBuzz => {
                Opcode::Alert
            }
            Command::SetAlertMode(_) => Opcode::AlertMode,
            Command::Camera(_) => Opcode::Camera,
            Command::Deregister => Opcode::Deregister,
            Command::ManualDisconnect => Opcode::ManualDisconnect,
            Command::WritePairingCode(_) => Opcode::PairingCode,
            Command::Rename(_) => Opcode::Rename,
            Command::SetBuzzDuration(_) => Opcode::BuzzDuration,
            Command::SetBlinkDuration(_) => Opcode::BlinkDuration,
            Command::SetTxPower(_) => Opcode::TxPower,
            Command::SetAdaptiveMode(_) => Opcode::AdaptiveMode,
            Command::SetPickPocketMode { .. } => Opcode::PickPocket,
        }
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Buzz => "buzz",
            Command::Blink => "blink",
            Command::BuzzAndBlink => "buzz_and_blink",
            Command::StopBuzz => "stop_buzz",
            Command::SetAlertMode(_) => "set_alert_mode",
            Command::Camera(_) => "camera",
            Command::Deregister => "deregister",
            Command::ManualDisconnect => "manual_disconnect",
            Command::WritePairingCode(_) => "write_pairing_code",
            Command::Rename(_) => "rename",
            Command::SetBuzzDuration(_) => "set_buzz_duration",
            Command::SetBlinkDuration(_) => "set_blink_duration",
            Command::SetTxPower(_) => "set_tx_power",
            Command::SetAdaptiveMode(_) => "set_adaptive_mode",
            Command::SetPickPocketMode { .. } => "set_pick_pocket_mode",
        }
    }

    /// Whether the tag answers this command on the notify characteristic.
    ///
    /// The queue subscribes to notifications for the duration of these writes.
    pub fn expects_response(&self) -> bool {
        matches!(self, Command::WritePairingCode(_) | Command::Deregister)
    }

    /// Encode the command into its wire frame.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagwatch_types::{AlertMode, Command};
    ///
    /// assert_eq!(Command::SetAlertMode(AlertMode::High).encode().unwrap(), vec![0xA2, 0x03]);
    /// assert_eq!(Command::SetBuzzDuration(10).encode().unwrap(), vec![0xAB, 0x0A]);
    /// assert_eq!(Command::Rename("Fido".into()).encode().unwrap(), b"\xA8Fido".to_vec());
    /// ```
    pub fn encode(&self) -> ParseResult<Vec<u8>> {
        let op = self.opcode().byte();
        let frame = match self {
            Command::Buzz => vec![op, alert::BUZZ],
            Command::Blink => vec![op, alert::BLINK],
            Command::BuzzAndBlink => vec![op, alert::BUZZ_AND_BLINK],
            Command::StopBuzz => vec![op, alert::STOP],
            Command::SetAlertMode(AlertMode::Low) => vec![op, alert_mode::LOW],
            Command::SetAlertMode(AlertMode::High) => vec![op, alert_mode::HIGH],
            Command::Camera(true) => vec![op, camera::ON],
            Command::Camera(false) => vec![op, camera::OFF],
            Command::Deregister | Command::ManualDisconnect => vec![op, 0x01],
            Command::WritePairingCode(code) => {
                let mut frame = vec![op];
                frame.extend(encode_pairing_code(code)?);
                frame
            }
            Command::Rename(name) => {
                let mut frame = vec![op];
                frame.extend_from_slice(truncate_name(name)?.as_bytes());
                frame
            }
            Command::SetBuzzDuration(secs) | Command::SetBlinkDuration(secs) => {
                if *secs == 0 {
                    return Err(ParseError::invalid_argument(
                        self.name(),
                        "duration must be at least 1 second",
                    ));
                }
                vec![op, *secs]
            }
            Command::SetTxPower(high) => vec![op, u8::from(*high)],
            Command::SetAdaptiveMode(enabled) => vec![op, u8::from(*enabled)],
            Command::SetPickPocketMode {
                enabled,
                buffer_secs,
            } => {
                if *enabled {
                    vec![op, (*buffer_secs).max(1)]
                } else {
                    vec![op, 0x00]
                }
            }
        };

        if frame.len() > MAX_FRAME_LEN {
            return Err(ParseError::invalid_argument(
                self.name(),
                format!("frame is {} bytes, limit is {}", frame.len(), MAX_FRAME_LEN),
            ));
        }

        Ok(frame)
    }
}

/// Pack a hex pairing code into bytes, one nibble per character.
///
/// Odd-length codes are left-padded with a zero nibble.
pub fn encode_pairing_code(code: &str) -> ParseResult<Vec<u8>> {
    let code = code.trim();
    if code.is_empty() {
        return Err(ParseError::invalid_argument(
            "write_pairing_code",
            "pairing code is empty",
        ));
    }

    let mut nibbles = Vec::with_capacity(code.len() + 1);
    if code.len() % 2 == 1 {
        nibbles.push(0u8);
    }
    for c in code.chars() {
        let nibble = c.to_digit(16).ok_or_else(|| {
            ParseError::invalid_argument(
                "write_pairing_code",
                format!("'{}' is not a hex digit", c),
            )
        })?;
        nibbles.push(nibble as u8);
    }

    Ok(nibbles.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

/// Trim a name to what fits after the rename opcode, on a char boundary.
fn truncate_name(name: &str) -> ParseResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ParseError::invalid_argument("rename", "name is empty"));
    }

    let limit = MAX_FRAME_LEN - 1;
    if name.len() <= limit {
        return Ok(name);
    }

    let mut end = limit;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    Ok(&name[..end])
}
