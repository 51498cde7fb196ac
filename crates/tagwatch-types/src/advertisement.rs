//! Advertisement markers and notify-characteristic frames.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Local name prefix of a tag sitting in the DFU bootloader.
pub const DFU_RECOVERY_NAME_PREFIX: &str = "DfuTarg";

/// First manufacturer-data byte flagging a persistent pairing failure.
pub const FDS_ERROR_MARKER: u8 = 0xFD;

/// Flags derived from one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdvertisementFlags {
    /// Tag is advertising from its firmware recovery bootloader.
    pub dfu_recovery: bool,
    /// Tag reports a flash data storage (pairing) error.
    pub fds_error: bool,
}

impl AdvertisementFlags {
    /// Derive flags from the advertised name and manufacturer data.
    pub fn from_advertisement(local_name: Option<&str>, manufacturer_data: Option<&[u8]>) -> Self {
        let dfu_recovery = local_name
            .map(|n| n.starts_with(DFU_RECOVERY_NAME_PREFIX))
            .unwrap_or(false);
        let fds_error = manufacturer_data
            .and_then(|d| d.first())
            .map(|b| *b == FDS_ERROR_MARKER)
            .unwrap_or(false);

        Self {
            dfu_recovery,
            fds_error,
        }
    }
}

/// Frame received on the notify characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum DeviceNotification {
    /// The tag button was pressed `clicks` times.
    ButtonPress {
        /// Number of presses in the burst.
        clicks: u8,
    },
    /// Battery level in percent.
    BatteryLevel {
        /// Level, 0-100.
        percent: u8,
    },
    /// The tag accepted the pairing code.
    PairingAccepted,
    /// The tag rejected the pairing code with a status byte.
    PairingRejected {
        /// Firmware status byte.
        status: u8,
    },
    /// Anything the table does not know.
    Unknown {
        /// Raw frame.
        raw: Vec<u8>,
    },
}

impl DeviceNotification {
    /// Decode a notify frame.
    pub fn decode(data: &[u8]) -> Self {
        match data {
            [0xB1, clicks, ..] => DeviceNotification::ButtonPress { clicks: *clicks },
            [0xB2, percent, ..] => DeviceNotification::BatteryLevel {
                percent: (*percent).min(100),
            },
            [0xA7, 0x00, ..] => DeviceNotification::PairingAccepted,
            [0xA7, status, ..] => DeviceNotification::PairingRejected { status: *status },
            _ => DeviceNotification::Unknown { raw: data.to_vec() },
        }
    }
}
