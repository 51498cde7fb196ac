//! Bluetooth UUIDs for tracker tags and the characteristic routing table.
//!
//! All tracker traffic goes through one custom service: commands are written
//! to the control characteristic, the tag answers on the notify
//! characteristic. The firmware revision comes from the standard Device
//! Information service.

use uuid::{Uuid, uuid};

// --- Tracker Service ---

/// Custom tracker service.
pub const TRACKER_SERVICE: Uuid = uuid!("0000ffe0-0000-1000-8000-00805f9b34fb");

/// Control characteristic (write with response).
pub const CONTROL_CHARACTERISTIC: Uuid = uuid!("0000ffe1-0000-1000-8000-00805f9b34fb");

/// Notify characteristic (button presses, pairing acks, battery).
pub const NOTIFY_CHARACTERISTIC: Uuid = uuid!("0000ffe2-0000-1000-8000-00805f9b34fb");

// --- Standard services ---

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Firmware revision string characteristic.
pub const FIRMWARE_REVISION: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");

/// Nordic secure DFU service, advertised by tags stuck in the bootloader.
pub const DFU_SERVICE: Uuid = uuid!("0000fe59-0000-1000-8000-00805f9b34fb");

/// Characteristics the core knows how to route.
///
/// Lookups go through [`GattCharacteristic::from_uuid`] so the rest of the
/// code matches on this enum instead of comparing UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattCharacteristic {
    /// Tracker control characteristic.
    Control,
    /// Tracker notify characteristic.
    Notify,
    /// Device Information firmware revision.
    FirmwareRevision,
}

const ROUTES: [(Uuid, Uuid, GattCharacteristic); 3] = [
    (
        TRACKER_SERVICE,
        CONTROL_CHARACTERISTIC,
        GattCharacteristic::Control,
    ),
    (
        TRACKER_SERVICE,
        NOTIFY_CHARACTERISTIC,
        GattCharacteristic::Notify,
    ),
    (
        DEVICE_INFO_SERVICE,
        FIRMWARE_REVISION,
        GattCharacteristic::FirmwareRevision,
    ),
];

impl GattCharacteristic {
    /// Resolve a characteristic UUID.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        ROUTES
            .iter()
            .find(|(_, c, _)| *c == uuid)
            .map(|(_, _, route)| *route)
    }

    /// Characteristic UUID.
    pub fn uuid(self) -> Uuid {
        match self {
            GattCharacteristic::Control => CONTROL_CHARACTERISTIC,
            GattCharacteristic::Notify => NOTIFY_CHARACTERISTIC,
            GattCharacteristic::FirmwareRevision => FIRMWARE_REVISION,
        }
    }

    /// Service the characteristic lives in.
    pub fn service(self) -> Uuid {
        ROUTES
            .iter()
            .find(|(_, _, route)| *route == self)
            .map(|(s, _, _)| *s)
            .unwrap_or(TRACKER_SERVICE)
    }
}
