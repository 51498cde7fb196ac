//! Radio adapter boundary.
//!
//! The coordination core never talks to a Bluetooth stack directly. It
//! issues commands through [`RadioAdapter`] and consumes the adapter's
//! [`RadioEvent`] stream. [`crate::BtleplugRadio`] implements the trait over
//! the system adapter and [`crate::MockRadio`] implements it for tests.

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use tagwatch_types::{AdvertisementFlags, PeripheralHandle};

use crate::error::Result;

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Wait for the peripheral to acknowledge the write.
    WithResponse,
    /// Fire and forget.
    WithoutResponse,
}

/// Asynchronous event delivered by a radio adapter.
///
/// Adapters deliver events in the order the stack reports them, on a single
/// broadcast channel shared by all peripherals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Advertisement received.
    Discovered {
        /// Peripheral that advertised.
        handle: PeripheralHandle,
        /// Hardware identifier the logical id is derived from.
        advertised_id: String,
        /// Advertised local name.
        name: Option<String>,
        /// Signal strength of the advertisement in dBm.
        rssi: Option<i16>,
        /// Flags decoded from the advertisement payload.
        flags: AdvertisementFlags,
    },
    /// Link established.
    Connected {
        /// Peripheral that connected.
        handle: PeripheralHandle,
    },
    /// Link closed, either requested or dropped.
    Disconnected {
        /// Peripheral that disconnected.
        handle: PeripheralHandle,
        /// Stack error, absent for a clean close.
        error: Option<String>,
    },
    /// Connect attempt failed.
    FailedToConnect {
        /// Peripheral the attempt targeted.
        handle: PeripheralHandle,
        /// Stack error, if one was reported.
        error: Option<String>,
    },
    /// Notification or indication on a subscribed characteristic.
    CharacteristicUpdated {
        /// Peripheral that notified.
        handle: PeripheralHandle,
        /// Characteristic the value arrived on.
        characteristic: Uuid,
        /// Raw value.
        value: Vec<u8>,
    },
    /// Result of [`RadioAdapter::read_rssi`].
    RssiRead {
        /// Peripheral that was read.
        handle: PeripheralHandle,
        /// Connection RSSI in dBm.
        rssi: i16,
    },
}

impl RadioEvent {
    /// Peripheral the event refers to.
    pub fn handle(&self) -> &PeripheralHandle {
        match self {
            RadioEvent::Discovered { handle, .. }
            | RadioEvent::Connected { handle }
            | RadioEvent::Disconnected { handle, .. }
            | RadioEvent::FailedToConnect { handle, .. }
            | RadioEvent::CharacteristicUpdated { handle, .. }
            | RadioEvent::RssiRead { handle, .. } => handle,
        }
    }
}

/// Operations a radio stack must provide.
///
/// `connect` and `disconnect` only issue the request; the outcome arrives
/// as a [`RadioEvent`]. Writes and reads resolve when the stack reports
/// completion.
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    /// Start scanning for peripherals advertising any of `service_filter`.
    ///
    /// An empty filter scans for everything.
    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Request a connection.
    async fn connect(&self, handle: &PeripheralHandle) -> Result<()>;

    /// Request a disconnection.
    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()>;

    /// Discover GATT services on a connected peripheral.
    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<()>;

    /// Write a characteristic value.
    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<()>;

    /// Read a characteristic value.
    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>>;

    /// Enable or disable notifications on a characteristic.
    async fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()>;

    /// Request an RSSI read; the value arrives as [`RadioEvent::RssiRead`].
    async fn read_rssi(&self, handle: &PeripheralHandle) -> Result<()>;

    /// Subscribe to the adapter's event stream.
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;
}
