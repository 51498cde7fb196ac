//! Connection and command coordination core for BLE tracker tags.
//!
//! This crate keeps a fleet of small Bluetooth tags connected, configured
//! and accounted for. It sits between a radio stack and the application:
//! the radio reports advertisements and link changes, the application
//! receives [`DeviceEvent`]s and issues commands.
//!
//! # Features
//!
//! - **Discovery**: advertisements deduplicated by a stable [`LogicalId`]
//! - **Connection policy**: a periodic tick reconnects eligible tags
//! - **Reconnect grace**: short drops are hidden; only drops that outlast
//!   the firmware-dependent grace period are reported
//! - **Command queue**: one GATT write in flight per tag, in order
//! - **Adaptive power**: weak links switch the tag to high transmit power
//! - **Firmware update mode**: scanning and auto-connect pause during DFU
//!
//! # Architecture
//!
//! ```text
//! RadioAdapter ──RadioEvent──▶ ConnectionCoordinator ──DeviceEvent──▶ app
//!      ▲                         │        │
//!      │                 DeviceRegistry  ReconnectScheduler
//!      │                         │
//!      └──── CommandQueue ◀── TrackerDevice
//! ```
//!
//! [`BtleplugRadio`] drives the system Bluetooth adapter; [`MockRadio`]
//! stands in for it in tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tagwatch_core::{
//!     BtleplugRadio, ConnectionCoordinator, CoordinatorConfig, FixedLocation,
//!     MemoryRemoteRegistry, MemoryStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = Arc::new(BtleplugRadio::new().await?);
//!     let coordinator = Arc::new(ConnectionCoordinator::new(
//!         radio,
//!         Arc::new(MemoryRemoteRegistry::default()),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(FixedLocation::default()),
//!         CoordinatorConfig::default().user_id("alice"),
//!     )?);
//!
//!     let mut events = coordinator.events().subscribe();
//!     let task = coordinator.start(CancellationToken::new());
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod dfu;
pub mod error;
pub mod events;
pub mod mock;
pub mod policy;
pub mod queue;
pub mod radio;
pub mod reconnect;
pub mod registry;
pub mod remote;
pub mod rssi;
pub mod store;

// Core exports
pub use btle::BtleplugRadio;
pub use config::{CoordinatorConfig, ScanConfig};
pub use coordinator::ConnectionCoordinator;
pub use device::{
    DeviceConfig, DeviceSnapshot, DisplayState, TrackerDevice, fds_recovery_sequence,
    post_connect_sequence,
};
pub use error::{Error, Result};
pub use events::{DeviceEvent, DisconnectReason, EventDispatcher, EventReceiver, EventSender};
pub use radio::{RadioAdapter, RadioEvent, WriteKind};
pub use registry::{DeviceRegistry, Observation};

pub use dfu::{DfuCoordinator, DfuGuard, FirmwareTransfer};
pub use mock::{MockRadio, RecordedWrite};
pub use policy::{PolicyFlags, PolicyMode, commands_for_policy};
pub use queue::{CommandQueue, Operation, OperationOutcome, PendingOperation, QueueConfig};
pub use reconnect::{ReconnectPolicy, ReconnectScheduler};
pub use remote::{LinkStatus, MemoryRemoteRegistry, RemoteDeviceRecord, RemoteRegistry, Sharing};
pub use rssi::{RssiConfig, RssiWindow, spawn_sampler};
pub use store::{
    DeviceRecord, FixedLocation, Location, LocationProvider, MAX_NOTIFICATIONS, MemoryStore,
    NotificationEntry, NotificationKind, RecordStore,
};

/// Shared reference to a tracked device.
pub type SharedDevice = std::sync::Arc<TrackerDevice>;

// Re-export from tagwatch-types
pub use tagwatch_types::uuid as uuids;
pub use tagwatch_types::{
    AdvertisementFlags, AlertMode, Command, ConnectionState, DeviceNotification, FirmwareVersion,
    LogicalId, PeripheralHandle, StateInput,
};
