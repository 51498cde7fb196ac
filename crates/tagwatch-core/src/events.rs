//! Typed event bus for collaborators.
//!
//! The coordinator publishes every lifecycle change here; UI layers and the
//! cloud-sync collaborator subscribe instead of observing device state.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tagwatch_types::{FirmwareVersion, LogicalId, PeripheralHandle};

/// Events emitted by the coordination core.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// A tracker was seen for the first time.
    Discovered {
        /// The new tag.
        device: LogicalId,
        /// Advertised name.
        name: Option<String>,
        /// Advertised RSSI in dBm.
        rssi: Option<i16>,
    },
    /// A tag advertising from its recovery bootloader was seen.
    RecoveryObserved {
        /// Radio handle of the bootloader advertisement.
        handle: PeripheralHandle,
    },
    /// A recovery-mode tag has not been seen for the recovery prune interval.
    RecoveryCleared {
        /// Radio handle that went quiet.
        handle: PeripheralHandle,
    },
    /// Link established.
    Connected {
        /// The connected tag.
        device: LogicalId,
    },
    /// Connect attempt failed; the next tick retries.
    ConnectFailed {
        /// The tag that failed to connect.
        device: LogicalId,
        /// Radio error, if one was reported.
        error: Option<String>,
    },
    /// Link dropped; disconnect is deferred for the grace period.
    ReconnectScheduled {
        /// The tag that dropped.
        device: LogicalId,
        /// Seconds before the drop is reported.
        grace_secs: u64,
    },
    /// Disconnect finalized.
    Disconnected {
        /// The disconnected tag.
        device: LogicalId,
        /// Why the link ended.
        reason: DisconnectReason,
        /// Whether the user should be alerted (false under quiet policies).
        alert: bool,
    },
    /// Device pruned from the registry.
    SensorRemoved {
        /// The pruned tag.
        device: LogicalId,
    },
    /// Sustained weak signal switched the tag to high transmit power.
    AdaptivePowerEnabled {
        /// The tag that switched.
        device: LogicalId,
        /// Window mean that crossed the threshold, in dBm.
        average_rssi: i16,
    },
    /// Tag button pressed.
    ButtonPressed {
        /// The tag whose button was pressed.
        device: LogicalId,
        /// Number of clicks in the press.
        clicks: u8,
    },
    /// Tag reported its battery level.
    BatteryLevel {
        /// The reporting tag.
        device: LogicalId,
        /// Charge in percent.
        percent: u8,
    },
    /// Tag runs older firmware than the distribution service offers.
    FirmwareUpdatePending {
        /// The outdated tag.
        device: LogicalId,
        /// Version the tag runs.
        current: FirmwareVersion,
        /// Version on offer.
        latest: FirmwareVersion,
    },
    /// Persistent pairing failure detected; recovery writes queued.
    FdsRecoveryStarted {
        /// The tag being recovered.
        device: LogicalId,
    },
    /// Firmware update mode entered.
    DfuStarted {
        /// The tag being updated.
        device: LogicalId,
    },
    /// Firmware update mode left.
    DfuFinished {
        /// The tag that was updated.
        device: LogicalId,
        /// Whether the transfer completed.
        success: bool,
    },
}

impl DeviceEvent {
    /// Logical id the event refers to, if any.
    pub fn device(&self) -> Option<&LogicalId> {
        match self {
            DeviceEvent::Discovered { device, .. }
            | DeviceEvent::Connected { device }
            | DeviceEvent::ConnectFailed { device, .. }
            | DeviceEvent::ReconnectScheduled { device, .. }
            | DeviceEvent::Disconnected { device, .. }
            | DeviceEvent::SensorRemoved { device }
            | DeviceEvent::AdaptivePowerEnabled { device, .. }
            | DeviceEvent::ButtonPressed { device, .. }
            | DeviceEvent::BatteryLevel { device, .. }
            | DeviceEvent::FirmwareUpdatePending { device, .. }
            | DeviceEvent::FdsRecoveryStarted { device }
            | DeviceEvent::DfuStarted { device }
            | DeviceEvent::DfuFinished { device, .. } => Some(device),
            DeviceEvent::RecoveryObserved { .. } | DeviceEvent::RecoveryCleared { .. } => None,
        }
    }
}

/// Reason for a finalized disconnect.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Disconnect requested by the coordinator or user.
    UserRequested,
    /// Link dropped and did not come back within the grace period.
    LinkLost,
    /// Radio reported an error with the drop.
    BleError(String),
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> LogicalId {
        LogicalId::from_hardware_uuid("0000E50E24DCCA9E").unwrap()
    }

    #[test]
    fn test_event_serialization() {
        let event = DeviceEvent::Disconnected {
            device: id(),
            reason: DisconnectReason::LinkLost,
            alert: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"disconnected\""));
        assert!(json.contains("E50E24DCCA9E"));

        let back: DeviceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_device_accessor() {
        assert_eq!(DeviceEvent::Connected { device: id() }.device(), Some(&id()));
        let recovery = DeviceEvent::RecoveryCleared {
            handle: PeripheralHandle::new("AA:BB"),
        };
        assert_eq!(recovery.device(), None);
    }

    #[tokio::test]
    async fn test_dispatcher_fan_out() {
        let dispatcher = EventDispatcher::new(8);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(DeviceEvent::Connected { device: id() });
        assert_eq!(a.recv().await.unwrap(), DeviceEvent::Connected { device: id() });
        assert_eq!(b.recv().await.unwrap(), DeviceEvent::Connected { device: id() });
    }

    #[test]
    fn test_send_without_receivers() {
        let dispatcher = EventDispatcher::default();
        dispatcher.send(DeviceEvent::SensorRemoved { device: id() });
    }
}
