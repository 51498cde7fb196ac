//! Event bus logging.

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tagwatch_core::{DeviceEvent, DisconnectReason, EventReceiver};

/// One-line human readable description of an event.
pub fn summarize(event: &DeviceEvent) -> String {
    match event {
        DeviceEvent::Discovered { device, name, rssi } => {
            let mut line = format!("{} discovered", device);
            if let Some(name) = name {
                line.push_str(&format!(" as '{}'", name));
            }
            if let Some(rssi) = rssi {
                line.push_str(&format!(" ({} dBm)", rssi));
            }
            line
        }
        DeviceEvent::RecoveryObserved { handle } => {
            format!("{} advertising in firmware recovery mode", handle)
        }
        DeviceEvent::RecoveryCleared { handle } => format!("{} left firmware recovery mode", handle),
        DeviceEvent::Connected { device } => format!("{} connected", device),
        DeviceEvent::ConnectFailed { device, error } => match error {
            Some(e) => format!("{} failed to connect: {}", device, e),
            None => format!("{} failed to connect", device),
        },
        DeviceEvent::ReconnectScheduled { device, grace_secs } => {
            format!("{} link dropped, waiting {}s to reconnect", device, grace_secs)
        }
        DeviceEvent::Disconnected {
            device,
            reason,
            alert,
        } => {
            let reason = match reason {
                DisconnectReason::UserRequested => "requested".to_string(),
                DisconnectReason::LinkLost => "link lost".to_string(),
                DisconnectReason::BleError(e) => e.clone(),
                other => format!("{:?}", other),
            };
            let alert = if *alert { "" } else { " (silent)" };
            format!("{} disconnected: {}{}", device, reason, alert)
        }
        DeviceEvent::SensorRemoved { device } => format!("{} removed", device),
        DeviceEvent::AdaptivePowerEnabled {
            device,
            average_rssi,
        } => format!(
            "{} switched to high transmit power (average {} dBm)",
            device, average_rssi
        ),
        DeviceEvent::ButtonPressed { device, clicks } => {
            format!("{} button pressed {}x", device, clicks)
        }
        DeviceEvent::BatteryLevel { device, percent } => {
            format!("{} battery at {}%", device, percent)
        }
        DeviceEvent::FirmwareUpdatePending {
            device,
            current,
            latest,
        } => format!("{} runs firmware {}, {} is available", device, current, latest),
        DeviceEvent::FdsRecoveryStarted { device } => {
            format!("{} pairing storage corrupt, recovering", device)
        }
        DeviceEvent::DfuStarted { device } => format!("{} firmware update started", device),
        DeviceEvent::DfuFinished { device, success } => {
            let outcome = if *success { "finished" } else { "failed" };
            format!("{} firmware update {}", device, outcome)
        }
        other => format!("{:?}", other),
    }
}

/// Log every event until `cancel` fires or the bus closes.
///
/// With `json` set each event is also printed to stdout as one JSON line.
pub async fn log_events(mut events: EventReceiver, json: bool, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if is_alert(&event) {
                        warn!(device = ?event.device(), "{}", summarize(&event));
                    } else {
                        info!(device = ?event.device(), "{}", summarize(&event));
                    }
                    if json {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("Failed to serialize event: {}", e),
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event log lagged, {} events dropped", missed);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn is_alert(event: &DeviceEvent) -> bool {
    matches!(
        event,
        DeviceEvent::Disconnected { alert: true, .. }
            | DeviceEvent::ConnectFailed { .. }
            | DeviceEvent::FdsRecoveryStarted { .. }
            | DeviceEvent::DfuFinished { success: false, .. }
    )
}
