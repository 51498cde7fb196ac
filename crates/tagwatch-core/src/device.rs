//! Per-tag state and command surface.
//!
//! A [`TrackerDevice`] owns one tag's connection state, configuration, link
//! quality window and [`CommandQueue`]. Connection state only moves through
//! [`TrackerDevice::apply`], which runs the pure transition function and
//! hands the resulting effects back to the coordinator.
//!
//! Every command method enqueues exactly one operation and returns its
//! [`PendingOperation`]; callers that do not care about the outcome can
//! drop it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tagwatch_types::{
    AlertMode, Command, ConnectionState, FirmwareVersion, LogicalId, PeripheralHandle, StateInput,
    Transition,
};

use crate::error::Result;
use crate::policy::{PolicyFlags, commands_for_policy};
use crate::queue::{CommandQueue, Operation, PendingOperation, QueueConfig};
use crate::radio::RadioAdapter;
use crate::remote::RemoteDeviceRecord;
use crate::rssi::{RssiConfig, RssiWindow, spawn_sampler};

/// Configuration pushed to a tag on every connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Pairing code (hex string).
    pub pairing_code: Option<String>,
    /// Alert mode used when no policy overrides it.
    pub alert_mode: AlertMode,
    /// Buzz duration in seconds.
    pub buzz_duration: Option<u8>,
    /// Blink duration in seconds.
    pub blink_duration: Option<u8>,
    /// Nickname written as the tag name.
    pub nickname: Option<String>,
}

impl From<&RemoteDeviceRecord> for DeviceConfig {
    fn from(record: &RemoteDeviceRecord) -> Self {
        Self {
            pairing_code: record.pairing_code.clone(),
            alert_mode: record.alert_mode,
            buzz_duration: record.buzz_duration,
            blink_duration: record.blink_duration,
            nickname: record.nickname.clone(),
        }
    }
}

/// Connection state as surfaced to collaborators.
///
/// Adds `Reconnecting` on top of [`ConnectionState`]: the radio says
/// disconnected but the drop is still inside its grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    /// No link and no pending reconnect.
    Disconnected,
    /// Connection attempt in flight.
    Connecting,
    /// Link is up.
    Connected,
    /// Disconnect requested, waiting for the radio.
    Disconnecting,
    /// Link dropped, grace timer running.
    Reconnecting,
}

/// Point-in-time view of a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Logical id.
    pub id: LogicalId,
    /// Radio handle the tag was last seen under.
    pub handle: PeripheralHandle,
    /// Advertised name.
    pub name: Option<String>,
    /// Connection state.
    pub state: DisplayState,
    /// Firmware version, once read.
    pub firmware: Option<FirmwareVersion>,
    /// Battery percentage, once read.
    pub battery: Option<u8>,
    /// Latest RSSI, from the connection if connected, else from advertising.
    pub rssi: Option<i16>,
    /// Mean of the connection RSSI window.
    pub average_rssi: Option<i16>,
    /// High transmit power enabled on this connection.
    pub high_power: bool,
}

#[derive(Debug)]
struct DeviceState {
    connection: ConnectionState,
    name: Option<String>,
    config: DeviceConfig,
    link: RssiWindow,
    advertised_rssi: Option<i16>,
    firmware: Option<FirmwareVersion>,
    battery: Option<u8>,
    last_seen: Instant,
    last_activity: Instant,
    fds_error: bool,
    reconnect_pending: bool,
    sampler: Option<CancellationToken>,
}

/// One physical tracker tag.
pub struct TrackerDevice {
    id: LogicalId,
    handle: PeripheralHandle,
    radio: Arc<dyn RadioAdapter>,
    queue: CommandQueue,
    rssi_config: RssiConfig,
    state: RwLock<DeviceState>,
}

impl std::fmt::Debug for TrackerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerDevice")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}

impl TrackerDevice {
    /// Create a disconnected device.
    pub fn new(
        id: LogicalId,
        handle: PeripheralHandle,
        radio: Arc<dyn RadioAdapter>,
        queue_config: QueueConfig,
        rssi_config: RssiConfig,
    ) -> Self {
        let now = Instant::now();
        let queue = CommandQueue::new(handle.clone(), Arc::clone(&radio), queue_config);
        Self {
            state: RwLock::new(DeviceState {
                connection: ConnectionState::Disconnected,
                name: None,
                config: DeviceConfig::default(),
                link: RssiWindow::new(&rssi_config),
                advertised_rssi: None,
                firmware: None,
                battery: None,
                last_seen: now,
                last_activity: now,
                fds_error: false,
                reconnect_pending: false,
                sampler: None,
            }),
            id,
            handle,
            radio,
            queue,
            rssi_config,
        }
    }

    /// Logical id.
    pub fn id(&self) -> &LogicalId {
        &self.id
    }

    /// Radio handle.
    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// The device's command queue.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// A copy of this device bound to a new radio handle.
    ///
    /// Configuration, firmware, timestamps and recovery flags carry over;
    /// the copy starts disconnected with an empty queue and RSSI window.
    pub async fn rebind(&self, handle: PeripheralHandle) -> TrackerDevice {
        let mut rebound = TrackerDevice::new(
            self.id.clone(),
            handle,
            Arc::clone(&self.radio),
            self.queue.config().clone(),
            self.rssi_config.clone(),
        );
        let old = self.state.read().await;
        let state = rebound.state.get_mut();
        state.name = old.name.clone();
        state.config = old.config.clone();
        state.advertised_rssi = old.advertised_rssi;
        state.firmware = old.firmware;
        state.battery = old.battery;
        state.last_seen = old.last_seen;
        state.last_activity = old.last_activity;
        state.fds_error = old.fds_error;
        state.reconnect_pending = old.reconnect_pending;
        drop(old);
        rebound
    }

    // --- State machine ---

    /// Feed an input to the connection state machine.
    ///
    /// On success the new state is stored and the transition returned so the
    /// caller can perform its effects. An input with no edge from the
    /// current state leaves the state untouched.
    pub async fn apply(&self, input: StateInput) -> Result<Transition> {
        let mut state = self.state.write().await;
        let from = state.connection;
        let transition = from.apply(input)?;
        state.connection = transition.next;
        if from != transition.next {
            debug!(device = %self.id, %from, to = %transition.next, ?input, "State transition");
        }
        Ok(transition)
    }

    /// Radio-level connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }

    /// Whether the link is up.
    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// State surfaced to collaborators.
    pub async fn display_state(&self) -> DisplayState {
        let state = self.state.read().await;
        match state.connection {
            ConnectionState::Disconnected if state.reconnect_pending => DisplayState::Reconnecting,
            ConnectionState::Disconnected => DisplayState::Disconnected,
            ConnectionState::Connecting => DisplayState::Connecting,
            ConnectionState::Connected => DisplayState::Connected,
            ConnectionState::Disconnecting => DisplayState::Disconnecting,
        }
    }

    /// Current view of the device.
    pub async fn snapshot(&self) -> DeviceSnapshot {
        let display = self.display_state().await;
        let state = self.state.read().await;
        DeviceSnapshot {
            id: self.id.clone(),
            handle: self.handle.clone(),
            name: state.name.clone(),
            state: display,
            firmware: state.firmware,
            battery: state.battery,
            rssi: state.link.last().or(state.advertised_rssi),
            average_rssi: state.link.average(),
            high_power: state.link.is_high_power(),
        }
    }

    // --- Timestamps and advertisement data ---

    /// Record an advertisement: refreshes last-seen, name and RSSI.
    pub async fn update_advertisement(&self, name: Option<String>, rssi: Option<i16>) {
        let mut state = self.state.write().await;
        state.last_seen = Instant::now();
        if name.is_some() {
            state.name = name;
        }
        if rssi.is_some() {
            state.advertised_rssi = rssi;
        }
    }

    /// Refresh the activity timestamp.
    pub async fn touch_activity(&self) {
        self.state.write().await.last_activity = Instant::now();
    }

    /// When the tag last advertised.
    pub async fn last_seen(&self) -> Instant {
        self.state.read().await.last_seen
    }

    /// Most recent of last-seen and last-activity.
    pub async fn last_heard(&self) -> Instant {
        let state = self.state.read().await;
        state.last_seen.max(state.last_activity)
    }

    // --- Reported values ---

    /// Firmware reported by the tag.
    pub async fn firmware(&self) -> Option<FirmwareVersion> {
        self.state.read().await.firmware
    }

    /// Record the firmware version read from the tag.
    pub async fn set_firmware(&self, version: FirmwareVersion) {
        self.state.write().await.firmware = Some(version);
    }

    /// Battery level reported by the tag.
    pub async fn battery(&self) -> Option<u8> {
        self.state.read().await.battery
    }

    /// Record the battery level read from the tag.
    pub async fn set_battery(&self, percent: u8) {
        self.state.write().await.battery = Some(percent);
    }

    /// Flag a persistent pairing failure. Returns whether the flag was newly set.
    pub async fn mark_fds_error(&self) -> bool {
        let mut state = self.state.write().await;
        !std::mem::replace(&mut state.fds_error, true)
    }

    /// Clear the pairing failure flag, returning whether it was set.
    pub async fn take_fds_error(&self) -> bool {
        std::mem::take(&mut self.state.write().await.fds_error)
    }

    /// Whether the pairing failure flag is set.
    pub async fn has_fds_error(&self) -> bool {
        self.state.read().await.fds_error
    }

    /// Whether a reconnect grace timer is running for this device.
    pub async fn reconnect_pending(&self) -> bool {
        self.state.read().await.reconnect_pending
    }

    /// Mark or clear a running reconnect grace timer.
    pub async fn set_reconnect_pending(&self, pending: bool) {
        self.state.write().await.reconnect_pending = pending;
    }

    // --- Configuration ---

    /// Configuration pushed on connect.
    pub async fn config(&self) -> DeviceConfig {
        self.state.read().await.config.clone()
    }

    /// Replace the configuration pushed on connect.
    ///
    /// Nothing is written to the tag until the next connect or an explicit
    /// command.
    pub async fn configure(&self, config: DeviceConfig) {
        self.state.write().await.config = config;
    }

    // --- Link quality ---

    /// Feed an RSSI reading from the connection.
    ///
    /// Ignored unless connected. When the sliding window first crosses the
    /// threshold the low-power adaptive negotiation is switched off and high
    /// transmit power on, and the window mean is returned.
    pub async fn record_rssi(&self, rssi: i16) -> Result<Option<i16>> {
        let verdict = {
            let mut state = self.state.write().await;
            if state.connection != ConnectionState::Connected {
                return Ok(None);
            }
            state.link.push(rssi)
        };

        if let Some(average) = verdict {
            info!(device = %self.id, average, "Weak link, enabling high transmit power");
            self.queue.enqueue(Command::SetAdaptiveMode(false)).await?;
            self.queue.enqueue(Command::SetTxPower(true)).await?;
        }
        Ok(verdict)
    }

    /// Discard the RSSI window and the high-power flag.
    pub async fn reset_link_quality(&self) {
        self.state.write().await.link.reset();
    }

    /// Samples in the RSSI window.
    pub async fn rssi_samples(&self) -> usize {
        self.state.read().await.link.len()
    }

    /// Whether high transmit power was enabled on this connection.
    pub async fn is_high_power(&self) -> bool {
        self.state.read().await.link.is_high_power()
    }

    /// Start periodic RSSI reads, replacing any running sampler.
    ///
    /// The sampler stops when `parent` is cancelled.
    pub async fn start_rssi_sampling(&self, parent: &CancellationToken) {
        let token = parent.child_token();
        let previous = self.state.write().await.sampler.replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        spawn_sampler(
            Arc::clone(&self.radio),
            self.handle.clone(),
            self.rssi_config.interval,
            token,
        );
    }

    /// Stop periodic RSSI reads.
    pub async fn stop_rssi_sampling(&self) {
        if let Some(token) = self.state.write().await.sampler.take() {
            token.cancel();
        }
    }

    /// Whether a sampler is running.
    pub async fn is_sampling(&self) -> bool {
        self.state
            .read()
            .await
            .sampler
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    // --- Session ---

    /// Cancel queued commands left over from a previous session.
    pub async fn reset_session(&self) -> usize {
        self.queue.clear().await
    }

    /// Release everything that references this device.
    ///
    /// Must run before the device is dropped from the registry.
    pub async fn teardown(&self) {
        self.stop_rssi_sampling().await;
        self.queue.clear().await;
    }

    /// Enqueue the configuration sequence run on every connect.
    ///
    /// Returns the pending firmware read; the other operations complete on
    /// their own.
    pub async fn run_post_connect(
        &self,
        flags: &PolicyFlags,
        pick_pocket_buffer_secs: u8,
    ) -> Result<PendingOperation> {
        let config = self.config().await;
        let mut ops = post_connect_sequence(
            &config,
            flags,
            pick_pocket_buffer_secs,
            self.queue.config().settle_delay,
        )
        .into_iter();

        let firmware = match ops.next() {
            Some(first) => self.queue.enqueue(first).await?,
            None => self.queue.enqueue(Operation::ReadFirmwareVersion).await?,
        };
        for op in ops {
            self.queue.enqueue(op).await?;
        }
        debug!(device = %self.id, "Post-connect sequence queued");
        Ok(firmware)
    }

    /// Enqueue the pairing recovery writes. Returns the last one.
    pub async fn run_fds_recovery(&self) -> Result<PendingOperation> {
        let config = self.config().await;
        let mut last = None;
        for op in fds_recovery_sequence(&config) {
            last = Some(self.queue.enqueue(op).await?);
        }
        match last {
            Some(pending) => Ok(pending),
            None => self.queue.enqueue(Command::ManualDisconnect).await,
        }
    }

    // --- Commands ---

    /// Buzz and blink until stopped or the configured durations run out.
    pub async fn buzz_and_blink(&self) -> Result<PendingOperation> {
        self.queue.enqueue(Command::BuzzAndBlink).await
    }

    pub async fn buzz(&self) -> Result<PendingOperation> {
        self.queue.enqueue(Command::Buzz).await
    }

    pub async fn blink(&self) -> Result<PendingOperation> {
        self.queue.enqueue(Command::Blink).await
    }

    /// Silence the buzzer and LED.
    pub async fn stop_buzzing(&self) -> Result<PendingOperation> {
        self.queue.enqueue(Command::StopBuzz).await
    }

    /// Set the alert mode and remember it for later connects.
    pub async fn set_alert_mode(&self, mode: AlertMode) -> Result<PendingOperation> {
        let pending = self.queue.enqueue(Command::SetAlertMode(mode)).await?;
        self.state.write().await.config.alert_mode = mode;
        Ok(pending)
    }

    /// Enable or disable the pick-pocket alarm.
    pub async fn set_pick_pocket_mode(
        &self,
        enabled: bool,
        buffer_secs: u8,
    ) -> Result<PendingOperation> {
        self.queue
            .enqueue(Command::SetPickPocketMode {
                enabled,
                buffer_secs,
            })
            .await
    }

    pub async fn set_adaptive_mode(&self, enabled: bool) -> Result<PendingOperation> {
        self.queue.enqueue(Command::SetAdaptiveMode(enabled)).await
    }

    pub async fn set_tx_power(&self, high: bool) -> Result<PendingOperation> {
        self.queue.enqueue(Command::SetTxPower(high)).await
    }

    /// Rename the tag and remember the nickname.
    pub async fn set_nickname(&self, name: &str) -> Result<PendingOperation> {
        let pending = self.queue.enqueue(Command::Rename(name.to_string())).await?;
        self.state.write().await.config.nickname = Some(name.to_string());
        Ok(pending)
    }

    pub async fn set_buzz_duration(&self, seconds: u8) -> Result<PendingOperation> {
        let pending = self.queue.enqueue(Command::SetBuzzDuration(seconds)).await?;
        self.state.write().await.config.buzz_duration = Some(seconds);
        Ok(pending)
    }

    pub async fn set_blink_duration(&self, seconds: u8) -> Result<PendingOperation> {
        let pending = self.queue.enqueue(Command::SetBlinkDuration(seconds)).await?;
        self.state.write().await.config.blink_duration = Some(seconds);
        Ok(pending)
    }

    /// Write the pairing code and remember it.
    pub async fn write_pairing_code(&self, code: &str) -> Result<PendingOperation> {
        let pending = self
            .queue
            .enqueue(Command::WritePairingCode(code.to_string()))
            .await?;
        self.state.write().await.config.pairing_code = Some(code.to_string());
        Ok(pending)
    }

    /// Tell the tag it no longer belongs to a user.
    pub async fn deregister(&self) -> Result<PendingOperation> {
        self.queue.enqueue(Command::Deregister).await
    }

    pub async fn manual_disconnect(&self) -> Result<PendingOperation> {
        self.queue.enqueue(Command::ManualDisconnect).await
    }

    pub async fn camera(&self, enabled: bool) -> Result<PendingOperation> {
        self.queue.enqueue(Command::Camera(enabled)).await
    }

    pub async fn read_firmware_version(&self) -> Result<PendingOperation> {
        self.queue.enqueue(Operation::ReadFirmwareVersion).await
    }

    /// Pause the queue for `delay`.
    pub async fn settle(&self, delay: Duration) -> Result<PendingOperation> {
        self.queue.enqueue(Operation::Settle(delay)).await
    }
}

/// Operations run after a connect, in order.
///
/// The firmware read comes first, then the pairing code and a settle pause.
/// Policy commands follow because the tag ignores them until pairing is
/// accepted.
pub fn post_connect_sequence(
    config: &DeviceConfig,
    flags: &PolicyFlags,
    pick_pocket_buffer_secs: u8,
    settle_delay: Duration,
) -> Vec<Operation> {
    let mut ops = vec![Operation::ReadFirmwareVersion];

    if let Some(code) = &config.pairing_code {
        ops.push(Command::WritePairingCode(code.clone()).into());
        ops.push(Operation::Settle(settle_delay));
    }

    ops.extend(
        commands_for_policy(flags, config.alert_mode, pick_pocket_buffer_secs)
            .into_iter()
            .map(Operation::from),
    );

    if let Some(seconds) = config.buzz_duration {
        ops.push(Command::SetBuzzDuration(seconds).into());
    }
    if let Some(seconds) = config.blink_duration {
        ops.push(Command::SetBlinkDuration(seconds).into());
    }
    if let Some(name) = &config.nickname {
        ops.push(Command::Rename(name.clone()).into());
    }
    ops
}

/// Writes that clear a persistent pairing failure.
pub fn fds_recovery_sequence(config: &DeviceConfig) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(2);
    if let Some(code) = &config.pairing_code {
        ops.push(Command::WritePairingCode(code.clone()).into());
    }
    ops.push(Command::ManualDisconnect.into());
    ops
}
