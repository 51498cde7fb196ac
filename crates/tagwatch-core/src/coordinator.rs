//! Connection coordinator.
//!
//! [`ConnectionCoordinator`] is the context object the rest of the system
//! talks to. It owns the [`DeviceRegistry`], the reconnect timers and the
//! firmware-update mode, consumes the radio's event stream, and runs three
//! periodic loops:
//!
//! - the **policy tick** (default 10s) decides which remote records should be
//!   connected and issues connect requests. A failed connect is simply
//!   retried on the next tick.
//! - the **scan duty cycle** alternates an active scan window (20s) with a
//!   pause (10s), and stays off while a firmware update runs.
//! - the **prune pass** drops tags that have not been heard from and
//!   recovery-mode tags that stopped advertising.
//!
//! Radio events are turned into [`StateInput`]s, applied to the device's
//! state machine, and the returned [`Effect`]s are carried out here.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tagwatch_core::{
//!     ConnectionCoordinator, CoordinatorConfig, FixedLocation, MemoryRemoteRegistry,
//!     MemoryStore, MockRadio,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> tagwatch_core::Result<()> {
//! let coordinator = Arc::new(ConnectionCoordinator::new(
//!     Arc::new(MockRadio::new()),
//!     Arc::new(MemoryRemoteRegistry::default()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(FixedLocation::default()),
//!     CoordinatorConfig::default().user_id("alice"),
//! )?);
//!
//! let mut events = coordinator.events().subscribe();
//! let cancel = CancellationToken::new();
//! let task = coordinator.start(cancel.clone());
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! #   break;
//! }
//!
//! cancel.cancel();
//! task.await.ok();
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tagwatch_types::{
    ConnectionState, DeviceNotification, Effect, FirmwareVersion, GattCharacteristic, LogicalId,
    PeripheralHandle, StateInput,
};
use tagwatch_types::uuids::NOTIFY_CHARACTERISTIC;

use crate::config::CoordinatorConfig;
use crate::device::{DeviceConfig, DisplayState, TrackerDevice};
use crate::dfu::{DfuCoordinator, FirmwareTransfer};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DisconnectReason, EventDispatcher};
use crate::policy::{PolicyFlags, commands_for_policy};
use crate::queue::OperationOutcome;
use crate::radio::{RadioAdapter, RadioEvent};
use crate::reconnect::ReconnectScheduler;
use crate::registry::DeviceRegistry;
use crate::remote::{LinkStatus, RemoteRegistry};
use crate::store::{DeviceRecord, LocationProvider, NotificationEntry, NotificationKind, RecordStore};

/// Drives discovery, connection policy and reconnect handling for all tags.
pub struct ConnectionCoordinator {
    radio: Arc<dyn RadioAdapter>,
    remote: Arc<dyn RemoteRegistry>,
    store: Arc<dyn RecordStore>,
    location: Arc<dyn LocationProvider>,
    config: CoordinatorConfig,
    registry: DeviceRegistry,
    reconnect: ReconnectScheduler,
    dfu: DfuCoordinator,
    events: EventDispatcher,
    policy: RwLock<PolicyFlags>,
    link_status: RwLock<HashMap<LogicalId, LinkStatus>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ConnectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCoordinator")
            .field("config", &self.config)
            .field("dfu", &self.dfu)
            .finish()
    }
}

impl ConnectionCoordinator {
    /// Create a coordinator. Nothing runs until [`ConnectionCoordinator::start`].
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        remote: Arc<dyn RemoteRegistry>,
        store: Arc<dyn RecordStore>,
        location: Arc<dyn LocationProvider>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let registry = DeviceRegistry::new(
            Arc::clone(&radio),
            config.queue.clone(),
            config.rssi.clone(),
        );
        Ok(Self {
            events: EventDispatcher::new(config.event_capacity),
            radio,
            remote,
            store,
            location,
            registry,
            reconnect: ReconnectScheduler::new(),
            dfu: DfuCoordinator::new(),
            policy: RwLock::new(PolicyFlags::default()),
            link_status: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// The event bus.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Configuration in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Known devices.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Firmware update mode.
    pub fn dfu(&self) -> &DfuCoordinator {
        &self.dfu
    }

    /// Reconnect grace timers.
    pub fn reconnect_scheduler(&self) -> &ReconnectScheduler {
        &self.reconnect
    }

    /// A device by logical id.
    pub async fn device(&self, id: &LogicalId) -> Option<Arc<TrackerDevice>> {
        self.registry.get(id).await
    }

    /// Devices whose id ends with `short`.
    pub async fn find(&self, short: &str) -> Vec<Arc<TrackerDevice>> {
        self.registry.find_short(short).await
    }

    /// Link status last computed for a remote record.
    pub async fn link_status(&self, id: &LogicalId) -> LinkStatus {
        self.link_status
            .read()
            .await
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    /// Current policy flags.
    pub async fn policy(&self) -> PolicyFlags {
        *self.policy.read().await
    }

    // --- Lifecycle ---

    /// Spawn the event loop, policy tick, scan duty cycle and prune pass.
    ///
    /// Everything stops when `cancel` fires; call
    /// [`ConnectionCoordinator::shutdown`] afterwards to cancel reconnect
    /// timers and drain queues.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        // Subscribe before spawning so no event is missed.
        let radio_events = self.radio.subscribe();
        let coordinator = Arc::clone(self);

        tokio::spawn(async move {
            info!("Connection coordinator started");
            tokio::join!(
                coordinator.run_event_loop(radio_events, cancel.clone()),
                coordinator.run_tick_loop(cancel.clone()),
                coordinator.run_scan_cycle(cancel.clone()),
                coordinator.run_prune_loop(cancel.clone()),
            );
            coordinator.shutdown.cancel();
            info!("Connection coordinator stopped");
        })
    }

    /// Cancel reconnect timers, stop RSSI sampling, drain queues and stop scanning.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let timers = self.reconnect.cancel_all().await;
        for device in self.registry.all().await {
            device.set_reconnect_pending(false).await;
            device.teardown().await;
        }
        self.stop_scan().await;
        info!(timers, "Connection coordinator shut down");
    }

    async fn run_event_loop(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<RadioEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => self.handle_radio_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Radio event stream lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Radio event stream closed");
                        break;
                    }
                },
            }
        }
    }

    async fn run_tick_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Policy tick failed: {}", e);
                    }
                }
            }
        }
    }

    async fn run_scan_cycle(&self, cancel: CancellationToken) {
        let scan = &self.config.scan;
        loop {
            if self.dfu.is_active() {
                debug!("Scanning suspended for firmware update");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.dfu.wait_inactive() => continue,
                }
            }

            self.start_scan().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(scan.active) => {}
            }

            self.stop_scan().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(scan.pause) => {}
            }
        }
        self.stop_scan().await;
    }

    async fn run_prune_loop(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.recovery_prune_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.prune().await,
            }
        }
    }

    async fn start_scan(&self) {
        if self.dfu.is_active() {
            return;
        }
        match self.radio.start_scan(&self.config.scan.service_filter).await {
            Ok(()) => trace!("Scan window opened"),
            Err(e) => warn!("Failed to start scan: {}", e),
        }
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    // --- Policy ---

    /// Evaluate every remote record once.
    ///
    /// Records with no local device are reported disconnected (or
    /// reconnecting while a grace timer runs). Local devices that are not
    /// connected get a connect request when auto-connect is on, sharing
    /// allows it, and no firmware update is running.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        let records = self.remote.records().await?;
        let dfu_active = self.dfu.is_active();

        for record in records {
            let Some(device) = self.registry.get(&record.id).await else {
                let status = if self.reconnect.is_pending(&record.id).await {
                    LinkStatus::Reconnecting
                } else {
                    LinkStatus::Disconnected
                };
                self.set_link_status(&record.id, status).await;
                continue;
            };

            device.configure(DeviceConfig::from(&record)).await;
            let state = device.connection_state().await;
            self.set_link_status(&record.id, link_status_of(device.display_state().await))
                .await;

            if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                continue;
            }
            if !record.auto_connect || !record.connect_allowed_for(&self.config.user_id) {
                trace!(device = %record.id, "Not eligible for auto-connect");
                continue;
            }
            if dfu_active {
                debug!(device = %record.id, "Connect deferred, firmware update in progress");
                continue;
            }

            if state != ConnectionState::Connecting {
                device.reset_session().await;
            }
            if let Err(e) = self.request_connect(&device).await {
                warn!(device = %record.id, "Connect request failed: {}", e);
            }
        }
        Ok(())
    }

    /// Replace the policy flags and push the resulting commands to every
    /// connected tag.
    pub async fn set_policy(&self, flags: PolicyFlags) -> Result<()> {
        let previous = std::mem::replace(&mut *self.policy.write().await, flags);
        if previous == flags {
            return Ok(());
        }
        info!(mode = ?flags.mode(), "Policy changed");

        for device in self.registry.all().await {
            if !device.is_connected().await {
                continue;
            }
            let alert = device.config().await.alert_mode;
            for cmd in commands_for_policy(&flags, alert, self.config.pick_pocket_buffer_secs) {
                device.queue().enqueue(cmd).await?;
            }
        }
        Ok(())
    }

    /// Connect a known device now, regardless of its auto-connect setting.
    pub async fn connect(self: &Arc<Self>, id: &LogicalId) -> Result<()> {
        let device = self.require(id).await?;
        if let Some(active) = self.dfu.active_device() {
            return Err(Error::DfuInProgress(active.to_string()));
        }
        if device.connection_state().await == ConnectionState::Disconnected {
            device.reset_session().await;
        }
        self.request_connect(&device).await
    }

    /// Disconnect a device. The drop is reported without a grace period.
    pub async fn disconnect(self: &Arc<Self>, id: &LogicalId) -> Result<()> {
        let device = self.require(id).await?;
        let transition = device.apply(StateInput::DisconnectRequested).await?;
        self.execute_effects(&device, &transition.effects, None).await;
        Ok(())
    }

    async fn request_connect(self: &Arc<Self>, device: &Arc<TrackerDevice>) -> Result<()> {
        let transition = device.apply(StateInput::ConnectRequested).await?;
        self.execute_effects(device, &transition.effects, None).await;
        Ok(())
    }

    async fn require(&self, id: &LogicalId) -> Result<Arc<TrackerDevice>> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| Error::device_not_found(id.as_str()))
    }

    // --- Firmware update ---

    /// Run a firmware transfer to one tag.
    ///
    /// Scanning, auto-connect and RSSI sampling are suspended for the
    /// duration, and disconnect notifications are suppressed. The mode is cleared however
    /// the transfer ends.
    #[tracing::instrument(level = "info", skip_all, fields(device = %id))]
    pub async fn update_firmware(
        &self,
        id: &LogicalId,
        transfer: &dyn FirmwareTransfer,
    ) -> Result<()> {
        let device = self.require(id).await?;
        let guard = self.dfu.begin(id)?;
        self.stop_scan().await;
        for device in self.registry.all().await {
            device.stop_rssi_sampling().await;
        }
        self.events.send(DeviceEvent::DfuStarted { device: id.clone() });

        let result = transfer.transfer(device.handle()).await;
        drop(guard);

        if !self.shutdown.is_cancelled() {
            for device in self.registry.all().await {
                if device.is_connected().await && !device.is_sampling().await {
                    device.start_rssi_sampling(&self.shutdown).await;
                }
            }
        }

        match &result {
            Ok(()) => info!("Firmware update finished"),
            Err(e) => warn!("Firmware update failed: {}", e),
        }
        self.events.send(DeviceEvent::DfuFinished {
            device: id.clone(),
            success: result.is_ok(),
        });
        result
    }

    // --- Pruning ---

    /// Remove tags not heard from within the prune interval and recovery-mode
    /// tags not seen within the recovery prune interval.
    pub async fn prune(&self) {
        for id in self.registry.stale(self.config.prune_interval).await {
            self.reconnect.cancel(&id).await;
            if self.registry.remove(&id).await.is_some() {
                info!(device = %id, "Tag out of range, removed");
                self.set_link_status(&id, LinkStatus::Disconnected).await;
                self.events.send(DeviceEvent::SensorRemoved { device: id });
            }
        }

        for handle in self
            .registry
            .prune_recovery(self.config.recovery_prune_interval)
            .await
        {
            info!(%handle, "Recovery-mode tag no longer advertising");
            self.events.send(DeviceEvent::RecoveryCleared { handle });
        }
    }

    // --- Radio events ---

    /// Process one radio event.
    pub async fn handle_radio_event(self: &Arc<Self>, event: RadioEvent) {
        match event {
            RadioEvent::Discovered {
                handle,
                advertised_id,
                name,
                rssi,
                flags,
            } => {
                if flags.dfu_recovery {
                    if self.registry.observe_recovery(&handle).await {
                        info!(%handle, "Tag advertising from recovery bootloader");
                        self.events.send(DeviceEvent::RecoveryObserved { handle });
                    }
                    return;
                }
                self.on_discovered(&handle, &advertised_id, name, rssi, flags.fds_error)
                    .await;
            }
            RadioEvent::Connected { handle } => {
                self.on_link(&handle, StateInput::DidConnect, None).await;
            }
            RadioEvent::Disconnected { handle, error } => {
                self.on_link(&handle, StateInput::DidDisconnect, error).await;
            }
            RadioEvent::FailedToConnect { handle, error } => {
                self.on_link(&handle, StateInput::DidFailToConnect, error)
                    .await;
            }
            RadioEvent::CharacteristicUpdated {
                handle,
                characteristic,
                value,
            } => {
                let Some(device) = self.registry.get_by_handle(&handle).await else {
                    return;
                };
                device.touch_activity().await;
                match GattCharacteristic::from_uuid(characteristic) {
                    Some(GattCharacteristic::Notify) => {
                        self.on_notification(&device, DeviceNotification::decode(&value))
                            .await;
                    }
                    Some(GattCharacteristic::FirmwareRevision) => {
                        self.on_firmware_report(&device, &value).await;
                    }
                    Some(GattCharacteristic::Control) | None => {
                        trace!(device = %device.id(), %characteristic, "Ignoring characteristic update");
                    }
                }
            }
            RadioEvent::RssiRead { handle, rssi } => {
                let Some(device) = self.registry.get_by_handle(&handle).await else {
                    return;
                };
                device.touch_activity().await;
                if self.dfu.is_active() {
                    trace!(device = %device.id(), rssi, "Ignoring RSSI during firmware update");
                    return;
                }
                match device.record_rssi(rssi).await {
                    Ok(Some(average_rssi)) => self.events.send(DeviceEvent::AdaptivePowerEnabled {
                        device: device.id().clone(),
                        average_rssi,
                    }),
                    Ok(None) => {}
                    Err(e) => warn!(device = %device.id(), "Failed to queue power commands: {}", e),
                }
            }
        }
    }

    async fn on_discovered(
        &self,
        handle: &PeripheralHandle,
        advertised_id: &str,
        name: Option<String>,
        rssi: Option<i16>,
        fds_error: bool,
    ) {
        let observation = match self
            .registry
            .observe(handle, advertised_id, name.clone(), rssi)
            .await
        {
            Ok(observation) => observation,
            Err(e) => {
                debug!(%handle, "Ignoring advertisement: {}", e);
                return;
            }
        };

        let device = observation.device();
        if observation.is_new() {
            self.events.send(DeviceEvent::Discovered {
                device: device.id().clone(),
                name,
                rssi,
            });
        }

        if fds_error && device.mark_fds_error().await {
            warn!(device = %device.id(), "Tag reports a pairing storage error, recovery queued");
            self.events.send(DeviceEvent::FdsRecoveryStarted {
                device: device.id().clone(),
            });
        }
    }

    async fn on_link(
        self: &Arc<Self>,
        handle: &PeripheralHandle,
        input: StateInput,
        error: Option<String>,
    ) {
        let Some(device) = self.registry.get_by_handle(handle).await else {
            debug!(%handle, ?input, "Link event for unknown peripheral");
            if input == StateInput::DidConnect
                && let Err(e) = self.radio.disconnect(handle).await
            {
                warn!(%handle, "Failed to drop orphan link: {}", e);
            }
            return;
        };

        if input != StateInput::DidFailToConnect {
            device.touch_activity().await;
        }

        match device.apply(input).await {
            Ok(transition) => {
                self.execute_effects(&device, &transition.effects, error.as_deref())
                    .await;
            }
            Err(e) => warn!(device = %device.id(), "{}", e),
        }
    }

    async fn on_notification(&self, device: &Arc<TrackerDevice>, notification: DeviceNotification) {
        let id = device.id().clone();
        match notification {
            DeviceNotification::ButtonPress { clicks } => {
                info!(device = %id, clicks, "Button pressed");
                self.record_notification(&id, NotificationKind::ButtonPressed { clicks })
                    .await;
                self.events.send(DeviceEvent::ButtonPressed { device: id, clicks });
            }
            DeviceNotification::BatteryLevel { percent } => {
                device.set_battery(percent).await;
                self.events.send(DeviceEvent::BatteryLevel { device: id, percent });
            }
            DeviceNotification::PairingAccepted => {
                debug!(device = %id, "Pairing code accepted");
            }
            DeviceNotification::PairingRejected { status } => {
                warn!(device = %id, status, "Pairing code rejected, forcing reconnect");
                if device.mark_fds_error().await {
                    self.events.send(DeviceEvent::FdsRecoveryStarted { device: id.clone() });
                }
                if let Err(e) = self.radio.disconnect(device.handle()).await {
                    warn!(device = %id, "Failed to drop link: {}", e);
                }
            }
            DeviceNotification::Unknown { raw } => {
                trace!(device = %id, ?raw, "Unknown notification");
            }
        }
    }

    async fn on_firmware_report(&self, device: &Arc<TrackerDevice>, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let version: FirmwareVersion = match text.parse() {
            Ok(version) => version,
            Err(e) => {
                warn!(device = %device.id(), "Unparseable firmware revision: {}", e);
                return;
            }
        };
        device.set_firmware(version).await;
        debug!(device = %device.id(), %version, "Firmware reported");

        match self.remote.latest_firmware().await {
            Ok(Some(latest)) if version < latest => {
                info!(device = %device.id(), %version, %latest, "Firmware update available");
                self.events.send(DeviceEvent::FirmwareUpdatePending {
                    device: device.id().clone(),
                    current: version,
                    latest,
                });
            }
            Ok(_) => {}
            Err(e) => debug!("Could not fetch latest firmware: {}", e),
        }
    }

    // --- Effects ---

    async fn execute_effects(
        self: &Arc<Self>,
        device: &Arc<TrackerDevice>,
        effects: &[Effect],
        error: Option<&str>,
    ) {
        let id = device.id();
        for effect in effects {
            trace!(device = %id, ?effect, "Executing effect");
            match effect {
                Effect::IssueConnect => {
                    self.set_link_status(id, LinkStatus::Connecting).await;
                    if let Err(e) = self.radio.connect(device.handle()).await {
                        warn!(device = %id, "Connect failed to start: {}", e);
                    }
                }
                Effect::IssueDisconnect => {
                    if let Err(e) = self.radio.disconnect(device.handle()).await {
                        warn!(device = %id, "Disconnect failed: {}", e);
                    }
                }
                Effect::ResetLinkQuality => device.reset_link_quality().await,
                Effect::DiscoverServices => {
                    let result = async {
                        self.radio.discover_services(device.handle()).await?;
                        self.radio
                            .set_notify(device.handle(), NOTIFY_CHARACTERISTIC, true)
                            .await
                    }
                    .await;
                    if let Err(e) = result {
                        warn!(device = %id, "Service discovery failed: {}", e);
                    }
                }
                Effect::StartRssiSampling => {
                    if self.dfu.is_active() {
                        debug!(device = %id, "Firmware update running, RSSI sampling deferred");
                    } else {
                        device.start_rssi_sampling(&self.shutdown).await;
                    }
                }
                Effect::StopRssiSampling => device.stop_rssi_sampling().await,
                Effect::ResetSession => {
                    device.reset_session().await;
                }
                Effect::RunPostConnectSequence => self.run_post_connect(device).await,
                Effect::CancelReconnect => {
                    if self.reconnect.cancel(id).await {
                        info!(device = %id, "Reconnected within grace period");
                    }
                    device.set_reconnect_pending(false).await;
                }
                Effect::ScheduleReconnect => self.schedule_reconnect(device, error).await,
                Effect::NotifyConnected => {
                    info!(device = %id, "Connected");
                    self.set_link_status(id, LinkStatus::Connected).await;
                    self.events.send(DeviceEvent::Connected { device: id.clone() });
                }
                Effect::NotifyConnectFailed => {
                    debug!(device = %id, ?error, "Connect failed, retrying next tick");
                    let status = if device.reconnect_pending().await {
                        LinkStatus::Reconnecting
                    } else {
                        LinkStatus::Disconnected
                    };
                    self.set_link_status(id, status).await;
                    self.events.send(DeviceEvent::ConnectFailed {
                        device: id.clone(),
                        error: error.map(str::to_string),
                    });
                }
                Effect::NotifyDisconnected => {
                    info!(device = %id, "Disconnected on request");
                    self.set_link_status(id, LinkStatus::Disconnected).await;
                    if !self.dfu.is_active() {
                        self.events.send(DeviceEvent::Disconnected {
                            device: id.clone(),
                            reason: DisconnectReason::UserRequested,
                            alert: false,
                        });
                    }
                }
            }
        }
    }

    async fn run_post_connect(self: &Arc<Self>, device: &Arc<TrackerDevice>) {
        if device.take_fds_error().await {
            self.run_fds_recovery(device).await;
            return;
        }

        let flags = *self.policy.read().await;
        let firmware = match device
            .run_post_connect(&flags, self.config.pick_pocket_buffer_secs)
            .await
        {
            Ok(firmware) => firmware,
            Err(e) => {
                warn!(device = %device.id(), "Failed to queue post-connect sequence: {}", e);
                return;
            }
        };

        let coordinator = Arc::clone(self);
        let device = Arc::clone(device);
        tokio::spawn(async move {
            match firmware.wait().await {
                OperationOutcome::Value(raw) => coordinator.on_firmware_report(&device, &raw).await,
                outcome => debug!(device = %device.id(), ?outcome, "No firmware revision read"),
            }
        });
    }

    async fn run_fds_recovery(&self, device: &Arc<TrackerDevice>) {
        info!(device = %device.id(), "Running pairing recovery");
        let last = match device.run_fds_recovery().await {
            Ok(last) => last,
            Err(e) => {
                warn!(device = %device.id(), "Failed to queue pairing recovery: {}", e);
                return;
            }
        };

        let radio = Arc::clone(&self.radio);
        let handle = device.handle().clone();
        tokio::spawn(async move {
            last.wait().await;
            if let Err(e) = radio.disconnect(&handle).await {
                warn!(%handle, "Failed to drop link after pairing recovery: {}", e);
            }
        });
    }

    async fn schedule_reconnect(self: &Arc<Self>, device: &Arc<TrackerDevice>, error: Option<&str>) {
        let id = device.id().clone();
        let firmware = match device.firmware().await {
            Some(version) => Some(version),
            None => self.record_firmware(&id).await,
        };
        let grace = self.config.reconnect.grace_for(firmware);

        device.set_reconnect_pending(true).await;
        self.set_link_status(&id, LinkStatus::Reconnecting).await;
        info!(device = %id, ?grace, "Link dropped, waiting before reporting");
        self.events.send(DeviceEvent::ReconnectScheduled {
            device: id.clone(),
            grace_secs: grace.as_secs(),
        });

        let reason = match error {
            Some(e) => DisconnectReason::BleError(e.to_string()),
            None => DisconnectReason::LinkLost,
        };
        let coordinator = Arc::clone(self);
        let expired = id.clone();
        self.reconnect
            .schedule(id, grace, async move {
                coordinator.finalize_disconnect(&expired, reason).await;
            })
            .await;
    }

    async fn record_firmware(&self, id: &LogicalId) -> Option<FirmwareVersion> {
        match self.remote.records().await {
            Ok(records) => records.into_iter().find(|r| &r.id == id)?.firmware,
            Err(e) => {
                debug!(device = %id, "Could not read remote record: {}", e);
                None
            }
        }
    }

    /// Report a drop whose grace period ran out.
    ///
    /// Skipped when the tag came back in the meantime. Otherwise the
    /// location is recorded, the device removed and, unless a firmware
    /// update is running, a disconnect event emitted.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %id))]
    async fn finalize_disconnect(&self, id: &LogicalId, reason: DisconnectReason) {
        if let Some(device) = self.registry.get(id).await {
            device.set_reconnect_pending(false).await;
            match device.connection_state().await {
                ConnectionState::Connected | ConnectionState::Disconnecting => {
                    debug!("Tag came back before the grace period ended");
                    return;
                }
                ConnectionState::Connecting => {
                    if let Err(e) = self.radio.disconnect(device.handle()).await {
                        debug!("Failed to cancel pending connect: {}", e);
                    }
                }
                ConnectionState::Disconnected => {}
            }
        }

        let dfu_active = self.dfu.is_active();
        let alert = !self.policy.read().await.suppresses_alerts();
        self.record_notification(
            id,
            NotificationKind::Disconnected {
                alerted: alert && !dfu_active,
            },
        )
        .await;

        if self.registry.remove(id).await.is_some() {
            self.events.send(DeviceEvent::SensorRemoved { device: id.clone() });
        }
        self.set_link_status(id, LinkStatus::Disconnected).await;

        if dfu_active {
            info!("Disconnect not reported during firmware update");
            return;
        }
        info!(alert, "Tag disconnected");
        self.events.send(DeviceEvent::Disconnected {
            device: id.clone(),
            reason,
            alert,
        });
    }

    // --- Bookkeeping ---

    async fn record_notification(&self, id: &LogicalId, kind: NotificationKind) {
        let location = self.location.current_location().await;
        let result = async {
            let mut record = self
                .store
                .read_record(id)
                .await?
                .unwrap_or_else(|| DeviceRecord::new(id.clone()));
            if location.is_some() {
                record.last_location = location;
            }
            record.last_seen = Some(OffsetDateTime::now_utc());
            record.push_notification(NotificationEntry::now(kind, location));
            self.store.write_record(record).await
        }
        .await;

        if let Err(e) = result {
            warn!(device = %id, "Failed to update device record: {}", e);
        }
    }

    async fn set_link_status(&self, id: &LogicalId, status: LinkStatus) {
        let previous = self.link_status.write().await.insert(id.clone(), status);
        if previous != Some(status) {
            debug!(device = %id, ?status, "Link status");
        }
    }
}

fn link_status_of(state: DisplayState) -> LinkStatus {
    match state {
        DisplayState::Connected => LinkStatus::Connected,
        DisplayState::Connecting => LinkStatus::Connecting,
        DisplayState::Reconnecting => LinkStatus::Reconnecting,
        DisplayState::Disconnected | DisplayState::Disconnecting => LinkStatus::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;
    use crate::remote::{MemoryRemoteRegistry, RemoteDeviceRecord, Sharing};
    use crate::store::{FixedLocation, MemoryStore};
    use std::time::Duration;

    const HW: &str = "0000E50E24DCCA9E";

    fn id() -> LogicalId {
        LogicalId::from_hardware_uuid(HW).unwrap()
    }

    fn handle() -> PeripheralHandle {
        PeripheralHandle::new("tag-1")
    }

    fn coordinator(
        radio: &Arc<MockRadio>,
        records: Vec<RemoteDeviceRecord>,
    ) -> Arc<ConnectionCoordinator> {
        Arc::new(
            ConnectionCoordinator::new(
                radio.clone(),
                Arc::new(MemoryRemoteRegistry::new(records)),
                Arc::new(MemoryStore::new()),
                Arc::new(FixedLocation::default()),
                CoordinatorConfig::default().user_id("alice"),
            )
            .unwrap(),
        )
    }

    async fn discovered(c: &Arc<ConnectionCoordinator>) -> Arc<TrackerDevice> {
        c.handle_radio_event(RadioEvent::Discovered {
            handle: handle(),
            advertised_id: HW.into(),
            name: Some("Tag".into()),
            rssi: Some(-60),
            flags: Default::default(),
        })
        .await;
        c.device(&id()).await.unwrap()
    }

    #[tokio::test]
    async fn test_tick_marks_unknown_records_disconnected() {
        let radio = Arc::new(MockRadio::new());
        let c = coordinator(&radio, vec![RemoteDeviceRecord::new(id())]);
        c.tick().await.unwrap();
        assert_eq!(c.link_status(&id()).await, LinkStatus::Disconnected);
        assert!(radio.connect_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_tick_connects_eligible_device() {
        let radio = Arc::new(MockRadio::new());
        radio.set_auto_connect(false);
        let c = coordinator(&radio, vec![RemoteDeviceRecord::new(id())]);
        let device = discovered(&c).await;

        c.tick().await.unwrap();
        assert_eq!(radio.connect_requests().await, vec![handle()]);
        assert_eq!(device.connection_state().await, ConnectionState::Connecting);
        assert_eq!(c.link_status(&id()).await, LinkStatus::Connecting);

        // Still connecting: the request is re-issued without a session reset.
        c.tick().await.unwrap();
        assert_eq!(radio.connect_requests().await.len(), 2);
    }

    #[tokio::test]
    async fn test_tick_respects_auto_connect_and_sharing() {
        let radio = Arc::new(MockRadio::new());
        let mut off = RemoteDeviceRecord::new(id());
        off.auto_connect = false;
        let c = coordinator(&radio, vec![off]);
        discovered(&c).await;
        c.tick().await.unwrap();
        assert!(radio.connect_requests().await.is_empty());

        let radio = Arc::new(MockRadio::new());
        let mut shared = RemoteDeviceRecord::new(id());
        shared.sharing = Some(Sharing {
            secondary_user: "bob".into(),
            accepted: true,
        });
        let c = coordinator(&radio, vec![shared]);
        discovered(&c).await;
        c.tick().await.unwrap();
        assert!(radio.connect_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_connect_during_dfu() {
        let radio = Arc::new(MockRadio::new());
        let c = coordinator(&radio, vec![RemoteDeviceRecord::new(id())]);
        discovered(&c).await;

        let _guard = c.dfu().begin(&id()).unwrap();
        c.tick().await.unwrap();
        assert!(radio.connect_requests().await.is_empty());
        assert!(matches!(c.connect(&id()).await, Err(Error::DfuInProgress(_))));
    }

    #[tokio::test]
    async fn test_recovery_advertisement_tracked_separately() {
        let radio = Arc::new(MockRadio::new());
        let c = coordinator(&radio, vec![]);
        let mut rx = c.events().subscribe();

        c.handle_radio_event(RadioEvent::Discovered {
            handle: PeripheralHandle::new("dfu-1"),
            advertised_id: HW.into(),
            name: Some("DfuTarg".into()),
            rssi: Some(-70),
            flags: tagwatch_types::AdvertisementFlags {
                dfu_recovery: true,
                fds_error: false,
            },
        })
        .await;

        assert!(c.registry().is_empty().await);
        assert_eq!(c.registry().recovery_len().await, 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            DeviceEvent::RecoveryObserved { .. }
        ));
    }

    #[tokio::test]
    async fn test_link_event_for_unknown_peripheral_is_ignored() {
        let radio = Arc::new(MockRadio::new());
        let c = coordinator(&radio, vec![]);
        c.handle_radio_event(RadioEvent::Disconnected {
            handle: handle(),
            error: None,
        })
        .await;
        assert!(c.registry().is_empty().await);
    }

    #[test]
    fn test_link_status_mapping() {
        assert_eq!(link_status_of(DisplayState::Reconnecting), LinkStatus::Reconnecting);
        assert_eq!(link_status_of(DisplayState::Disconnecting), LinkStatus::Disconnected);
        assert_eq!(link_status_of(DisplayState::Connected), LinkStatus::Connected);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let radio = Arc::new(MockRadio::new());
        let result = ConnectionCoordinator::new(
            radio,
            Arc::new(MemoryRemoteRegistry::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedLocation::default()),
            CoordinatorConfig::default().tick_interval(Duration::ZERO),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
