//! In-memory map of known tags.
//!
//! The registry is keyed by [`LogicalId`] with a secondary index by radio
//! handle, since radio events carry only the handle. Discovery events are
//! deduplicated here: the first advertisement of an id creates its
//! [`TrackerDevice`], later ones only refresh it.
//!
//! Tags advertising from the firmware recovery bootloader are not tracker
//! devices yet; they are kept in a separate, shorter-lived set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use tagwatch_types::{ConnectionState, LogicalId, PeripheralHandle};

use crate::device::TrackerDevice;
use crate::error::Result;
use crate::queue::QueueConfig;
use crate::radio::RadioAdapter;
use crate::rssi::RssiConfig;

/// Outcome of [`DeviceRegistry::observe`].
#[derive(Debug, Clone)]
pub enum Observation {
    /// First advertisement for this id.
    Created(Arc<TrackerDevice>),
    /// Known device refreshed.
    Updated(Arc<TrackerDevice>),
}

impl Observation {
    /// The observed device.
    pub fn device(&self) -> &Arc<TrackerDevice> {
        match self {
            Observation::Created(device) | Observation::Updated(device) => device,
        }
    }

    /// Whether the device was created by this observation.
    pub fn is_new(&self) -> bool {
        matches!(self, Observation::Created(_))
    }
}

#[derive(Default)]
struct Devices {
    by_id: HashMap<LogicalId, Arc<TrackerDevice>>,
    by_handle: HashMap<PeripheralHandle, LogicalId>,
}

/// Authoritative map from identity to [`TrackerDevice`].
pub struct DeviceRegistry {
    radio: Arc<dyn RadioAdapter>,
    queue_config: QueueConfig,
    rssi_config: RssiConfig,
    devices: RwLock<Devices>,
    recovery: RwLock<HashMap<PeripheralHandle, Instant>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("queue_config", &self.queue_config)
            .field("rssi_config", &self.rssi_config)
            .finish()
    }
}

impl DeviceRegistry {
    /// Create an empty registry. New devices get queues and RSSI windows
    /// built from the given settings.
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        queue_config: QueueConfig,
        rssi_config: RssiConfig,
    ) -> Self {
        Self {
            radio,
            queue_config,
            rssi_config,
            devices: RwLock::new(Devices::default()),
            recovery: RwLock::new(HashMap::new()),
        }
    }

    /// Record an advertisement.
    ///
    /// Creates the device on first sight of its logical id; otherwise
    /// refreshes its name, RSSI and last-seen time. A disconnected device
    /// seen under a new handle is rebound to it; a linked one keeps its
    /// current handle.
    pub async fn observe(
        &self,
        handle: &PeripheralHandle,
        advertised_id: &str,
        name: Option<String>,
        rssi: Option<i16>,
    ) -> Result<Observation> {
        let id = LogicalId::from_hardware_uuid(advertised_id)?;

        let observation = {
            let mut devices = self.devices.write().await;
            let known = devices.by_id.get(&id).cloned();
            match known {
                Some(device) if device.handle() != handle => {
                    if device.connection_state().await == ConnectionState::Disconnected {
                        info!(
                            device = %id,
                            old = %device.handle(),
                            new = %handle,
                            "Tag advertising under a new handle, rebinding"
                        );
                        device.teardown().await;
                        let rebound = Arc::new(device.rebind(handle.clone()).await);
                        devices.by_handle.retain(|_, mapped| mapped != &id);
                        devices.by_handle.insert(handle.clone(), id.clone());
                        devices.by_id.insert(id.clone(), Arc::clone(&rebound));
                        Observation::Updated(rebound)
                    } else {
                        debug!(
                            device = %id,
                            known = %device.handle(),
                            seen = %handle,
                            "Advertised under a new handle while linked"
                        );
                        Observation::Updated(device)
                    }
                }
                Some(device) => Observation::Updated(device),
                None => {
                    let device = Arc::new(TrackerDevice::new(
                        id.clone(),
                        handle.clone(),
                        Arc::clone(&self.radio),
                        self.queue_config.clone(),
                        self.rssi_config.clone(),
                    ));
                    devices.by_handle.insert(handle.clone(), id.clone());
                    devices.by_id.insert(id.clone(), Arc::clone(&device));
                    info!(device = %id, %handle, "New tag discovered");
                    Observation::Created(device)
                }
            }
        };

        observation.device().update_advertisement(name, rssi).await;
        Ok(observation)
    }

    /// Look up by logical id.
    pub async fn get(&self, id: &LogicalId) -> Option<Arc<TrackerDevice>> {
        self.devices.read().await.by_id.get(id).cloned()
    }

    /// Look up by radio handle.
    pub async fn get_by_handle(&self, handle: &PeripheralHandle) -> Option<Arc<TrackerDevice>> {
        let devices = self.devices.read().await;
        devices
            .by_handle
            .get(handle)
            .and_then(|id| devices.by_id.get(id))
            .cloned()
    }

    /// Devices whose logical id ends with `short`.
    pub async fn find_short(&self, short: &str) -> Vec<Arc<TrackerDevice>> {
        let mut found: Vec<_> = self
            .devices
            .read()
            .await
            .by_id
            .values()
            .filter(|d| d.id().matches_short(short))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// All devices, sorted by id.
    pub async fn all(&self) -> Vec<Arc<TrackerDevice>> {
        let mut all: Vec<_> = self.devices.read().await.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Number of devices.
    pub async fn len(&self) -> usize {
        self.devices.read().await.by_id.len()
    }

    /// Whether no devices are known.
    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.by_id.is_empty()
    }

    /// Remove a device after tearing down its queue and sampler.
    ///
    /// Reconnect timers are owned by the caller and must already be cancelled.
    pub async fn remove(&self, id: &LogicalId) -> Option<Arc<TrackerDevice>> {
        let device = self.get(id).await?;
        device.teardown().await;

        let mut devices = self.devices.write().await;
        let removed = devices.by_id.remove(id)?;
        devices.by_handle.retain(|_, mapped| mapped != id);
        debug!(device = %id, "Removed from registry");
        Some(removed)
    }

    /// Disconnected devices not heard from within `max_age`.
    ///
    /// Devices with a pending reconnect are left to the reconnect timer.
    pub async fn stale(&self, max_age: Duration) -> Vec<LogicalId> {
        let mut stale = Vec::new();
        for device in self.all().await {
            if device.connection_state().await != ConnectionState::Disconnected
                || device.reconnect_pending().await
            {
                continue;
            }
            if device.last_heard().await.elapsed() >= max_age {
                stale.push(device.id().clone());
            }
        }
        stale
    }

    // --- Recovery-mode tags ---

    /// Record a recovery-mode advertisement. Returns whether the handle is new.
    pub async fn observe_recovery(&self, handle: &PeripheralHandle) -> bool {
        self.recovery
            .write()
            .await
            .insert(handle.clone(), Instant::now())
            .is_none()
    }

    /// Whether a handle is currently tracked as in recovery mode.
    pub async fn is_in_recovery(&self, handle: &PeripheralHandle) -> bool {
        self.recovery.read().await.contains_key(handle)
    }

    /// Number of recovery-mode tags tracked.
    pub async fn recovery_len(&self) -> usize {
        self.recovery.read().await.len()
    }

    /// Drop recovery-mode tags not seen within `max_age`, returning their handles.
    pub async fn prune_recovery(&self, max_age: Duration) -> Vec<PeripheralHandle> {
        let mut recovery = self.recovery.write().await;
        let expired: Vec<_> = recovery
            .iter()
            .filter(|(_, seen)| seen.elapsed() >= max_age)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in &expired {
            recovery.remove(handle);
            debug!(%handle, "Recovery-mode tag gone");
        }
        expired
    }
}
