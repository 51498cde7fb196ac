//! [`RadioAdapter`] over the system Bluetooth stack, using btleplug.
//!
//! One background task pumps the adapter's [`CentralEvent`] stream into
//! [`RadioEvent`]s. Connects run on their own task so the caller only issues
//! the request; the outcome arrives on the event stream like every other
//! link change. Notifications of each connected peripheral are forwarded by
//! a per-peripheral task started after service discovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use tagwatch_types::{AdvertisementFlags, PeripheralHandle};

use crate::error::{Error, Result};
use crate::radio::{RadioAdapter, RadioEvent, WriteKind};

const EVENT_CAPACITY: usize = 256;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Stringify a peripheral id.
///
/// On macOS peripheral ids are UUIDs. On other platforms they wrap the
/// device address.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Hardware identifier a logical id is derived from.
///
/// macOS reports a zero address, so the peripheral id is used instead.
fn hardware_identifier(address: &str, peripheral_id: &str) -> String {
    if address == "00:00:00:00:00:00" {
        peripheral_id.to_string()
    } else {
        address.to_string()
    }
}

struct Shared {
    adapter: Adapter,
    events: broadcast::Sender<RadioEvent>,
    peripherals: RwLock<HashMap<PeripheralHandle, Peripheral>>,
    characteristics: RwLock<HashMap<PeripheralHandle, HashMap<Uuid, Characteristic>>>,
    forwarders: RwLock<HashMap<PeripheralHandle, JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    async fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        self.peripherals
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::device_not_found(handle.as_str()))
    }

    async fn characteristic(&self, handle: &PeripheralHandle, uuid: Uuid) -> Result<Characteristic> {
        let cache = self.characteristics.read().await;
        let Some(characteristics) = cache.get(handle) else {
            return Err(Error::NotConnected);
        };
        characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(uuid.to_string()))
    }

    async fn forget_session(&self, handle: &PeripheralHandle) {
        self.characteristics.write().await.remove(handle);
        if let Some(task) = self.forwarders.write().await.remove(handle) {
            task.abort();
        }
    }

    async fn on_advertisement(&self, id: &PeripheralId) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                trace!("Advertisement for vanished peripheral: {}", e);
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => return,
            Err(e) => {
                trace!("No properties for peripheral: {}", e);
                return;
            }
        };

        let peripheral_id = format_peripheral_id(id);
        let handle = PeripheralHandle::new(peripheral_id.clone());
        let advertised_id =
            hardware_identifier(&properties.address.to_string(), &peripheral_id);
        let manufacturer = properties.manufacturer_data.values().next();
        let flags = AdvertisementFlags::from_advertisement(
            properties.local_name.as_deref(),
            manufacturer.map(Vec::as_slice),
        );

        self.peripherals
            .write()
            .await
            .insert(handle.clone(), peripheral);
        self.emit(RadioEvent::Discovered {
            handle,
            advertised_id,
            name: properties.local_name,
            rssi: properties.rssi,
            flags,
        });
    }

    async fn on_disconnect(&self, id: &PeripheralId) {
        let handle = PeripheralHandle::new(format_peripheral_id(id));
        self.forget_session(&handle).await;
        debug!(%handle, "Peripheral disconnected");
        self.emit(RadioEvent::Disconnected {
            handle,
            error: None,
        });
    }
}

/// Radio adapter backed by the first system Bluetooth adapter.
pub struct BtleplugRadio {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
    connect_timeout: Duration,
    discovery_timeout: Duration,
}

impl std::fmt::Debug for BtleplugRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugRadio")
            .field("connect_timeout", &self.connect_timeout)
            .field("discovery_timeout", &self.discovery_timeout)
            .finish()
    }
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter and start pumping its events.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::radio("no Bluetooth adapter found"))?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        Self::with_adapter(adapter).await
    }

    /// Wrap an already opened adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let mut central_events = adapter.events().await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            adapter,
            events,
            peripherals: RwLock::new(HashMap::new()),
            characteristics: RwLock::new(HashMap::new()),
            forwarders: RwLock::new(HashMap::new()),
        });

        let pump_shared = Arc::clone(&shared);
        let pump = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                        pump_shared.on_advertisement(&id).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => pump_shared.on_disconnect(&id).await,
                    other => trace!("Ignoring central event {:?}", other),
                }
            }
            warn!("Bluetooth adapter event stream ended");
        });

        Ok(Self {
            shared,
            pump,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        })
    }

    /// Set how long a connect attempt may take before it is reported failed.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl RadioAdapter for BtleplugRadio {
    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()> {
        let filter = ScanFilter {
            services: service_filter.to_vec(),
        };
        self.shared.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.shared.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.shared.peripheral(handle).await?;
        let shared = Arc::clone(&self.shared);
        let handle = handle.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let event = match timeout(connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => RadioEvent::Connected { handle },
                Ok(Err(e)) => RadioEvent::FailedToConnect {
                    handle,
                    error: Some(e.to_string()),
                },
                Err(_) => {
                    // Abandon the pending attempt so the stack does not
                    // complete it behind our back.
                    let _ = peripheral.disconnect().await;
                    RadioEvent::FailedToConnect {
                        handle,
                        error: Some(format!("connect timed out after {:?}", connect_timeout)),
                    }
                }
            };
            shared.emit(event);
        });
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.shared.peripheral(handle).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.shared.peripheral(handle).await?;
        timeout(self.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover_services", self.discovery_timeout))??;

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        debug!(%handle, count = characteristics.len(), "Services discovered");
        self.shared
            .characteristics
            .write()
            .await
            .insert(handle.clone(), characteristics);

        let mut notifications = peripheral.notifications().await?;
        let shared = Arc::clone(&self.shared);
        let forward_handle = handle.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                shared.emit(RadioEvent::CharacteristicUpdated {
                    handle: forward_handle.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
        });
        if let Some(previous) = self
            .shared
            .forwarders
            .write()
            .await
            .insert(handle.clone(), task)
        {
            previous.abort();
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        let peripheral = self.shared.peripheral(handle).await?;
        let target = self.shared.characteristic(handle, characteristic).await?;
        if target.service_uuid != service {
            return Err(Error::characteristic_not_found(format!(
                "{} in service {}",
                characteristic, service
            )));
        }
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral.write(&target, value, write_type).await?;
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let peripheral = self.shared.peripheral(handle).await?;
        let target = self.shared.characteristic(handle, characteristic).await?;
        Ok(peripheral.read(&target).await?)
    }

    async fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        let peripheral = self.shared.peripheral(handle).await?;
        let target = self.shared.characteristic(handle, characteristic).await?;
        if enabled {
            peripheral.subscribe(&target).await?;
        } else {
            peripheral.unsubscribe(&target).await?;
        }
        Ok(())
    }

    async fn read_rssi(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.shared.peripheral(handle).await?;
        let rssi = peripheral
            .properties()
            .await?
            .and_then(|p| p.rssi)
            .ok_or_else(|| Error::radio("peripheral reported no RSSI"))?;
        self.shared.emit(RadioEvent::RssiRead {
            handle: handle.clone(),
            rssi,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.shared.events.subscribe()
    }
}
