//! Mock radio adapter for unit testing.
//!
//! [`MockRadio`] implements [`RadioAdapter`] without hardware. It records
//! every request, tracks how many writes are in flight per peripheral, and
//! lets tests inject advertisements, link drops and notifications.
//!
//! By default connect and disconnect requests are answered immediately with
//! the matching [`RadioEvent`]. Disable that with
//! [`MockRadio::set_auto_connect`] to drive the link by hand.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, broadcast};
use uuid::Uuid;

use tagwatch_types::uuids::NOTIFY_CHARACTERISTIC;
use tagwatch_types::{AdvertisementFlags, PeripheralHandle};

use crate::error::{Error, Result};
use crate::radio::{RadioAdapter, RadioEvent, WriteKind};

/// A write the mock received, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Target peripheral.
    pub handle: PeripheralHandle,
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Frame bytes.
    pub value: Vec<u8>,
}

/// A mock radio adapter for testing.
///
/// # Example
///
/// ```
/// use tagwatch_core::{MockRadio, RadioAdapter};
/// use tagwatch_types::PeripheralHandle;
///
/// #[tokio::main]
/// async fn main() {
///     let radio = MockRadio::new();
///     let handle = PeripheralHandle::new("tag-1");
///     radio.connect(&handle).await.unwrap();
///     assert!(radio.is_connected(&handle).await);
/// }
/// ```
pub struct MockRadio {
    events: broadcast::Sender<RadioEvent>,
    scanning: AtomicBool,
    scan_starts: AtomicU32,
    auto_connect: AtomicBool,
    fail_connects: AtomicBool,
    remaining_write_failures: AtomicU32,
    write_latency_ms: AtomicU64,
    hold_writes: AtomicBool,
    write_permits: Semaphore,
    default_rssi: AtomicI16,
    connected: Mutex<HashSet<PeripheralHandle>>,
    connect_requests: Mutex<Vec<PeripheralHandle>>,
    disconnect_requests: Mutex<Vec<PeripheralHandle>>,
    writes: Mutex<Vec<RecordedWrite>>,
    in_flight: Mutex<HashMap<PeripheralHandle, usize>>,
    max_in_flight: Mutex<HashMap<PeripheralHandle, usize>>,
    values: Mutex<HashMap<(PeripheralHandle, Uuid), Vec<u8>>>,
    responses: Mutex<HashMap<u8, Vec<u8>>>,
    notify: Mutex<HashSet<(PeripheralHandle, Uuid)>>,
    rssi_script: Mutex<HashMap<PeripheralHandle, VecDeque<i16>>>,
    rssi_reads: AtomicU32,
}

impl std::fmt::Debug for MockRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRadio")
            .field("scanning", &self.scanning.load(Ordering::Relaxed))
            .field("auto_connect", &self.auto_connect.load(Ordering::Relaxed))
            .field("hold_writes", &self.hold_writes.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    /// Create a mock radio with auto-connect enabled.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            scanning: AtomicBool::new(false),
            scan_starts: AtomicU32::new(0),
            auto_connect: AtomicBool::new(true),
            fail_connects: AtomicBool::new(false),
            remaining_write_failures: AtomicU32::new(0),
            write_latency_ms: AtomicU64::new(0),
            hold_writes: AtomicBool::new(false),
            write_permits: Semaphore::new(0),
            default_rssi: AtomicI16::new(-50),
            connected: Mutex::new(HashSet::new()),
            connect_requests: Mutex::new(Vec::new()),
            disconnect_requests: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            notify: Mutex::new(HashSet::new()),
            rssi_script: Mutex::new(HashMap::new()),
            rssi_reads: AtomicU32::new(0),
        }
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    // --- Event injection ---

    /// Inject an arbitrary radio event.
    pub fn inject(&self, event: RadioEvent) {
        self.emit(event);
    }

    /// Inject a normal advertisement.
    pub fn advertise(&self, handle: &PeripheralHandle, advertised_id: &str, rssi: i16) {
        self.advertise_with_flags(handle, advertised_id, rssi, AdvertisementFlags::default());
    }

    /// Inject an advertisement carrying recovery / FDS markers.
    pub fn advertise_with_flags(
        &self,
        handle: &PeripheralHandle,
        advertised_id: &str,
        rssi: i16,
        flags: AdvertisementFlags,
    ) {
        self.emit(RadioEvent::Discovered {
            handle: handle.clone(),
            advertised_id: advertised_id.to_string(),
            name: Some("Tag".to_string()),
            rssi: Some(rssi),
            flags,
        });
    }

    /// Report a link as established.
    pub async fn accept_connection(&self, handle: &PeripheralHandle) {
        self.connected.lock().await.insert(handle.clone());
        self.emit(RadioEvent::Connected {
            handle: handle.clone(),
        });
    }

    /// Report a failed connect attempt.
    pub fn reject_connection(&self, handle: &PeripheralHandle, error: &str) {
        self.emit(RadioEvent::FailedToConnect {
            handle: handle.clone(),
            error: Some(error.to_string()),
        });
    }

    /// Drop the link as if the tag went out of range.
    pub async fn drop_link(&self, handle: &PeripheralHandle) {
        self.connected.lock().await.remove(handle);
        self.emit(RadioEvent::Disconnected {
            handle: handle.clone(),
            error: Some("link supervision timeout".to_string()),
        });
    }

    /// Deliver a frame on the notify characteristic.
    pub fn notify_frame(&self, handle: &PeripheralHandle, value: &[u8]) {
        self.emit(RadioEvent::CharacteristicUpdated {
            handle: handle.clone(),
            characteristic: NOTIFY_CHARACTERISTIC,
            value: value.to_vec(),
        });
    }

    // --- Behaviour control ---

    /// Answer connect/disconnect requests automatically.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::Relaxed);
    }

    /// Answer connect requests with [`RadioEvent::FailedToConnect`].
    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `count` writes.
    pub fn set_write_failures(&self, count: u32) {
        self.remaining_write_failures.store(count, Ordering::Relaxed);
    }

    /// Delay every write by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.write_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Hold writes until released with [`MockRadio::release_writes`].
    ///
    /// Held writes count as in flight, which lets tests observe the queue
    /// with an outstanding write.
    pub fn hold_writes(&self, hold: bool) {
        self.hold_writes.store(hold, Ordering::SeqCst);
    }

    /// Let `count` held writes complete.
    pub fn release_writes(&self, count: usize) {
        self.write_permits.add_permits(count);
    }

    /// Value returned by reads of a characteristic.
    pub async fn set_characteristic_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
    ) {
        self.values
            .lock()
            .await
            .insert((handle.clone(), characteristic), value.to_vec());
    }

    /// Answer writes with the given opcode by a frame on the notify characteristic.
    pub async fn set_write_response(&self, opcode: u8, response: &[u8]) {
        self.responses.lock().await.insert(opcode, response.to_vec());
    }

    /// RSSI returned when no script is queued.
    pub fn set_rssi(&self, rssi: i16) {
        self.default_rssi.store(rssi, Ordering::Relaxed);
    }

    /// Queue RSSI values returned by successive reads for one peripheral.
    pub async fn script_rssi(&self, handle: &PeripheralHandle, samples: &[i16]) {
        self.rssi_script
            .lock()
            .await
            .entry(handle.clone())
            .or_default()
            .extend(samples.iter().copied());
    }

    // --- Inspection ---

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// How many times scanning was started.
    pub fn scan_starts(&self) -> u32 {
        self.scan_starts.load(Ordering::SeqCst)
    }

    /// Whether the mock considers the peripheral connected.
    pub async fn is_connected(&self, handle: &PeripheralHandle) -> bool {
        self.connected.lock().await.contains(handle)
    }

    /// Connect requests in order.
    pub async fn connect_requests(&self) -> Vec<PeripheralHandle> {
        self.connect_requests.lock().await.clone()
    }

    /// Disconnect requests in order.
    pub async fn disconnect_requests(&self) -> Vec<PeripheralHandle> {
        self.disconnect_requests.lock().await.clone()
    }

    /// Every write, in dispatch order.
    pub async fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().await.clone()
    }

    /// Frames written to one peripheral, in dispatch order.
    pub async fn frames_for(&self, handle: &PeripheralHandle) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .await
            .iter()
            .filter(|w| &w.handle == handle)
            .map(|w| w.value.clone())
            .collect()
    }

    /// Forget recorded writes.
    pub async fn clear_writes(&self) {
        self.writes.lock().await.clear();
    }

    /// Writes currently outstanding for a peripheral.
    pub async fn in_flight(&self, handle: &PeripheralHandle) -> usize {
        self.in_flight
            .lock()
            .await
            .get(handle)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of concurrent writes ever seen for a peripheral.
    pub async fn max_in_flight(&self, handle: &PeripheralHandle) -> usize {
        self.max_in_flight
            .lock()
            .await
            .get(handle)
            .copied()
            .unwrap_or(0)
    }

    /// Whether notifications are enabled on a characteristic.
    pub async fn is_notifying(&self, handle: &PeripheralHandle, characteristic: Uuid) -> bool {
        self.notify
            .lock()
            .await
            .contains(&(handle.clone(), characteristic))
    }

    /// Number of RSSI reads served.
    pub fn rssi_reads(&self) -> u32 {
        self.rssi_reads.load(Ordering::SeqCst)
    }

    async fn begin_write(&self, handle: &PeripheralHandle) {
        let mut in_flight = self.in_flight.lock().await;
        let count = in_flight.entry(handle.clone()).or_insert(0);
        *count += 1;
        let now = *count;
        drop(in_flight);

        let mut max = self.max_in_flight.lock().await;
        let peak = max.entry(handle.clone()).or_insert(0);
        *peak = (*peak).max(now);
    }

    async fn end_write(&self, handle: &PeripheralHandle) {
        if let Some(count) = self.in_flight.lock().await.get_mut(handle) {
            *count = count.saturating_sub(1);
        }
    }

    async fn check_connected(&self, handle: &PeripheralHandle) -> Result<()> {
        if self.connected.lock().await.contains(handle) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn complete_write(&self, handle: &PeripheralHandle, value: &[u8]) -> Result<()> {
        if self.hold_writes.load(Ordering::SeqCst) {
            self.write_permits
                .acquire()
                .await
                .map_err(|_| Error::Cancelled)?
                .forget();
        }

        let latency = self.write_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.remaining_write_failures.load(Ordering::Relaxed) > 0 {
            self.remaining_write_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::radio("injected write failure"));
        }

        self.check_connected(handle).await?;

        let response = match value.first() {
            Some(opcode) => self.responses.lock().await.get(opcode).cloned(),
            None => None,
        };
        if let Some(response) = response {
            self.notify_frame(handle, &response);
        }
        Ok(())
    }
}

#[async_trait]
impl RadioAdapter for MockRadio {
    async fn start_scan(&self, _service_filter: &[Uuid]) -> Result<()> {
        self.scanning.store(true, Ordering::SeqCst);
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.connect_requests.lock().await.push(handle.clone());
        if !self.auto_connect.load(Ordering::Relaxed) {
            return Ok(());
        }
        if self.fail_connects.load(Ordering::Relaxed) {
            self.reject_connection(handle, "connection refused");
        } else {
            self.accept_connection(handle).await;
        }
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.disconnect_requests.lock().await.push(handle.clone());
        if self.auto_connect.load(Ordering::Relaxed) {
            self.connected.lock().await.remove(handle);
            self.emit(RadioEvent::Disconnected {
                handle: handle.clone(),
                error: None,
            });
        }
        Ok(())
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<()> {
        self.check_connected(handle).await
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        _kind: WriteKind,
    ) -> Result<()> {
        self.writes.lock().await.push(RecordedWrite {
            handle: handle.clone(),
            characteristic,
            value: value.to_vec(),
        });

        self.begin_write(handle).await;
        let result = self.complete_write(handle, value).await;
        self.end_write(handle).await;
        result
    }

    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        self.check_connected(handle).await?;
        self.values
            .lock()
            .await
            .get(&(handle.clone(), characteristic))
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(characteristic.to_string()))
    }

    async fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        let key = (handle.clone(), characteristic);
        let mut notify = self.notify.lock().await;
        if enabled {
            notify.insert(key);
        } else {
            notify.remove(&key);
        }
        Ok(())
    }

    async fn read_rssi(&self, handle: &PeripheralHandle) -> Result<()> {
        self.check_connected(handle).await?;
        let scripted = self
            .rssi_script
            .lock()
            .await
            .get_mut(handle)
            .and_then(|q| q.pop_front());
        let rssi = scripted.unwrap_or_else(|| self.default_rssi.load(Ordering::Relaxed));
        self.rssi_reads.fetch_add(1, Ordering::SeqCst);
        self.emit(RadioEvent::RssiRead {
            handle: handle.clone(),
            rssi,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}
