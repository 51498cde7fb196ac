//! End-to-end tests of the connection coordinator over the mock radio.
//!
//! Every test runs on a paused clock, so grace periods and scan windows
//! elapse instantly once all tasks are idle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use tagwatch_core::uuids::FIRMWARE_REVISION;
use tagwatch_core::{
    AdvertisementFlags, AlertMode, Command, ConnectionCoordinator, CoordinatorConfig, DeviceEvent,
    DisconnectReason, Error, EventReceiver, FirmwareTransfer, FirmwareVersion, FixedLocation,
    LinkStatus, Location, LogicalId, MemoryRemoteRegistry, MemoryStore, MockRadio,
    NotificationKind, OperationOutcome, PeripheralHandle, PolicyFlags, RecordStore,
    RemoteDeviceRecord, Result, Sharing, TrackerDevice, commands_for_policy,
};

const HW: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
const HOME: Location = Location {
    latitude: 59.437,
    longitude: 24.7536,
};

fn id() -> LogicalId {
    LogicalId::from_hardware_uuid(HW).unwrap()
}

fn handle() -> PeripheralHandle {
    PeripheralHandle::new("tag-1")
}

struct Harness {
    radio: Arc<MockRadio>,
    remote: Arc<MemoryRemoteRegistry>,
    store: Arc<MemoryStore>,
    coordinator: Arc<ConnectionCoordinator>,
    events: EventReceiver,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Route core logs to the test output; set `RUST_LOG` to see them.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    async fn start(records: Vec<RemoteDeviceRecord>) -> Self {
        init_logging();
        let radio = Arc::new(MockRadio::new());
        let remote = Arc::new(MemoryRemoteRegistry::new(records));
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(
            ConnectionCoordinator::new(
                radio.clone(),
                remote.clone(),
                store.clone(),
                Arc::new(FixedLocation(Some(HOME))),
                CoordinatorConfig::default().user_id("alice"),
            )
            .unwrap(),
        );
        let events = coordinator.events().subscribe();
        let cancel = CancellationToken::new();
        let task = coordinator.start(cancel.clone());
        Self {
            radio,
            remote,
            store,
            coordinator,
            events,
            cancel,
            task,
        }
    }

    /// Next event matching `pred` within `within`, skipping the rest.
    async fn wait_for<F>(&mut self, within: Duration, mut pred: F) -> Option<DeviceEvent>
    where
        F: FnMut(&DeviceEvent) -> bool,
    {
        let events = &mut self.events;
        timeout(within, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return Some(event),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Advertise the tag and wait until the coordinator connected it and
    /// finished the post-connect sequence.
    async fn connect_tag(&mut self, firmware: Option<&[u8]>) -> Arc<TrackerDevice> {
        if let Some(raw) = firmware {
            self.radio
                .set_characteristic_value(&handle(), FIRMWARE_REVISION, raw)
                .await;
        }
        self.radio.advertise(&handle(), HW, -60);
        self.wait_for(Duration::from_secs(30), |e| {
            matches!(e, DeviceEvent::Connected { .. })
        })
        .await
        .expect("tag connected");

        // Let the event loop finish the connect effects before looking at the queue.
        sleep(Duration::from_millis(10)).await;
        let device = self.coordinator.device(&id()).await.unwrap();
        if firmware.is_some() {
            timeout(Duration::from_secs(5), async {
                while device.firmware().await.is_none() {
                    sleep(Duration::from_millis(50)).await;
                }
            })
            .await
            .expect("firmware reported");
        }
        timeout(Duration::from_secs(5), device.queue().wait_idle())
            .await
            .expect("post-connect sequence drained");
        device
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
        self.coordinator.shutdown().await;
    }
}

fn frame(cmd: Command) -> Vec<u8> {
    cmd.encode().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_discovery_is_reported_once() {
    let mut h = Harness::start(vec![]).await;

    h.radio.advertise(&handle(), HW, -60);
    let event = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::Discovered { .. })
        })
        .await
        .unwrap();
    assert_eq!(event.device(), Some(&id()));

    h.radio.advertise(&handle(), HW, -55);
    h.radio.advertise(&handle(), HW, -50);
    assert!(
        h.wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::Discovered { .. })
        })
        .await
        .is_none()
    );
    assert_eq!(h.coordinator.registry().len().await, 1);

    let device = h.coordinator.device(&id()).await.unwrap();
    assert_eq!(device.snapshot().await.rssi, Some(-50));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_tick_connects_and_runs_post_connect_sequence() {
    let mut record = RemoteDeviceRecord::new(id());
    record.nickname = Some("Keys".into());
    record.buzz_duration = Some(10);
    let mut h = Harness::start(vec![record]).await;

    let device = h.connect_tag(Some(b"4.4.9")).await;
    assert_eq!(device.firmware().await, Some(FirmwareVersion::new(4, 4, 9)));
    assert_eq!(h.coordinator.link_status(&id()).await, LinkStatus::Connected);
    assert!(h.radio.is_notifying(&handle(), tagwatch_core::uuids::NOTIFY_CHARACTERISTIC).await);
    assert!(device.is_sampling().await);

    let mut expected: Vec<Vec<u8>> =
        commands_for_policy(&PolicyFlags::default(), AlertMode::Low, 5)
            .into_iter()
            .map(frame)
            .collect();
    expected.push(frame(Command::SetBuzzDuration(10)));
    expected.push(frame(Command::Rename("Keys".into())));
    assert_eq!(h.radio.frames_for(&handle()).await, expected);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_drop_within_grace_is_not_reported() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.connect_tag(Some(b"4.4.9")).await;

    h.radio.drop_link(&handle()).await;
    let scheduled = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::ReconnectScheduled { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        scheduled,
        DeviceEvent::ReconnectScheduled { grace_secs: 90, .. }
    ));
    assert_eq!(h.coordinator.link_status(&id()).await, LinkStatus::Reconnecting);

    // The next policy tick reconnects well inside the grace period.
    h.wait_for(Duration::from_secs(30), |e| {
        matches!(e, DeviceEvent::Connected { .. })
    })
    .await
    .expect("reconnected");
    assert!(!h.coordinator.reconnect_scheduler().is_pending(&id()).await);

    assert!(
        h.wait_for(Duration::from_secs(180), |e| {
            matches!(e, DeviceEvent::Disconnected { .. })
        })
        .await
        .is_none()
    );
    assert!(h.store.is_empty().await);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_drop_outlasting_grace_is_reported() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.connect_tag(Some(b"4.4.9")).await;

    h.radio.set_fail_connects(true);
    h.radio.drop_link(&handle()).await;
    let dropped_at = Instant::now();

    h.wait_for(Duration::from_secs(120), |e| {
        matches!(e, DeviceEvent::SensorRemoved { .. })
    })
    .await
    .expect("device removed");
    let event = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::Disconnected { .. })
        })
        .await
        .expect("disconnect reported");
    assert!(dropped_at.elapsed() >= Duration::from_secs(90));

    match event {
        DeviceEvent::Disconnected { reason, alert, .. } => {
            assert_eq!(
                reason,
                DisconnectReason::BleError("link supervision timeout".into())
            );
            assert!(alert);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(h.coordinator.device(&id()).await.is_none());
    assert_eq!(h.coordinator.link_status(&id()).await, LinkStatus::Disconnected);

    let record = h.store.read_record(&id()).await.unwrap().unwrap();
    assert_eq!(record.last_location, Some(HOME));
    assert!(record.last_seen.is_some());
    assert_eq!(
        record.notifications.last().map(|n| n.kind.clone()),
        Some(NotificationKind::Disconnected { alerted: true })
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_old_firmware_reports_drop_immediately() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.connect_tag(Some(b"4.4.7")).await;

    h.radio.drop_link(&handle()).await;
    let scheduled = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::ReconnectScheduled { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        scheduled,
        DeviceEvent::ReconnectScheduled { grace_secs: 0, .. }
    ));
    assert!(
        h.wait_for(Duration::from_secs(1), |e| {
            matches!(e, DeviceEvent::Disconnected { .. })
        })
        .await
        .is_some()
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_requested_disconnect_has_no_grace() {
    let mut record = RemoteDeviceRecord::new(id());
    record.auto_connect = false;
    let mut h = Harness::start(vec![record]).await;

    h.radio.advertise(&handle(), HW, -60);
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::Discovered { .. })
    })
    .await
    .unwrap();
    h.coordinator.connect(&id()).await.unwrap();
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::Connected { .. })
    })
    .await
    .unwrap();

    h.coordinator.disconnect(&id()).await.unwrap();
    let event = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(
                e,
                DeviceEvent::Disconnected { .. } | DeviceEvent::ReconnectScheduled { .. }
            )
        })
        .await
        .unwrap();
    assert!(matches!(
        event,
        DeviceEvent::Disconnected {
            reason: DisconnectReason::UserRequested,
            alert: false,
            ..
        }
    ));

    // Auto-connect is off, so the tag stays down.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.radio.connect_requests().await.len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_runs_one_write_at_a_time_in_order() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    let device = h.connect_tag(None).await;
    h.radio.clear_writes().await;

    h.radio.hold_writes(true);
    device.set_alert_mode(AlertMode::High).await.unwrap();
    device.set_buzz_duration(10).await.unwrap();
    let last = device.set_nickname("Fido").await.unwrap();
    assert!(!device.queue().is_idle());

    h.radio.release_writes(2);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.radio.in_flight(&handle()).await, 1);
    assert!(!device.queue().is_idle());

    h.radio.release_writes(1);
    assert_eq!(last.wait().await, OperationOutcome::Completed);
    device.queue().wait_idle().await;

    assert_eq!(
        h.radio.frames_for(&handle()).await,
        vec![
            frame(Command::SetAlertMode(AlertMode::High)),
            frame(Command::SetBuzzDuration(10)),
            frame(Command::Rename("Fido".into())),
        ]
    );
    assert_eq!(h.radio.max_in_flight(&handle()).await, 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_weak_link_enables_high_power_once() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.radio.script_rssi(&handle(), &[-90; 15]).await;
    let device = h.connect_tag(None).await;

    let event = h
        .wait_for(Duration::from_secs(60), |e| {
            matches!(e, DeviceEvent::AdaptivePowerEnabled { .. })
        })
        .await
        .expect("high power enabled");
    assert!(matches!(
        event,
        DeviceEvent::AdaptivePowerEnabled {
            average_rssi: -90,
            ..
        }
    ));
    device.queue().wait_idle().await;
    assert!(device.is_high_power().await);

    let frames = h.radio.frames_for(&handle()).await;
    let adaptive_off = frame(Command::SetAdaptiveMode(false));
    let power_up = frame(Command::SetTxPower(true));
    let tail = &frames[frames.len() - 2..];
    assert_eq!(tail, &[adaptive_off, power_up]);

    assert!(
        h.wait_for(Duration::from_secs(60), |e| {
            matches!(e, DeviceEvent::AdaptivePowerEnabled { .. })
        })
        .await
        .is_none()
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_starts_with_fresh_link_window() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.radio.set_rssi(-90);
    let device = h.connect_tag(Some(b"4.4.9")).await;

    h.wait_for(Duration::from_secs(60), |e| {
        matches!(e, DeviceEvent::AdaptivePowerEnabled { .. })
    })
    .await
    .expect("high power enabled on first connection");
    assert!(device.is_high_power().await);

    // The window survives the drop and is discarded on the next connect.
    h.radio.drop_link(&handle()).await;
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::ReconnectScheduled { .. })
    })
    .await
    .unwrap();
    assert!(device.rssi_samples().await > 0);

    h.wait_for(Duration::from_secs(30), |e| {
        matches!(e, DeviceEvent::Connected { .. })
    })
    .await
    .expect("reconnected within grace");
    let same = h.coordinator.device(&id()).await.unwrap();
    assert!(Arc::ptr_eq(&device, &same));
    assert_eq!(device.rssi_samples().await, 0);
    assert!(!device.is_high_power().await);

    h.wait_for(Duration::from_secs(60), |e| {
        matches!(e, DeviceEvent::AdaptivePowerEnabled { .. })
    })
    .await
    .expect("high power enabled again on the new connection");
    assert!(device.is_high_power().await);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shared_tag_only_connects_for_accepted_secondary_user() {
    let mut record = RemoteDeviceRecord::new(id());
    record.sharing = Some(Sharing {
        secondary_user: "bob".into(),
        accepted: true,
    });
    let mut h = Harness::start(vec![record.clone()]).await;

    h.radio.advertise(&handle(), HW, -60);
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::Discovered { .. })
    })
    .await
    .unwrap();
    sleep(Duration::from_secs(30)).await;
    assert!(h.radio.connect_requests().await.is_empty());
    assert_eq!(h.coordinator.link_status(&id()).await, LinkStatus::Disconnected);

    // Shared with alice instead: the next tick connects.
    record.sharing = Some(Sharing {
        secondary_user: "alice".into(),
        accepted: true,
    });
    h.remote.upsert(record).await;
    h.wait_for(Duration::from_secs(30), |e| {
        matches!(e, DeviceEvent::Connected { .. })
    })
    .await
    .expect("connected once shared with alice");
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_dfu_mode_pauses_scanning_and_connects() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    let guard = h.coordinator.dfu().begin(&id()).unwrap();

    h.radio.advertise(&handle(), HW, -60);
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::Discovered { .. })
    })
    .await
    .unwrap();

    sleep(Duration::from_secs(60)).await;
    assert!(h.radio.connect_requests().await.is_empty());
    assert!(!h.radio.is_scanning());
    let scans = h.radio.scan_starts();
    assert!(scans <= 1);
    assert!(matches!(
        h.coordinator.connect(&id()).await,
        Err(Error::DfuInProgress(_))
    ));

    drop(guard);
    h.wait_for(Duration::from_secs(30), |e| {
        matches!(e, DeviceEvent::Connected { .. })
    })
    .await
    .expect("connected after update mode ended");
    assert!(h.radio.scan_starts() > scans);
    h.stop().await;
}

/// Transfer that reboots the tag halfway through.
struct RebootingTransfer {
    radio: Arc<MockRadio>,
    fail: bool,
}

#[async_trait]
impl FirmwareTransfer for RebootingTransfer {
    async fn transfer(&self, handle: &PeripheralHandle) -> Result<()> {
        self.radio.drop_link(handle).await;
        sleep(Duration::from_secs(5)).await;
        if self.fail {
            Err(Error::radio("image rejected"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_firmware_update_suppresses_disconnect_alert() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.connect_tag(None).await;

    let transfer = RebootingTransfer {
        radio: h.radio.clone(),
        fail: false,
    };
    h.coordinator
        .update_firmware(&id(), &transfer)
        .await
        .unwrap();
    assert!(!h.coordinator.dfu().is_active());

    let mut seen = Vec::new();
    while let Some(event) = h
        .wait_for(Duration::from_secs(1), |e| {
            !matches!(e, DeviceEvent::ConnectFailed { .. })
        })
        .await
    {
        let finished = matches!(event, DeviceEvent::DfuFinished { .. });
        seen.push(event);
        if finished {
            break;
        }
    }

    assert!(matches!(seen.first(), Some(DeviceEvent::DfuStarted { .. })));
    assert!(
        seen.iter()
            .any(|e| matches!(e, DeviceEvent::SensorRemoved { .. }))
    );
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, DeviceEvent::Disconnected { .. }))
    );
    assert!(matches!(
        seen.last(),
        Some(DeviceEvent::DfuFinished { success: true, .. })
    ));

    let record = h.store.read_record(&id()).await.unwrap().unwrap();
    assert_eq!(
        record.notifications.last().map(|n| n.kind.clone()),
        Some(NotificationKind::Disconnected { alerted: false })
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_firmware_update_clears_mode() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.connect_tag(None).await;

    let transfer = RebootingTransfer {
        radio: h.radio.clone(),
        fail: true,
    };
    assert!(h.coordinator.update_firmware(&id(), &transfer).await.is_err());
    assert!(!h.coordinator.dfu().is_active());
    assert!(
        h.wait_for(Duration::from_secs(1), |e| {
            matches!(e, DeviceEvent::DfuFinished { success: false, .. })
        })
        .await
        .is_some()
    );
    h.stop().await;
}

/// Transfer that keeps the link up for a minute.
struct SlowTransfer;

#[async_trait]
impl FirmwareTransfer for SlowTransfer {
    async fn transfer(&self, _handle: &PeripheralHandle) -> Result<()> {
        sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_firmware_update_pauses_rssi_sampling() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.radio.set_rssi(-95);
    let device = h.connect_tag(None).await;
    assert!(device.is_sampling().await);
    h.radio.clear_writes().await;

    let coordinator = h.coordinator.clone();
    let update =
        tokio::spawn(async move { coordinator.update_firmware(&id(), &SlowTransfer).await });
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::DfuStarted { .. })
    })
    .await
    .unwrap();
    assert!(!device.is_sampling().await);

    let reads = h.radio.rssi_reads();
    sleep(Duration::from_secs(50)).await;
    assert!(h.coordinator.dfu().is_active());
    assert_eq!(h.radio.rssi_reads(), reads);
    let power_up = frame(Command::SetTxPower(true));
    assert!(!h.radio.frames_for(&handle()).await.contains(&power_up));

    update.await.unwrap().unwrap();
    assert!(device.is_sampling().await);
    h.wait_for(Duration::from_secs(60), |e| {
        matches!(e, DeviceEvent::AdaptivePowerEnabled { .. })
    })
    .await
    .expect("weak link handled once the update finished");
    assert!(h.radio.rssi_reads() > reads);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_policy_change_pushes_commands_and_silences_alerts() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    let device = h.connect_tag(Some(b"4.4.7")).await;
    h.radio.clear_writes().await;

    let sleep_mode = PolicyFlags {
        sleep: true,
        ..Default::default()
    };
    h.coordinator.set_policy(sleep_mode).await.unwrap();
    device.queue().wait_idle().await;

    let expected: Vec<Vec<u8>> = commands_for_policy(&sleep_mode, AlertMode::Low, 5)
        .into_iter()
        .map(frame)
        .collect();
    assert_eq!(h.radio.frames_for(&handle()).await, expected);

    // Same flags again: nothing is pushed.
    h.radio.clear_writes().await;
    h.coordinator.set_policy(sleep_mode).await.unwrap();
    assert!(h.radio.frames_for(&handle()).await.is_empty());

    h.radio.drop_link(&handle()).await;
    let event = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::Disconnected { .. })
        })
        .await
        .unwrap();
    assert!(matches!(event, DeviceEvent::Disconnected { alert: false, .. }));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_button_and_battery_notifications() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    let device = h.connect_tag(None).await;

    h.radio.notify_frame(&handle(), &[0xB1, 0x02]);
    let event = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::ButtonPressed { .. })
        })
        .await
        .unwrap();
    assert!(matches!(event, DeviceEvent::ButtonPressed { clicks: 2, .. }));

    h.radio.notify_frame(&handle(), &[0xB2, 0x4B]);
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::BatteryLevel { percent: 75, .. })
    })
    .await
    .unwrap();
    assert_eq!(device.battery().await, Some(75));

    let record = h.store.read_record(&id()).await.unwrap().unwrap();
    assert_eq!(
        record.notifications[0].kind,
        NotificationKind::ButtonPressed { clicks: 2 }
    );
    assert_eq!(record.notifications[0].location, Some(HOME));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_pairing_runs_recovery_on_reconnect() {
    let mut record = RemoteDeviceRecord::new(id());
    record.pairing_code = Some("0123456789abcdef".into());
    let mut h = Harness::start(vec![record]).await;
    h.connect_tag(Some(b"4.4.9")).await;
    h.radio.clear_writes().await;

    h.radio.notify_frame(&handle(), &[0xA7, 0x05]);
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::FdsRecoveryStarted { .. })
    })
    .await
    .expect("recovery flagged");

    // The link is dropped and the next connect runs the recovery writes.
    h.wait_for(Duration::from_secs(30), |e| {
        matches!(e, DeviceEvent::Connected { .. })
    })
    .await
    .expect("reconnected");
    h.wait_for(Duration::from_secs(30), |e| {
        matches!(e, DeviceEvent::ReconnectScheduled { .. })
    })
    .await
    .expect("dropped after recovery");

    let frames = h.radio.frames_for(&handle()).await;
    assert_eq!(
        frames,
        vec![
            frame(Command::WritePairingCode("0123456789abcdef".into())),
            frame(Command::ManualDisconnect),
        ]
    );
    let device = h.coordinator.device(&id()).await.unwrap();
    assert!(!device.has_fds_error().await);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fds_error_advertisement_flags_device() {
    let mut record = RemoteDeviceRecord::new(id());
    record.auto_connect = false;
    let mut h = Harness::start(vec![record]).await;

    let flags = AdvertisementFlags {
        dfu_recovery: false,
        fds_error: true,
    };
    h.radio.advertise_with_flags(&handle(), HW, -60, flags);
    h.radio.advertise_with_flags(&handle(), HW, -60, flags);

    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::FdsRecoveryStarted { .. })
    })
    .await
    .unwrap();
    assert!(
        h.wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::FdsRecoveryStarted { .. })
        })
        .await
        .is_none()
    );
    let device = h.coordinator.device(&id()).await.unwrap();
    assert!(device.has_fds_error().await);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_newer_firmware_available_is_reported() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    h.remote
        .set_latest_firmware(Some(FirmwareVersion::new(4, 5, 0)))
        .await;
    h.connect_tag(Some(b"4.4.9")).await;

    let event = h
        .wait_for(Duration::from_secs(5), |e| {
            matches!(e, DeviceEvent::FirmwareUpdatePending { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        event,
        DeviceEvent::FirmwareUpdatePending { current, latest, .. }
            if current == FirmwareVersion::new(4, 4, 9) && latest == FirmwareVersion::new(4, 5, 0)
    ));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_mode_tags_are_pruned() {
    let mut h = Harness::start(vec![]).await;
    let flags = AdvertisementFlags {
        dfu_recovery: true,
        fds_error: false,
    };
    h.radio
        .advertise_with_flags(&PeripheralHandle::new("dfu-1"), HW, -70, flags);

    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::RecoveryObserved { .. })
    })
    .await
    .unwrap();
    assert!(h.coordinator.registry().is_empty().await);

    h.wait_for(Duration::from_secs(90), |e| {
        matches!(e, DeviceEvent::RecoveryCleared { .. })
    })
    .await
    .expect("recovery entry pruned");
    assert_eq!(h.coordinator.registry().recovery_len().await, 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_disconnected_tag_is_pruned() {
    let mut record = RemoteDeviceRecord::new(id());
    record.auto_connect = false;
    let mut h = Harness::start(vec![record]).await;

    h.radio.advertise(&handle(), HW, -60);
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::Discovered { .. })
    })
    .await
    .unwrap();

    h.wait_for(Duration::from_secs(200), |e| {
        matches!(e, DeviceEvent::SensorRemoved { .. })
    })
    .await
    .expect("stale tag removed");
    assert!(h.coordinator.device(&id()).await.is_none());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let mut h = Harness::start(vec![RemoteDeviceRecord::new(id())]).await;
    let device = h.connect_tag(Some(b"4.4.9")).await;

    h.radio.set_fail_connects(true);
    h.radio.drop_link(&handle()).await;
    h.wait_for(Duration::from_secs(5), |e| {
        matches!(e, DeviceEvent::ReconnectScheduled { .. })
    })
    .await
    .unwrap();

    let coordinator = h.coordinator.clone();
    let radio = h.radio.clone();
    h.stop().await;

    assert!(coordinator.reconnect_scheduler().pending().await.is_empty());
    assert!(!device.is_sampling().await);
    assert!(!radio.is_scanning());
    assert!(!device.reconnect_pending().await);
}
