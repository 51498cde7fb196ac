//! Reconnect grace timers.
//!
//! When a connected tag drops, the drop is not reported straight away.
//! A per-device timer is started instead; if the tag comes back before it
//! fires the timer is cancelled and nothing is reported. Newer firmware
//! reconnects quickly, so it gets a longer grace period.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tagwatch_types::{FirmwareVersion, LogicalId};

use crate::error::{Error, Result};

/// Grace period selection keyed by firmware version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Firmware at or above this version gets the extended grace.
    pub baseline: FirmwareVersion,
    /// Grace for firmware at or above the baseline.
    pub extended_grace: Duration,
    /// Grace for older or unknown firmware.
    pub default_grace: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            baseline: FirmwareVersion::new(4, 4, 8),
            extended_grace: Duration::from_secs(90),
            default_grace: Duration::ZERO,
        }
    }
}

impl ReconnectPolicy {
    /// Set the baseline firmware version.
    #[must_use]
    pub fn baseline(mut self, version: FirmwareVersion) -> Self {
        self.baseline = version;
        self
    }

    /// Set the extended grace period.
    #[must_use]
    pub fn extended_grace(mut self, grace: Duration) -> Self {
        self.extended_grace = grace;
        self
    }

    /// Set the default grace period.
    #[must_use]
    pub fn default_grace(mut self, grace: Duration) -> Self {
        self.default_grace = grace;
        self
    }

    /// Grace period for a tag reporting `firmware`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use tagwatch_core::ReconnectPolicy;
    /// use tagwatch_types::FirmwareVersion;
    ///
    /// let policy = ReconnectPolicy::default();
    /// assert_eq!(policy.grace_for(Some(FirmwareVersion::new(4, 4, 9))), Duration::from_secs(90));
    /// assert_eq!(policy.grace_for(Some(FirmwareVersion::new(4, 4, 7))), Duration::ZERO);
    /// assert_eq!(policy.grace_for(None), Duration::ZERO);
    /// ```
    pub fn grace_for(&self, firmware: Option<FirmwareVersion>) -> Duration {
        match firmware {
            Some(version) if version >= self.baseline => self.extended_grace,
            _ => self.default_grace,
        }
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.extended_grace < self.default_grace {
            return Err(Error::invalid_config(
                "extended_grace must be >= default_grace",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PendingReconnect {
    cancel: CancellationToken,
    deadline: Instant,
    generation: u64,
}

/// Per-device grace timers.
#[derive(Debug, Default)]
pub struct ReconnectScheduler {
    timers: Arc<Mutex<HashMap<LogicalId, PendingReconnect>>>,
    generation: AtomicU64,
}

impl ReconnectScheduler {
    /// Create a scheduler with no timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the grace timer for a device.
    ///
    /// `on_expire` runs if the timer is not cancelled within `grace`.
    pub async fn schedule<F>(&self, id: LogicalId, grace: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        {
            let mut timers = self.timers.lock().await;
            if let Some(previous) = timers.insert(
                id.clone(),
                PendingReconnect {
                    cancel: cancel.clone(),
                    deadline: Instant::now() + grace,
                    generation,
                },
            ) {
                previous.cancel.cancel();
            }
        }
        debug!(device = %id, ?grace, "Reconnect grace started");

        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(grace) => {
                    {
                        // Cancelled or replaced while waiting for the lock.
                        let mut timers = timers.lock().await;
                        if !timers.get(&id).is_some_and(|p| p.generation == generation) {
                            return;
                        }
                        timers.remove(&id);
                    }
                    debug!(device = %id, "Reconnect grace expired");
                    on_expire.await;
                }
            }
        });
    }

    /// Cancel the timer for a device. Returns whether one was pending.
    pub async fn cancel(&self, id: &LogicalId) -> bool {
        match self.timers.lock().await.remove(id) {
            Some(pending) => {
                pending.cancel.cancel();
                debug!(device = %id, "Reconnect grace cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a timer is pending for a device.
    pub async fn is_pending(&self, id: &LogicalId) -> bool {
        self.timers.lock().await.contains_key(id)
    }

    /// Time left on a device's timer.
    pub async fn remaining(&self, id: &LogicalId) -> Option<Duration> {
        self.timers
            .lock()
            .await
            .get(id)
            .map(|p| p.deadline.saturating_duration_since(Instant::now()))
    }

    /// Devices with a pending timer.
    pub async fn pending(&self) -> Vec<LogicalId> {
        self.timers.lock().await.keys().cloned().collect()
    }

    /// Cancel every timer. Returns how many were pending.
    pub async fn cancel_all(&self) -> usize {
        let mut timers = self.timers.lock().await;
        let count = timers.len();
        for (_, pending) in timers.drain() {
            pending.cancel.cancel();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn id() -> LogicalId {
        LogicalId::from_hardware_uuid("0000E50E24DCCA9E").unwrap()
    }

    #[test]
    fn test_grace_by_firmware() {
        let policy = ReconnectPolicy::default();
        let v = |s: &str| Some(s.parse::<FirmwareVersion>().unwrap());

        assert_eq!(policy.grace_for(v("4.4.9")), Duration::from_secs(90));
        assert_eq!(policy.grace_for(v("4.4.8")), Duration::from_secs(90));
        assert_eq!(policy.grace_for(v("4.3.12")), Duration::ZERO);
        assert_eq!(policy.grace_for(v("5.0.0")), Duration::from_secs(90));
        assert_eq!(policy.grace_for(None), Duration::ZERO);
    }

    #[test]
    fn test_policy_validation() {
        assert!(ReconnectPolicy::default().validate().is_ok());
        let bad = ReconnectPolicy::default()
            .extended_grace(Duration::from_secs(1))
            .default_grace(Duration::from_secs(5));
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_grace() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();

        scheduler
            .schedule(id(), Duration::from_secs(90), async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(scheduler.is_pending(&id()).await);

        tokio::time::sleep(Duration::from_secs(89)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending(&id()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();

        scheduler
            .schedule(id(), Duration::from_secs(90), async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(scheduler.cancel(&id()).await);
        assert!(!scheduler.cancel(&id()).await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let f = fired.clone();
            scheduler
                .schedule(id(), Duration::from_secs(10), async move {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_cancelled_after_expiry_does_not_fire() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();

        scheduler
            .schedule(id(), Duration::from_secs(10), async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // Hold the map so the expired timer parks on the lock.
        let mut timers = scheduler.timers.lock().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let pending = timers.remove(&id()).unwrap();
        pending.cancel.cancel();
        drop(timers);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_pending(&id()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_and_cancel_all() {
        let scheduler = ReconnectScheduler::new();
        scheduler
            .schedule(id(), Duration::from_secs(90), async {})
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            scheduler.remaining(&id()).await,
            Some(Duration::from_secs(60))
        );
        assert_eq!(scheduler.pending().await, vec![id()]);
        assert_eq!(scheduler.cancel_all().await, 1);
        assert!(scheduler.pending().await.is_empty());
    }
}
