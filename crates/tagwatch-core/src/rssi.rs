//! Link-quality evaluation.
//!
//! While a tag is connected its RSSI is read on a fixed interval. Samples go
//! into a sliding window; once the window is full the mean is checked
//! against a threshold and, if the link is persistently weak, the tag is
//! switched to high transmit power. The switch happens at most once per
//! connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tagwatch_types::PeripheralHandle;

use crate::error::{Error, Result};
use crate::radio::RadioAdapter;

/// Link-quality evaluation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssiConfig {
    /// Number of samples averaged.
    pub window: usize,
    /// Mean at or below which high transmit power is enabled (dBm).
    pub threshold: i16,
    /// Time between RSSI reads.
    pub interval: Duration,
}

impl Default for RssiConfig {
    fn default() -> Self {
        Self {
            window: 10,
            threshold: -80,
            interval: Duration::from_secs(2),
        }
    }
}

impl RssiConfig {
    /// Set the window size.
    #[must_use]
    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Set the threshold.
    #[must_use]
    pub fn threshold(mut self, threshold: i16) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the sampling interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(Error::invalid_config("rssi window must be > 0"));
        }
        if self.interval.is_zero() {
            return Err(Error::invalid_config("rssi interval must be > 0"));
        }
        if self.threshold >= 0 {
            return Err(Error::invalid_config("rssi threshold must be negative"));
        }
        Ok(())
    }
}

/// Sliding window of RSSI samples for one connection.
#[derive(Debug, Clone)]
pub struct RssiWindow {
    samples: VecDeque<i16>,
    capacity: usize,
    threshold: i16,
    last: Option<i16>,
    high_power: bool,
}

impl RssiWindow {
    /// Create an empty window.
    pub fn new(config: &RssiConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window),
            capacity: config.window.max(1),
            threshold: config.threshold,
            last: None,
            high_power: false,
        }
    }

    /// Add a sample.
    ///
    /// Returns the window mean when this sample is the one that crosses the
    /// threshold and high power should be switched on. Once the window is
    /// full the oldest sample is dropped after every evaluation.
    pub fn push(&mut self, rssi: i16) -> Option<i16> {
        self.samples.push_back(rssi);
        self.last = Some(rssi);

        if self.samples.len() < self.capacity {
            return None;
        }

        let mean = self.mean();
        let mut verdict = None;
        if let Some(mean) = mean
            && mean <= f64::from(self.threshold)
            && !self.high_power
        {
            self.high_power = true;
            verdict = Some(mean.round() as i16);
        }

        self.samples.pop_front();
        verdict
    }

    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i32 = self.samples.iter().map(|s| i32::from(*s)).sum();
        Some(f64::from(sum) / self.samples.len() as f64)
    }

    /// Mean of the samples currently held.
    pub fn average(&self) -> Option<i16> {
        self.mean().map(|m| m.round() as i16)
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<i16> {
        self.last
    }

    /// Samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether high transmit power was switched on this connection.
    pub fn is_high_power(&self) -> bool {
        self.high_power
    }

    /// Forget all samples and the high-power flag.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last = None;
        self.high_power = false;
    }
}

/// Spawn a task that requests an RSSI read every `interval` until `cancel` fires.
///
/// The values come back as radio events; the task only paces the requests.
/// It also stops by itself once the radio reports the link is gone.
pub fn spawn_sampler(
    radio: Arc<dyn RadioAdapter>,
    handle: PeripheralHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match radio.read_rssi(&handle).await {
                        Ok(()) => trace!(device = %handle, "RSSI read requested"),
                        Err(Error::NotConnected) => break,
                        Err(e) => debug!(device = %handle, "RSSI read failed: {}", e),
                    }
                }
            }
        }
        debug!(device = %handle, "RSSI sampling stopped");
    })
}
