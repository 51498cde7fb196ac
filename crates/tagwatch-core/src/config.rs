//! Coordinator configuration.

use std::time::Duration;

use uuid::Uuid;

use tagwatch_types::uuids::TRACKER_SERVICE;

use crate::error::{Error, Result};
use crate::queue::QueueConfig;
use crate::reconnect::ReconnectPolicy;
use crate::rssi::RssiConfig;

/// Scan duty cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// How long each scan window runs.
    pub active: Duration,
    /// Pause between scan windows.
    pub pause: Duration,
    /// Services to filter advertisements by. Empty scans everything.
    pub service_filter: Vec<Uuid>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            active: Duration::from_secs(20),
            pause: Duration::from_secs(10),
            service_filter: vec![TRACKER_SERVICE],
        }
    }
}

impl ScanConfig {
    /// Set the active scan window.
    #[must_use]
    pub fn active(mut self, active: Duration) -> Self {
        self.active = active;
        self
    }

    /// Set the pause between windows.
    #[must_use]
    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Set the service filter.
    #[must_use]
    pub fn service_filter(mut self, filter: Vec<Uuid>) -> Self {
        self.service_filter = filter;
        self
    }
}

/// Configuration for [`crate::ConnectionCoordinator`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tagwatch_core::CoordinatorConfig;
///
/// let config = CoordinatorConfig::default()
///     .user_id("alice")
///     .tick_interval(Duration::from_secs(5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Scan duty cycle.
    pub scan: ScanConfig,
    /// Link-quality evaluation.
    pub rssi: RssiConfig,
    /// Reconnect grace policy.
    pub reconnect: ReconnectPolicy,
    /// Command queue timings.
    pub queue: QueueConfig,
    /// Policy tick period.
    pub tick_interval: Duration,
    /// Disconnected tags unheard for this long are pruned.
    pub prune_interval: Duration,
    /// Recovery-mode tags unseen for this long are pruned.
    pub recovery_prune_interval: Duration,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Current user, for shared-tag eligibility.
    pub user_id: String,
    /// Pick-pocket buffer written with the pick-pocket command.
    pub pick_pocket_buffer_secs: u8,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            rssi: RssiConfig::default(),
            reconnect: ReconnectPolicy::default(),
            queue: QueueConfig::default(),
            tick_interval: Duration::from_secs(10),
            prune_interval: Duration::from_secs(120),
            recovery_prune_interval: Duration::from_secs(30),
            event_capacity: 100,
            user_id: String::new(),
            pick_pocket_buffer_secs: 5,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn scan(mut self, scan: ScanConfig) -> Self {
        self.scan = scan;
        self
    }

    #[must_use]
    pub fn rssi(mut self, rssi: RssiConfig) -> Self {
        self.rssi = rssi;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    #[must_use]
    pub fn recovery_prune_interval(mut self, interval: Duration) -> Self {
        self.recovery_prune_interval = interval;
        self
    }

    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    #[must_use]
    pub fn user_id(mut self, user: impl Into<String>) -> Self {
        self.user_id = user.into();
        self
    }

    #[must_use]
    pub fn pick_pocket_buffer_secs(mut self, secs: u8) -> Self {
        self.pick_pocket_buffer_secs = secs;
        self
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        if self.scan.active.is_zero() {
            return Err(Error::invalid_config("scan active window must be > 0"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::invalid_config("tick_interval must be > 0"));
        }
        if self.recovery_prune_interval.is_zero() || self.prune_interval.is_zero() {
            return Err(Error::invalid_config("prune intervals must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        if self.pick_pocket_buffer_secs == 0 {
            return Err(Error::invalid_config("pick_pocket_buffer_secs must be > 0"));
        }
        self.rssi.validate()?;
        self.reconnect.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}
