//! Firmware update mode.
//!
//! Only one tag can be updated at a time, and while an update runs the
//! coordinator stops scanning, stops connecting and suppresses disconnect
//! notifications. [`DfuCoordinator`] holds that mode flag; entering the mode
//! returns a [`DfuGuard`] that clears it when dropped, so the flag is
//! cleared whether the transfer succeeds, fails or is cancelled.
//!
//! The transfer itself is opaque and provided by a [`FirmwareTransfer`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use tagwatch_types::{LogicalId, PeripheralHandle};

use crate::error::{Error, Result};

/// Performs a firmware transfer to a connected tag.
#[async_trait]
pub trait FirmwareTransfer: Send + Sync {
    /// Run the transfer to completion.
    async fn transfer(&self, handle: &PeripheralHandle) -> Result<()>;
}

/// Mutually exclusive firmware-update mode.
#[derive(Debug, Clone)]
pub struct DfuCoordinator {
    active: Arc<watch::Sender<Option<LogicalId>>>,
}

impl Default for DfuCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuCoordinator {
    /// Create a coordinator with no update running.
    pub fn new() -> Self {
        let (active, _) = watch::channel(None);
        Self {
            active: Arc::new(active),
        }
    }

    /// Whether an update is running.
    pub fn is_active(&self) -> bool {
        self.active.borrow().is_some()
    }

    /// Device being updated.
    pub fn active_device(&self) -> Option<LogicalId> {
        self.active.borrow().clone()
    }

    /// Enter update mode for `id`.
    ///
    /// Fails with [`Error::DfuInProgress`] if another update is running.
    pub fn begin(&self, id: &LogicalId) -> Result<DfuGuard> {
        let mut busy = None;
        self.active.send_if_modified(|current| match current {
            Some(other) => {
                busy = Some(other.clone());
                false
            }
            None => {
                *current = Some(id.clone());
                true
            }
        });

        if let Some(other) = busy {
            return Err(Error::DfuInProgress(other.to_string()));
        }

        info!(device = %id, "Entering firmware update mode");
        Ok(DfuGuard {
            active: Arc::clone(&self.active),
            id: id.clone(),
        })
    }

    /// Watch the mode flag.
    pub fn subscribe(&self) -> watch::Receiver<Option<LogicalId>> {
        self.active.subscribe()
    }

    /// Resolve once no update is running.
    pub async fn wait_inactive(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(Option::is_none).await;
    }
}

/// Keeps update mode active until dropped.
#[derive(Debug)]
pub struct DfuGuard {
    active: Arc<watch::Sender<Option<LogicalId>>>,
    id: LogicalId,
}

impl DfuGuard {
    /// Device being updated.
    pub fn device(&self) -> &LogicalId {
        &self.id
    }
}

impl Drop for DfuGuard {
    fn drop(&mut self) {
        self.active.send_replace(None);
        info!(device = %self.id, "Left firmware update mode");
    }
}
