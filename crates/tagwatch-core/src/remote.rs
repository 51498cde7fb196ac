//! Remote device registry boundary.
//!
//! The backend owns the authoritative record for each tag: alert mode,
//! sharing, auto-connect and the pairing code. The coordinator reads these
//! records every tick to decide what to connect and what to push on
//! connect. It never writes them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use tagwatch_types::{AlertMode, FirmwareVersion, LogicalId};

use crate::error::Result;

/// Sharing arrangement for a tag owned by another user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sharing {
    /// User the tag is shared with.
    pub secondary_user: String,
    /// Whether that user accepted the share.
    pub accepted: bool,
}

/// Backend record of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDeviceRecord {
    /// Logical id of the tag.
    pub id: LogicalId,
    /// Nickname pushed to the tag on connect.
    #[serde(default)]
    pub nickname: Option<String>,
    /// Configured alert mode.
    #[serde(default)]
    pub alert_mode: AlertMode,
    /// Whether the coordinator should keep the tag connected.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Firmware the backend last saw.
    #[serde(default)]
    pub firmware: Option<FirmwareVersion>,
    /// Pairing code written on connect.
    #[serde(default)]
    pub pairing_code: Option<String>,
    /// Buzz duration in seconds.
    #[serde(default)]
    pub buzz_duration: Option<u8>,
    /// Blink duration in seconds.
    #[serde(default)]
    pub blink_duration: Option<u8>,
    /// Present when the tag is shared.
    #[serde(default)]
    pub sharing: Option<Sharing>,
}

fn default_true() -> bool {
    true
}

impl RemoteDeviceRecord {
    /// A record with defaults: low alert, auto-connect on, not shared.
    pub fn new(id: LogicalId) -> Self {
        Self {
            id,
            nickname: None,
            alert_mode: AlertMode::default(),
            auto_connect: true,
            firmware: None,
            pairing_code: None,
            buzz_duration: None,
            blink_duration: None,
            sharing: None,
        }
    }

    /// Whether `user` may auto-connect this tag.
    ///
    /// Unshared tags are always eligible. Shared tags are eligible only for
    /// the secondary user, and only once they accepted.
    pub fn connect_allowed_for(&self, user: &str) -> bool {
        match &self.sharing {
            None => true,
            Some(sharing) => sharing.accepted && sharing.secondary_user == user,
        }
    }
}

/// Link status the coordinator reports per remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Connected.
    Connected,
    /// Connect in progress.
    Connecting,
    /// Dropped, within the grace period.
    Reconnecting,
    /// Not connected.
    #[default]
    Disconnected,
}

/// Source of remote device records.
#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// All records visible to the current user.
    async fn records(&self) -> Result<Vec<RemoteDeviceRecord>>;

    /// Newest firmware offered by the distribution service.
    async fn latest_firmware(&self) -> Result<Option<FirmwareVersion>>;
}

/// In-memory remote registry.
#[derive(Debug, Default)]
pub struct MemoryRemoteRegistry {
    records: RwLock<Vec<RemoteDeviceRecord>>,
    latest_firmware: RwLock<Option<FirmwareVersion>>,
}

impl MemoryRemoteRegistry {
    /// Create a registry serving `records`.
    pub fn new(records: Vec<RemoteDeviceRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            latest_firmware: RwLock::new(None),
        }
    }

    /// Insert or replace a record.
    pub async fn upsert(&self, record: RemoteDeviceRecord) {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Remove a record.
    pub async fn remove(&self, id: &LogicalId) -> bool {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| &r.id != id);
        records.len() != before
    }

    /// Set the firmware offered by the distribution service.
    pub async fn set_latest_firmware(&self, version: Option<FirmwareVersion>) {
        *self.latest_firmware.write().await = version;
    }
}

#[async_trait]
impl RemoteRegistry for MemoryRemoteRegistry {
    async fn records(&self) -> Result<Vec<RemoteDeviceRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn latest_firmware(&self) -> Result<Option<FirmwareVersion>> {
        Ok(*self.latest_firmware.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> LogicalId {
        LogicalId::from_hardware_uuid("0000E50E24DCCA9E").unwrap()
    }

    #[test]
    fn test_unshared_is_eligible() {
        let record = RemoteDeviceRecord::new(id());
        assert!(record.connect_allowed_for("alice"));
    }

    #[test]
    fn test_shared_requires_accepting_secondary() {
        let mut record = RemoteDeviceRecord::new(id());
        record.sharing = Some(Sharing {
            secondary_user: "bob".into(),
            accepted: false,
        });
        assert!(!record.connect_allowed_for("bob"));
        assert!(!record.connect_allowed_for("alice"));

        record.sharing = Some(Sharing {
            secondary_user: "bob".into(),
            accepted: true,
        });
        assert!(record.connect_allowed_for("bob"));
        assert!(!record.connect_allowed_for("alice"));
    }

    #[test]
    fn test_record_defaults_from_json() {
        let record: RemoteDeviceRecord =
            serde_json::from_str(r#"{"id":"E50E24DCCA9E","alert_mode":"high"}"#).unwrap();
        assert!(record.auto_connect);
        assert_eq!(record.alert_mode, AlertMode::High);
        assert!(record.sharing.is_none());
    }

    #[tokio::test]
    async fn test_memory_registry() {
        let registry = MemoryRemoteRegistry::new(vec![RemoteDeviceRecord::new(id())]);
        assert_eq!(registry.records().await.unwrap().len(), 1);

        let mut updated = RemoteDeviceRecord::new(id());
        updated.alert_mode = AlertMode::High;
        registry.upsert(updated).await;
        let records = registry.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alert_mode, AlertMode::High);

        registry
            .set_latest_firmware(Some(FirmwareVersion::new(4, 5, 0)))
            .await;
        assert_eq!(
            registry.latest_firmware().await.unwrap(),
            Some(FirmwareVersion::new(4, 5, 0))
        );

        assert!(registry.remove(&id()).await);
        assert!(registry.records().await.unwrap().is_empty());
    }
}
