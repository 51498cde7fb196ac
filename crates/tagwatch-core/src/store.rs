//! Local record store and location boundaries.
//!
//! The core persists a small record per tag (last location, last seen time,
//! notification history) through [`RecordStore`]. It does not own the
//! schema of whatever database sits behind it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use tagwatch_types::LogicalId;

use crate::error::{Error, Result};

/// Notification entries kept per record.
pub const MAX_NOTIFICATIONS: usize = 100;

/// A geographic position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// What a notification was about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    /// Tag left range.
    Disconnected {
        /// Whether the user was alerted.
        alerted: bool,
    },
    /// Tag button pressed.
    ButtonPressed {
        /// Presses in the burst.
        clicks: u8,
    },
}

/// One entry of a tag's notification history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntry {
    /// When it happened.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// What happened.
    #[serde(flatten)]
    pub kind: NotificationKind,
    /// Where the phone was.
    pub location: Option<Location>,
}

impl NotificationEntry {
    /// Entry stamped with the current time.
    pub fn now(kind: NotificationKind, location: Option<Location>) -> Self {
        Self {
            at: OffsetDateTime::now_utc(),
            kind,
            location,
        }
    }
}

/// Locally persisted state of a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Logical id of the tag.
    pub id: LogicalId,
    /// Where the tag was last known to be.
    pub last_location: Option<Location>,
    /// When the tag was last seen.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    /// Newest last.
    #[serde(default)]
    pub notifications: Vec<NotificationEntry>,
}

impl DeviceRecord {
    /// Empty record.
    pub fn new(id: LogicalId) -> Self {
        Self {
            id,
            last_location: None,
            last_seen: None,
            notifications: Vec::new(),
        }
    }

    /// Append a notification, dropping the oldest past [`MAX_NOTIFICATIONS`].
    pub fn push_notification(&mut self, entry: NotificationEntry) {
        self.notifications.push(entry);
        if self.notifications.len() > MAX_NOTIFICATIONS {
            let excess = self.notifications.len() - MAX_NOTIFICATIONS;
            self.notifications.drain(..excess);
        }
    }
}

/// Key-value access to device records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record.
    async fn read_record(&self, id: &LogicalId) -> Result<Option<DeviceRecord>>;

    /// Write a record, replacing any previous one.
    async fn write_record(&self, record: DeviceRecord) -> Result<()>;
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<LogicalId, DeviceRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records as a JSON array, sorted by id.
    pub async fn snapshot_json(&self) -> Result<String> {
        let records = self.records.read().await;
        let mut all: Vec<&DeviceRecord> = records.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        serde_json::to_string_pretty(&all)
            .map_err(|e| Error::Store(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read_record(&self, id: &LogicalId) -> Result<Option<DeviceRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn write_record(&self, record: DeviceRecord) -> Result<()> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }
}

/// Source of the phone's current location.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current location, if known.
    async fn current_location(&self) -> Option<Location>;
}

/// Location provider returning a fixed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocation(pub Option<Location>);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Option<Location> {
        self.0
    }
}
