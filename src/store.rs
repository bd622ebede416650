//! Entities and store interfaces for readings, leaves, devices and pairings.
//!
//! Persistence sits behind trait objects so the ingestion server and the
//! pairing coordinator never touch a concrete backend. `Stores` bundles the
//! four handles; `mem_store` and `pg_store` provide the implementations.

use crate::frame::TelemetryReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no pairing recorded for device {device}")]
    MissingPairing { device: String },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Identifier a reading is keyed by.
///
/// Frames carrying a leaf name key by name; older bridge firmware sends an
/// empty name and those readings key by hardware address instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Name(String),
    Hardware(String),
}

impl SourceKey {
    /// Storage form of the key. The prefix keeps the two namespaces from
    /// colliding when a leaf is named like a hardware address.
    pub fn storage_key(&self) -> String {
        match self {
            SourceKey::Name(name) => format!("n:{}", name),
            SourceKey::Hardware(id) => format!("i:{}", id),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Natural key of a reading: who it came from and when it was taken.
/// Retransmitted frames derive the same key and collapse into one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadingKey {
    pub source: SourceKey,
    pub timestamp_ms: i64,
}

impl ReadingKey {
    /// Derive the key for a decoded reading. A present but empty name does
    /// not count as a name.
    pub fn for_reading(reading: &TelemetryReading) -> Self {
        let source = match &reading.name {
            Some(name) if !name.is_empty() => SourceKey::Name(name.clone()),
            _ => SourceKey::Hardware(reading.hardware_id.clone()),
        };
        Self {
            source,
            timestamp_ms: reading.timestamp_ms,
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }
}

/// A persisted temperature reading.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: Uuid,
    /// Derived natural-key source (`n:<name>` or `i:<hardware id>`).
    pub source_key: String,
    pub leaf_name: Option<String>,
    pub hardware_id: String,
    pub recorded_at: DateTime<Utc>,
    pub internal_temp: f64,
    pub external_temp: f64,
    pub ambient_temp: f64,
    pub created_at: DateTime<Utc>,
}

/// A sensor unit. Created lazily the first time a device pairs with it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Leaf {
    pub leaf_id: String,
    pub name: String,
    pub org_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A bridge device. Created lazily on first pairing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_name: String,
    pub org_id: Option<String>,
    pub paired_leaf_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pairing lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingStatus {
    Connect,
    Disconnect,
}

impl PairingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingStatus::Connect => "CONNECT",
            PairingStatus::Disconnect => "DISCONNECT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "CONNECT" => Ok(PairingStatus::Connect),
            "DISCONNECT" => Ok(PairingStatus::Disconnect),
            other => Err(StoreError::Corrupt(format!(
                "unknown pairing status {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pairing row for a device. At most one per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pairing {
    pub device_name: String,
    pub leaf_id: String,
    pub status: PairingStatus,
    /// When the current pairing was first established. Reaffirmations do
    /// not move this.
    pub connected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Typed mutation applied to a device's pairing row.
#[derive(Debug, Clone)]
pub enum PairingChange {
    /// Insert or replace the row: CONNECT to the given leaf with a fresh
    /// connection time and a cleared disconnection time.
    Connect { leaf_id: String, at: DateTime<Utc> },
    /// Refresh an existing row back to CONNECT, keeping its connection
    /// time and clearing any disconnection time.
    Reaffirm { at: DateTime<Utc> },
    /// Mark the row DISCONNECT and record when.
    Disconnect { at: DateTime<Utc> },
}

/// Store for telemetry readings. Writes are idempotent under the natural
/// key; rows are never updated or deleted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Insert the reading unless a row with the same key already exists.
    /// Returns `true` when a new row was written, `false` when the key was
    /// already present; the latter is a success, not an error.
    async fn insert_if_absent(
        &self,
        key: &ReadingKey,
        reading: &TelemetryReading,
    ) -> Result<bool, StoreError>;

    /// Readings for one source with `from <= recorded_at < to`, ascending.
    async fn find_range(
        &self,
        source: &SourceKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeafStore: Send + Sync {
    async fn find(&self, leaf_id: &str) -> Result<Option<Leaf>, StoreError>;

    async fn create(&self, leaf_id: &str, name: &str) -> Result<Leaf, StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find(&self, device_name: &str) -> Result<Option<Device>, StoreError>;

    async fn create(&self, device_name: &str) -> Result<Device, StoreError>;

    async fn set_paired_leaf(&self, device_name: &str, leaf_id: &str) -> Result<(), StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PairingStore: Send + Sync {
    async fn find(&self, device_name: &str) -> Result<Option<Pairing>, StoreError>;

    /// Apply a change and return the resulting row. `Connect` upserts;
    /// `Reaffirm` and `Disconnect` require an existing row and fail with
    /// [`StoreError::MissingPairing`] otherwise.
    async fn apply(&self, device_name: &str, change: PairingChange)
        -> Result<Pairing, StoreError>;
}

/// The four store handles the gateway runs on.
#[derive(Clone)]
pub struct Stores {
    pub readings: Arc<dyn ReadingStore>,
    pub leaves: Arc<dyn LeafStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub pairings: Arc<dyn PairingStore>,
}

impl Stores {
    /// All four stores backed by one in-memory backend. Nothing survives a
    /// restart; meant for development and tests.
    pub fn memory() -> Self {
        let backend = Arc::new(crate::mem_store::MemoryStore::new());
        Self {
            readings: backend.clone(),
            leaves: backend.clone(),
            devices: backend.clone(),
            pairings: backend,
        }
    }

    /// All four stores backed by one PostgreSQL pool.
    pub fn postgres(backend: crate::pg_store::PgStore) -> Self {
        let backend = Arc::new(backend);
        Self {
            readings: backend.clone(),
            leaves: backend.clone(),
            devices: backend.clone(),
            pairings: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(name: Option<&str>) -> TelemetryReading {
        TelemetryReading {
            name: name.map(str::to_string),
            hardware_id: "a:bc:1:0:ff:10".to_string(),
            timestamp_ms: 1_690_000_000_000,
            internal_temp: 30.0,
            external_temp: 25.0,
            ambient_temp: 20.0,
        }
    }

    #[test]
    fn test_named_reading_keys_by_name() {
        let key = ReadingKey::for_reading(&reading(Some("band-7")));
        assert_eq!(key.source, SourceKey::Name("band-7".to_string()));
        assert_eq!(key.source.storage_key(), "n:band-7");
        assert_eq!(key.timestamp_ms, 1_690_000_000_000);
    }

    #[test]
    fn test_unnamed_reading_falls_back_to_hardware_id() {
        let key = ReadingKey::for_reading(&reading(None));
        assert_eq!(key.source, SourceKey::Hardware("a:bc:1:0:ff:10".to_string()));
        assert_eq!(key.source.storage_key(), "i:a:bc:1:0:ff:10");
    }

    #[test]
    fn test_empty_name_falls_back_to_hardware_id() {
        let key = ReadingKey::for_reading(&reading(Some("")));
        assert_eq!(key.source, SourceKey::Hardware("a:bc:1:0:ff:10".to_string()));
    }

    #[test]
    fn test_recorded_at_converts_millis() {
        let key = ReadingKey::for_reading(&reading(Some("band-7")));
        assert_eq!(key.recorded_at().timestamp_millis(), 1_690_000_000_000);
    }

    #[test]
    fn test_pairing_status_serialization() {
        assert_eq!(
            serde_json::to_string(&PairingStatus::Connect).unwrap(),
            "\"CONNECT\""
        );
        assert_eq!(
            serde_json::to_string(&PairingStatus::Disconnect).unwrap(),
            "\"DISCONNECT\""
        );

        let parsed: PairingStatus = serde_json::from_str("\"DISCONNECT\"").unwrap();
        assert_eq!(parsed, PairingStatus::Disconnect);
    }

    #[test]
    fn test_pairing_status_round_trips_storage_form() {
        assert_eq!(PairingStatus::parse("CONNECT").unwrap(), PairingStatus::Connect);
        assert_eq!(
            PairingStatus::parse(PairingStatus::Disconnect.as_str()).unwrap(),
            PairingStatus::Disconnect
        );
        assert!(PairingStatus::parse("connected").is_err());
    }
}
