//! In-memory store backend.
//!
//! Backs all four store traits with maps under `parking_lot` locks. Selected
//! with `database.backend = "memory"`; nothing survives a restart, so it is
//! for development and tests only.

use crate::frame::TelemetryReading;
use crate::store::{
    Device, DeviceStore, Leaf, LeafStore, Pairing, PairingChange, PairingStatus, PairingStore,
    Reading, ReadingKey, ReadingStore, SourceKey, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// One shared backend for readings, leaves, devices and pairings.
#[derive(Default)]
pub struct MemoryStore {
    readings: RwLock<HashMap<(String, i64), Reading>>,
    leaves: RwLock<HashMap<String, Leaf>>,
    devices: RwLock<HashMap<String, Device>>,
    pairings: RwLock<HashMap<String, Pairing>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        key: &ReadingKey,
        reading: &TelemetryReading,
    ) -> Result<bool, StoreError> {
        let mut readings = self.readings.write();
        let map_key = (key.source.storage_key(), key.timestamp_ms);
        if readings.contains_key(&map_key) {
            return Ok(false);
        }

        readings.insert(
            map_key,
            Reading {
                id: Uuid::new_v4(),
                source_key: key.source.storage_key(),
                leaf_name: reading.name.clone(),
                hardware_id: reading.hardware_id.clone(),
                recorded_at: key.recorded_at(),
                internal_temp: reading.internal_temp,
                external_temp: reading.external_temp,
                ambient_temp: reading.ambient_temp,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn find_range(
        &self,
        source: &SourceKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let storage_key = source.storage_key();
        let mut rows: Vec<Reading> = self
            .readings
            .read()
            .values()
            .filter(|r| r.source_key == storage_key && r.recorded_at >= from && r.recorded_at < to)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.recorded_at);
        Ok(rows)
    }
}

#[async_trait]
impl LeafStore for MemoryStore {
    async fn find(&self, leaf_id: &str) -> Result<Option<Leaf>, StoreError> {
        Ok(self.leaves.read().get(leaf_id).cloned())
    }

    async fn create(&self, leaf_id: &str, name: &str) -> Result<Leaf, StoreError> {
        let mut leaves = self.leaves.write();
        let leaf = leaves
            .entry(leaf_id.to_string())
            .or_insert_with(|| Leaf {
                leaf_id: leaf_id.to_string(),
                name: name.to_string(),
                org_id: None,
                created_at: Utc::now(),
            });
        Ok(leaf.clone())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find(&self, device_name: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.devices.read().get(device_name).cloned())
    }

    async fn create(&self, device_name: &str) -> Result<Device, StoreError> {
        let mut devices = self.devices.write();
        let device = devices
            .entry(device_name.to_string())
            .or_insert_with(|| Device {
                device_name: device_name.to_string(),
                org_id: None,
                paired_leaf_id: None,
                created_at: Utc::now(),
            });
        Ok(device.clone())
    }

    async fn set_paired_leaf(&self, device_name: &str, leaf_id: &str) -> Result<(), StoreError> {
        if let Some(device) = self.devices.write().get_mut(device_name) {
            device.paired_leaf_id = Some(leaf_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl PairingStore for MemoryStore {
    async fn find(&self, device_name: &str) -> Result<Option<Pairing>, StoreError> {
        Ok(self.pairings.read().get(device_name).cloned())
    }

    async fn apply(
        &self,
        device_name: &str,
        change: PairingChange,
    ) -> Result<Pairing, StoreError> {
        let mut pairings = self.pairings.write();
        match change {
            PairingChange::Connect { leaf_id, at } => {
                let row = pairings
                    .entry(device_name.to_string())
                    .and_modify(|p| {
                        p.leaf_id = leaf_id.clone();
                        p.status = PairingStatus::Connect;
                        p.connected_at = at;
                        p.updated_at = at;
                        p.disconnected_at = None;
                    })
                    .or_insert_with(|| Pairing {
                        device_name: device_name.to_string(),
                        leaf_id,
                        status: PairingStatus::Connect,
                        connected_at: at,
                        updated_at: at,
                        disconnected_at: None,
                    });
                Ok(row.clone())
            }
            PairingChange::Reaffirm { at } => {
                let row = pairings
                    .get_mut(device_name)
                    .ok_or_else(|| StoreError::MissingPairing {
                        device: device_name.to_string(),
                    })?;
                row.status = PairingStatus::Connect;
                row.updated_at = at;
                row.disconnected_at = None;
                Ok(row.clone())
            }
            PairingChange::Disconnect { at } => {
                let row = pairings
                    .get_mut(device_name)
                    .ok_or_else(|| StoreError::MissingPairing {
                        device: device_name.to_string(),
                    })?;
                row.status = PairingStatus::Disconnect;
                row.updated_at = at;
                row.disconnected_at = Some(at);
                Ok(row.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    fn reading_at(ts_ms: i64) -> TelemetryReading {
        TelemetryReading {
            name: Some("band-7".to_string()),
            hardware_id: "1:2:3:4:5:6".to_string(),
            timestamp_ms: ts_ms,
            internal_temp: 30.0,
            external_temp: 25.0,
            ambient_temp: 20.0,
        }
    }

    fn at(ts_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ts_ms).unwrap()
    }

    #[tokio::test]
    async fn test_insert_if_absent_collapses_duplicates() {
        let store = MemoryStore::new();
        let reading = reading_at(1_690_000_000_000);
        let key = ReadingKey::for_reading(&reading);

        assert!(store.insert_if_absent(&key, &reading).await.unwrap());
        assert!(!store.insert_if_absent(&key, &reading).await.unwrap());

        let rows = store
            .find_range(&key.source, at(0), DateTime::<Utc>::MAX_UTC)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].leaf_name.as_deref(), Some("band-7"));
        assert_eq!(rows[0].source_key, "n:band-7");
    }

    #[tokio::test]
    async fn test_find_range_is_half_open_and_ascending() {
        let store = MemoryStore::new();
        for ts in [3_000, 1_000, 2_000] {
            let reading = reading_at(ts);
            let key = ReadingKey::for_reading(&reading);
            store.insert_if_absent(&key, &reading).await.unwrap();
        }

        let source = SourceKey::Name("band-7".to_string());
        let rows = store.find_range(&source, at(1_000), at(3_000)).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.recorded_at).collect::<Vec<_>>(),
            vec![at(1_000), at(2_000)]
        );
    }

    #[tokio::test]
    async fn test_find_range_ignores_other_sources() {
        let store = MemoryStore::new();
        let named = reading_at(1_000);
        store
            .insert_if_absent(&ReadingKey::for_reading(&named), &named)
            .await
            .unwrap();

        let other = SourceKey::Hardware("1:2:3:4:5:6".to_string());
        assert!(store.find_range(&other, at(0), at(10_000)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_then_reaffirm_keeps_connected_at() {
        let store = MemoryStore::new();
        let connected = store
            .apply(
                "bridge-1",
                PairingChange::Connect {
                    leaf_id: "leaf-1".to_string(),
                    at: at(1_000),
                },
            )
            .await
            .unwrap();
        assert_eq!(connected.status, PairingStatus::Connect);

        let reaffirmed = store
            .apply("bridge-1", PairingChange::Reaffirm { at: at(2_000) })
            .await
            .unwrap();
        assert_eq!(reaffirmed.connected_at, at(1_000));
        assert_eq!(reaffirmed.updated_at, at(2_000));
        assert_eq!(reaffirmed.disconnected_at, None);
    }

    #[tokio::test]
    async fn test_disconnect_then_connect_clears_disconnected_at() {
        let store = MemoryStore::new();
        store
            .apply(
                "bridge-1",
                PairingChange::Connect {
                    leaf_id: "leaf-1".to_string(),
                    at: at(1_000),
                },
            )
            .await
            .unwrap();

        let disconnected = store
            .apply("bridge-1", PairingChange::Disconnect { at: at(2_000) })
            .await
            .unwrap();
        assert_eq!(disconnected.status, PairingStatus::Disconnect);
        assert_eq!(disconnected.disconnected_at, Some(at(2_000)));

        let reconnected = store
            .apply(
                "bridge-1",
                PairingChange::Connect {
                    leaf_id: "leaf-2".to_string(),
                    at: at(3_000),
                },
            )
            .await
            .unwrap();
        assert_eq!(reconnected.leaf_id, "leaf-2");
        assert_eq!(reconnected.connected_at, at(3_000));
        assert_eq!(reconnected.disconnected_at, None);
    }

    #[tokio::test]
    async fn test_reaffirm_without_row_is_missing_pairing() {
        let store = MemoryStore::new();
        let err = store
            .apply("bridge-9", PairingChange::Reaffirm { at: at(1_000) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingPairing { .. }));
    }

    #[tokio::test]
    async fn test_set_paired_leaf_updates_device() {
        let store = MemoryStore::new();
        DeviceStore::create(&store, "bridge-1").await.unwrap();
        assert_ok!(store.set_paired_leaf("bridge-1", "leaf-1").await);

        let device = DeviceStore::find(&store, "bridge-1").await.unwrap().unwrap();
        assert_eq!(device.paired_leaf_id.as_deref(), Some("leaf-1"));
    }
}
