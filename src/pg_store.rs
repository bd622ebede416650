//! PostgreSQL store backend.
//!
//! One connection pool backs all four store traits. Reading inserts land on
//! `ON CONFLICT DO NOTHING` so retransmitted frames collapse into the
//! existing row; pairing mutations are single-statement upserts/updates.

use crate::config::DatabaseConfig;
use crate::frame::TelemetryReading;
use crate::store::{
    Device, DeviceStore, Leaf, LeafStore, Pairing, PairingChange, PairingStatus, PairingStore,
    Reading, ReadingKey, ReadingStore, SourceKey, StoreError,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// PostgreSQL-backed stores.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with exponential backoff, bounded by the configured connect
    /// timeout. The database is often still starting when the gateway comes
    /// up under an orchestrator.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(config.connect_timeout_secs)),
            ..Default::default()
        };

        let pool = loop {
            match Self::try_connect(config).await {
                Ok(pool) => break pool,
                Err(e) => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "PostgreSQL not ready, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e).context("Failed to connect to PostgreSQL"),
                },
            }
        };

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    async fn try_connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    #[instrument(skip(self, reading), fields(key = %key.source, recorded_at = key.timestamp_ms))]
    async fn insert_if_absent(
        &self,
        key: &ReadingKey,
        reading: &TelemetryReading,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO readings (
                id, source_key, leaf_name, hardware_id, recorded_at,
                internal_temp, external_temp, ambient_temp, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, NOW()
            )
            ON CONFLICT (source_key, recorded_at) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.source.storage_key())
        .bind(&reading.name)
        .bind(&reading.hardware_id)
        .bind(key.recorded_at())
        .bind(reading.internal_temp)
        .bind(reading.external_temp)
        .bind(reading.ambient_temp)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            metrics::counter!("gateway.readings.stored").increment(1);
        } else {
            debug!("Duplicate reading, kept existing row");
            metrics::counter!("gateway.readings.duplicate").increment(1);
        }

        Ok(inserted)
    }

    async fn find_range(
        &self,
        source: &SourceKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, source_key, leaf_name, hardware_id, recorded_at,
                   internal_temp, external_temp, ambient_temp, created_at
            FROM readings
            WHERE source_key = $1 AND recorded_at >= $2 AND recorded_at < $3
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(source.storage_key())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl LeafStore for PgStore {
    async fn find(&self, leaf_id: &str) -> Result<Option<Leaf>, StoreError> {
        let leaf = sqlx::query_as::<_, Leaf>(
            r#"
            SELECT leaf_id, name, org_id, created_at
            FROM leaves
            WHERE leaf_id = $1
            "#,
        )
        .bind(leaf_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(leaf)
    }

    #[instrument(skip(self))]
    async fn create(&self, leaf_id: &str, name: &str) -> Result<Leaf, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO leaves (leaf_id, name, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (leaf_id) DO NOTHING
            "#,
        )
        .bind(leaf_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        // Either our insert or a concurrent one; the row exists now.
        let leaf = sqlx::query_as::<_, Leaf>(
            r#"
            SELECT leaf_id, name, org_id, created_at
            FROM leaves
            WHERE leaf_id = $1
            "#,
        )
        .bind(leaf_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(leaf)
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn find(&self, device_name: &str) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_name, org_id, paired_leaf_id, created_at
            FROM devices
            WHERE device_name = $1
            "#,
        )
        .bind(device_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(device)
    }

    #[instrument(skip(self))]
    async fn create(&self, device_name: &str) -> Result<Device, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_name, created_at)
            VALUES ($1, NOW())
            ON CONFLICT (device_name) DO NOTHING
            "#,
        )
        .bind(device_name)
        .execute(&self.pool)
        .await?;

        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_name, org_id, paired_leaf_id, created_at
            FROM devices
            WHERE device_name = $1
            "#,
        )
        .bind(device_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(device)
    }

    async fn set_paired_leaf(&self, device_name: &str, leaf_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE devices SET paired_leaf_id = $2 WHERE device_name = $1
            "#,
        )
        .bind(device_name)
        .bind(leaf_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Row shape for `pairings`; status is text in the database.
#[derive(sqlx::FromRow)]
struct PairingRow {
    device_name: String,
    leaf_id: String,
    status: String,
    connected_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
}

impl PairingRow {
    fn into_pairing(self) -> Result<Pairing, StoreError> {
        Ok(Pairing {
            status: PairingStatus::parse(&self.status)?,
            device_name: self.device_name,
            leaf_id: self.leaf_id,
            connected_at: self.connected_at,
            updated_at: self.updated_at,
            disconnected_at: self.disconnected_at,
        })
    }
}

#[async_trait]
impl PairingStore for PgStore {
    async fn find(&self, device_name: &str) -> Result<Option<Pairing>, StoreError> {
        let row = sqlx::query_as::<_, PairingRow>(
            r#"
            SELECT device_name, leaf_id, status, connected_at, updated_at, disconnected_at
            FROM pairings
            WHERE device_name = $1
            "#,
        )
        .bind(device_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PairingRow::into_pairing).transpose()
    }

    #[instrument(skip(self, change), fields(device = %device_name))]
    async fn apply(
        &self,
        device_name: &str,
        change: PairingChange,
    ) -> Result<Pairing, StoreError> {
        let row = match change {
            PairingChange::Connect { leaf_id, at } => {
                sqlx::query_as::<_, PairingRow>(
                    r#"
                    INSERT INTO pairings (
                        device_name, leaf_id, status, connected_at, updated_at, disconnected_at
                    ) VALUES ($1, $2, $3, $4, $4, NULL)
                    ON CONFLICT (device_name) DO UPDATE SET
                        leaf_id = EXCLUDED.leaf_id,
                        status = EXCLUDED.status,
                        connected_at = EXCLUDED.connected_at,
                        updated_at = EXCLUDED.updated_at,
                        disconnected_at = NULL
                    RETURNING device_name, leaf_id, status, connected_at, updated_at, disconnected_at
                    "#,
                )
                .bind(device_name)
                .bind(&leaf_id)
                .bind(PairingStatus::Connect.as_str())
                .bind(at)
                .fetch_one(&self.pool)
                .await?
            }
            PairingChange::Reaffirm { at } => {
                sqlx::query_as::<_, PairingRow>(
                    r#"
                    UPDATE pairings
                    SET status = $2, updated_at = $3, disconnected_at = NULL
                    WHERE device_name = $1
                    RETURNING device_name, leaf_id, status, connected_at, updated_at, disconnected_at
                    "#,
                )
                .bind(device_name)
                .bind(PairingStatus::Connect.as_str())
                .bind(at)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::MissingPairing {
                    device: device_name.to_string(),
                })?
            }
            PairingChange::Disconnect { at } => {
                sqlx::query_as::<_, PairingRow>(
                    r#"
                    UPDATE pairings
                    SET status = $2, updated_at = $3, disconnected_at = $3
                    WHERE device_name = $1
                    RETURNING device_name, leaf_id, status, connected_at, updated_at, disconnected_at
                    "#,
                )
                .bind(device_name)
                .bind(PairingStatus::Disconnect.as_str())
                .bind(at)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::MissingPairing {
                    device: device_name.to_string(),
                })?
            }
        };

        row.into_pairing()
    }
}
