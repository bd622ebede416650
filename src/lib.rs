//! ThermoBand Gateway - telemetry ingestion and pairing for wearable
//! temperature sensors.
//!
//! Bridge devices relay readings from worn sensor units ("leaves") over a
//! raw TCP socket, one binary frame per write. This library provides:
//!
//! - The frame codec turning received bytes into readings
//! - The ingestion server persisting readings idempotently and acking
//!   each frame with a single status byte
//! - The pairing coordinator managing which leaf a bridge device speaks for
//!
//! # Example
//!
//! ```rust,no_run
//! use thermoband_gateway::{GatewayConfig, IngestServer, Stores};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::load()?;
//!     let stores = Stores::memory();
//!     let shutdown = CancellationToken::new();
//!
//!     let server =
//!         IngestServer::bind(&config.server, stores.readings.clone(), shutdown.clone()).await?;
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod frame;
pub mod ingest_server;
pub mod mem_store;
pub mod pairing;
pub mod pg_store;
pub mod store;

// Re-export main types
pub use config::{ConfigValidationError, DatabaseBackend, GatewayConfig};
pub use frame::{decode, FrameError, TelemetryReading};
pub use ingest_server::{IngestServer, ACK_FAILURE, ACK_SUCCESS};
pub use pairing::{PairError, PairOutcome, PairingCoordinator, Provision};
pub use store::{
    Device, DeviceStore, Leaf, LeafStore, Pairing, PairingChange, PairingStatus, PairingStore,
    Reading, ReadingKey, ReadingStore, SourceKey, StoreError, Stores,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::frame::{decode, FrameError, TelemetryReading};
    pub use crate::ingest_server::IngestServer;
    pub use crate::pairing::{PairError, PairOutcome, PairingCoordinator};
    pub use crate::store::{ReadingKey, SourceKey, StoreError, Stores};
}
