//! Device–leaf pairing coordinator.
//!
//! A bridge device represents at most one leaf at a time. The coordinator
//! arbitrates pairing requests from the administrative layer against the
//! leaf/device/pairing stores; it holds no lock of its own, so concurrent
//! requests for one device resolve at the store's atomic upsert.

use crate::store::{
    DeviceStore, LeafStore, PairingChange, PairingStatus, PairingStore, StoreError, Stores,
};
use chrono::Utc;
use futures::try_join;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Rejections and failures a pairing request can end in. The first four are
/// expected business outcomes; `Internal` is an unexpected store failure.
#[derive(Debug, Error)]
pub enum PairError {
    #[error("leaf {leaf_id} is registered under a different name")]
    NameMismatch { leaf_id: String },

    #[error("device {device} is already connected to leaf {current_leaf}")]
    AlreadyConnected { device: String, current_leaf: String },

    #[error("leaf org {leaf_org} and device org {device_org} differ")]
    OrgConflict { leaf_org: String, device_org: String },

    #[error("device {device} has no pairing to disconnect")]
    NotPaired { device: String },

    #[error("pairing store operation failed: {0}")]
    Internal(#[from] StoreError),
}

/// Whether an entity referenced by a pairing request already existed or was
/// provisioned on the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provision {
    Found,
    Created,
}

/// Successful result of [`PairingCoordinator::pair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// The device was already paired with this leaf; the row was refreshed
    /// in place.
    Reaffirmed,
    /// A pairing was established, with provisioning tags for both sides.
    Paired { leaf: Provision, device: Provision },
}

/// Coordinates pairing state transitions. Cheap to clone per handle; all
/// state lives in the stores.
pub struct PairingCoordinator {
    leaves: Arc<dyn LeafStore>,
    devices: Arc<dyn DeviceStore>,
    pairings: Arc<dyn PairingStore>,
}

impl PairingCoordinator {
    pub fn new(stores: &Stores) -> Self {
        Self {
            leaves: stores.leaves.clone(),
            devices: stores.devices.clone(),
            pairings: stores.pairings.clone(),
        }
    }

    /// Pair `device_name` with the leaf identified by `leaf_id`/`leaf_name`.
    ///
    /// Reaffirming the current leaf is idempotent. A device actively
    /// connected to a different leaf is rejected unless `enforce` is set.
    /// Unknown leaves and devices are provisioned on the way through and
    /// reported as such in the outcome.
    #[instrument(skip(self), fields(leaf = %leaf_id, device = %device_name))]
    pub async fn pair(
        &self,
        leaf_id: &str,
        leaf_name: &str,
        device_name: &str,
        enforce: bool,
    ) -> Result<PairOutcome, PairError> {
        let (leaf, device, pairing) = try_join!(
            self.leaves.find(leaf_id),
            self.devices.find(device_name),
            self.pairings.find(device_name),
        )
        .map_err(|e| internal("fetch", leaf_id, device_name, e))?;

        // Identity guard: a known leaf id must arrive with its registered
        // name.
        if let Some(existing) = &leaf {
            if existing.name != leaf_name {
                info!(
                    stored = %existing.name,
                    requested = %leaf_name,
                    "Rejected pairing: leaf name mismatch"
                );
                metrics::counter!("gateway.pairing.rejected", "reason" => "name_mismatch")
                    .increment(1);
                return Err(PairError::NameMismatch {
                    leaf_id: leaf_id.to_string(),
                });
            }
        }

        if let Some(existing) = &pairing {
            // Same leaf again: refresh the row without moving connected_at.
            if existing.leaf_id == leaf_id {
                self.pairings
                    .apply(device_name, PairingChange::Reaffirm { at: Utc::now() })
                    .await
                    .map_err(|e| internal("reaffirm", leaf_id, device_name, e))?;
                info!("Pairing reaffirmed");
                metrics::counter!("gateway.pairing.reaffirmed").increment(1);
                return Ok(PairOutcome::Reaffirmed);
            }

            if existing.status == PairingStatus::Connect && !enforce {
                info!(
                    current_leaf = %existing.leaf_id,
                    "Rejected pairing: device already connected"
                );
                metrics::counter!("gateway.pairing.rejected", "reason" => "already_connected")
                    .increment(1);
                return Err(PairError::AlreadyConnected {
                    device: device_name.to_string(),
                    current_leaf: existing.leaf_id.clone(),
                });
            }
        }

        // Unknown leaves and devices are provisioned on first pairing.
        let (leaf, leaf_provision) = match leaf {
            Some(leaf) => (leaf, Provision::Found),
            None => {
                let created = self
                    .leaves
                    .create(leaf_id, leaf_name)
                    .await
                    .map_err(|e| internal("create leaf", leaf_id, device_name, e))?;
                (created, Provision::Created)
            }
        };
        let (device, device_provision) = match device {
            Some(device) => (device, Provision::Found),
            None => {
                let created = self
                    .devices
                    .create(device_name)
                    .await
                    .map_err(|e| internal("create device", leaf_id, device_name, e))?;
                (created, Provision::Created)
            }
        };

        // Organizations only conflict when both sides carry one.
        if let (Some(leaf_org), Some(device_org)) = (&leaf.org_id, &device.org_id) {
            if leaf_org != device_org {
                info!(
                    leaf_org = %leaf_org,
                    device_org = %device_org,
                    "Rejected pairing: organization conflict"
                );
                metrics::counter!("gateway.pairing.rejected", "reason" => "org_conflict")
                    .increment(1);
                return Err(PairError::OrgConflict {
                    leaf_org: leaf_org.clone(),
                    device_org: device_org.clone(),
                });
            }
        }

        self.pairings
            .apply(
                device_name,
                PairingChange::Connect {
                    leaf_id: leaf_id.to_string(),
                    at: Utc::now(),
                },
            )
            .await
            .map_err(|e| internal("connect", leaf_id, device_name, e))?;
        self.devices
            .set_paired_leaf(device_name, leaf_id)
            .await
            .map_err(|e| internal("set paired leaf", leaf_id, device_name, e))?;

        info!(
            leaf_provision = ?leaf_provision,
            device_provision = ?device_provision,
            "Pairing established"
        );
        metrics::counter!("gateway.pairing.connected").increment(1);

        Ok(PairOutcome::Paired {
            leaf: leaf_provision,
            device: device_provision,
        })
    }

    /// Tear down a device's pairing: status DISCONNECT with the time
    /// recorded. Not terminal; a later `pair` returns the device to
    /// CONNECT and clears the disconnection time.
    #[instrument(skip(self), fields(device = %device_name))]
    pub async fn unpair(&self, device_name: &str) -> Result<(), PairError> {
        match self
            .pairings
            .apply(device_name, PairingChange::Disconnect { at: Utc::now() })
            .await
        {
            Ok(_) => {
                info!("Pairing disconnected");
                metrics::counter!("gateway.pairing.disconnected").increment(1);
                Ok(())
            }
            Err(StoreError::MissingPairing { device }) => {
                info!("No pairing to disconnect");
                Err(PairError::NotPaired { device })
            }
            Err(e) => Err(internal("disconnect", "-", device_name, e)),
        }
    }
}

fn internal(stage: &'static str, leaf_id: &str, device_name: &str, e: StoreError) -> PairError {
    error!(
        stage,
        leaf = %leaf_id,
        device = %device_name,
        error = %e,
        "Pairing store operation failed"
    );
    metrics::counter!("gateway.pairing.internal_errors").increment(1);
    PairError::Internal(e)
}
