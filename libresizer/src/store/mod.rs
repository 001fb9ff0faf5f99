//! Resource store seam.
//!
//! [`ResourceStore`] is the cached, watched view of cluster objects the
//! controllers read from and write status back to.  Status writes can be
//! version-checked ([`Precondition::MatchVersion`]); a failed check surfaces
//! as [`Error::Conflict`](crate::error::Error::Conflict).
//!
//! [`memory::MemoryStore`] is a complete in-process implementation.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::types::{Pod, Volume, VolumeAttributesClass, VolumeClaim};

/// Change notification for a watched object.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ClaimAdded(VolumeClaim),
    ClaimUpdated { old: VolumeClaim, new: VolumeClaim },
    ClaimDeleted(VolumeClaim),
    PodAdded(Pod),
    PodUpdated { old: Pod, new: Pod },
    PodDeleted(Pod),
}

/// Concurrency guard for a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Fail with a conflict unless the stored version equals the caller's.
    MatchVersion,
    /// Write regardless of concurrent changes.  Reserved for terminal
    /// failure records that must not be lost to a race.
    Unconditional,
}

/// Read and write access to the objects the controllers reconcile.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Claim by namespace and name.
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<VolumeClaim, Error>;

    /// Every claim.
    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, Error>;

    /// Cluster-scoped volume by name.
    async fn get_volume(&self, name: &str) -> Result<Volume, Error>;

    /// Attributes class by name.
    async fn get_attributes_class(&self, name: &str) -> Result<VolumeAttributesClass, Error>;

    /// Every pod.
    async fn list_pods(&self) -> Result<Vec<Pod>, Error>;

    /// Secret data by reference.
    async fn get_secret(&self, namespace: &str, name: &str)
    -> Result<HashMap<String, String>, Error>;

    /// Persist `claim.status` and return the updated object.
    async fn patch_claim_status(
        &self,
        claim: &VolumeClaim,
        precondition: Precondition,
    ) -> Result<VolumeClaim, Error>;

    /// Persist `volume.spec` (capacity, applied attribute class).
    async fn patch_volume(&self, volume: &Volume) -> Result<Volume, Error>;

    /// Follow claim and pod changes from now on.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
