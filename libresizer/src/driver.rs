//! Storage driver client seam.
//!
//! The driver is reached over RPC by an external binding; this crate only
//! relies on the call contract below.  All calls are expected to be
//! idempotent.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::types::VolumeCapability;

/// Result of a controller-side expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandResponse {
    /// Size the volume now has, in bytes.
    pub capacity_bytes: u64,
    /// Whether node-side work (e.g. filesystem growth) remains.
    pub node_expansion_required: bool,
}

/// Controller-side client of a CSI driver.
#[async_trait]
pub trait DriverClient: Send + Sync {
    /// Name the driver reports about itself.
    async fn get_driver_name(&self) -> Result<String, DriverError>;

    async fn supports_controller_service(&self) -> Result<bool, DriverError>;

    async fn supports_controller_expand(&self) -> Result<bool, DriverError>;

    async fn supports_node_expand(&self) -> Result<bool, DriverError>;

    async fn supports_controller_modify(&self) -> Result<bool, DriverError>;

    /// Grow `volume_id` to at least `requested_bytes`.
    async fn expand(
        &self,
        volume_id: &str,
        requested_bytes: u64,
        secrets: &HashMap<String, String>,
        capability: &VolumeCapability,
    ) -> Result<ExpandResponse, DriverError>;

    /// Apply `parameters` to `volume_id`.
    async fn modify(
        &self,
        volume_id: &str,
        secrets: &HashMap<String, String>,
        parameters: &HashMap<String, String>,
    ) -> Result<(), DriverError>;
}
