//! Attribute-class modification backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::driver::DriverClient;
use crate::error::Error;
use crate::resizer::{volume_secrets, with_timeout};
use crate::store::ResourceStore;
use crate::types::{Volume, VolumeAttributesClass, VolumeClaim};

/// Parameter keys added when identity metadata is enabled.
pub const PARAM_CLAIM_NAME: &str = "csi.storage.k8s.io/pvc/name";
pub const PARAM_CLAIM_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
pub const PARAM_VOLUME_NAME: &str = "csi.storage.k8s.io/pv/name";

/// Applies attribute classes to volumes of one driver.
#[async_trait]
pub trait Modifier: Send + Sync {
    /// Driver name this modifier acts for.
    fn name(&self) -> &str;

    fn can_support(&self, volume: &Volume) -> bool {
        volume.driver() == Some(self.name())
    }

    /// Apply `class` to the volume bound to `claim`.
    async fn modify(
        &self,
        claim: &VolumeClaim,
        volume: &Volume,
        class: &VolumeAttributesClass,
    ) -> Result<(), Error>;
}

/// Modifies volumes through the driver's controller service.
pub struct CsiModifier {
    name: String,
    driver: Arc<dyn DriverClient>,
    store: Arc<dyn ResourceStore>,
    timeout: Duration,
    extra_metadata: bool,
}

impl CsiModifier {
    /// Secrets are read from `store`; every call is bounded by `timeout`.
    pub fn new(
        name: String,
        driver: Arc<dyn DriverClient>,
        store: Arc<dyn ResourceStore>,
        timeout: Duration,
        extra_metadata: bool,
    ) -> Self {
        Self {
            name,
            driver,
            store,
            timeout,
            extra_metadata,
        }
    }

    /// Class parameters, plus claim/volume identity when enabled.
    fn parameters(
        &self,
        claim: &VolumeClaim,
        volume: &Volume,
        class: &VolumeAttributesClass,
    ) -> HashMap<String, String> {
        let mut params = class.parameters.clone();
        if self.extra_metadata {
            params.insert(PARAM_CLAIM_NAME.to_owned(), claim.meta.name.clone());
            params.insert(
                PARAM_CLAIM_NAMESPACE.to_owned(),
                claim.meta.namespace.clone(),
            );
            params.insert(PARAM_VOLUME_NAME.to_owned(), volume.meta.name.clone());
        }
        params
    }
}

#[async_trait]
impl Modifier for CsiModifier {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(volume = %volume.name(), class = %class.meta.name))]
    async fn modify(
        &self,
        claim: &VolumeClaim,
        volume: &Volume,
        class: &VolumeAttributesClass,
    ) -> Result<(), Error> {
        let Some(csi) = volume.spec.csi.as_ref() else {
            return Err(Error::invalid(volume.name(), "not a CSI volume"));
        };
        let secrets = volume_secrets(self.store.as_ref(), volume).await?;
        let params = self.parameters(claim, volume, class);

        debug!(handle = %csi.volume_handle, params = params.len(), "calling driver modify");
        with_timeout(
            self.timeout,
            self.driver.modify(&csi.volume_handle, &secrets, &params),
        )
        .await?;
        Ok(())
    }
}

/// Probe the driver for modify support and build a [`CsiModifier`].
///
/// Returns the modifier together with the driver name.
pub async fn new_modifier(
    driver: Arc<dyn DriverClient>,
    store: Arc<dyn ResourceStore>,
    timeout: Duration,
    extra_metadata: bool,
) -> Result<(Arc<dyn Modifier>, String), Error> {
    let name = with_timeout(timeout, driver.get_driver_name()).await?;
    let supported = with_timeout(timeout, driver.supports_controller_service()).await?
        && with_timeout(timeout, driver.supports_controller_modify()).await?;
    if !supported {
        return Err(Error::Unsupported(format!(
            "driver {name} does not support controller modify"
        )));
    }
    info!(driver = %name, extra_metadata, "using controller modify");
    let modifier = CsiModifier::new(name.clone(), driver, store, timeout, extra_metadata);
    Ok((Arc::new(modifier), name))
}
