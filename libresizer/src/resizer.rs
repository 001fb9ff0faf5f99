//! Volume expansion backends.
//!
//! A [`Resizer`] is chosen once at startup from the driver's advertised
//! capabilities (see [`new_resizer`]):
//!
//! | Driver supports | Resizer |
//! |---|---|
//! | controller service + controller expand | [`CsiResizer`] |
//! | node expand only | [`TrivialResizer`] |
//! | neither | error |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::driver::{DriverClient, ExpandResponse};
use crate::error::{DriverError, Error};
use crate::store::ResourceStore;
use crate::types::Volume;

/// Expands volumes of one driver.
#[async_trait]
pub trait Resizer: Send + Sync {
    /// Driver name this resizer acts for.
    fn name(&self) -> &str;

    /// Whether control-plane expansion is performed by this resizer.
    fn supports_control_plane_expansion(&self) -> bool;

    /// Whether `volume` belongs to this resizer's driver.
    fn can_support(&self, volume: &Volume) -> bool {
        volume.driver() == Some(self.name())
    }

    /// Expand `volume` to `requested_bytes`.
    async fn resize(&self, volume: &Volume, requested_bytes: u64) -> Result<ExpandResponse, Error>;
}

/// Resolve the secrets referenced by a CSI volume, empty if it has none.
///
/// A missing secret makes the volume invalid rather than gone, so the
/// caller retries with backoff instead of dropping the key.
pub(crate) async fn volume_secrets(
    store: &dyn ResourceStore,
    volume: &Volume,
) -> Result<HashMap<String, String>, Error> {
    let Some(secret) = volume.spec.csi.as_ref().and_then(|csi| csi.secret_ref.as_ref()) else {
        return Ok(HashMap::new());
    };
    store
        .get_secret(&secret.namespace, &secret.name)
        .await
        .map_err(|e| match e {
            Error::NotFound { .. } => Error::invalid(
                volume.name(),
                format!("secret {}/{} not found", secret.namespace, secret.name),
            ),
            e => e,
        })
}

/// Run a driver call under `timeout`.  Expiry is reported as a
/// `DeadlineExceeded` driver error, which is not final.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(DriverError::timeout(timeout)))
}

/// Expands volumes through the driver's controller service.
pub struct CsiResizer {
    name: String,
    driver: Arc<dyn DriverClient>,
    store: Arc<dyn ResourceStore>,
    timeout: Duration,
}

impl CsiResizer {
    /// Secrets are read from `store`; every call is bounded by `timeout`.
    pub fn new(
        name: String,
        driver: Arc<dyn DriverClient>,
        store: Arc<dyn ResourceStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            driver,
            store,
            timeout,
        }
    }
}

#[async_trait]
impl Resizer for CsiResizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_control_plane_expansion(&self) -> bool {
        true
    }

    #[instrument(skip(self, volume), fields(volume = %volume.name()))]
    async fn resize(&self, volume: &Volume, requested_bytes: u64) -> Result<ExpandResponse, Error> {
        let Some(csi) = volume.spec.csi.as_ref() else {
            return Err(Error::invalid(volume.name(), "not a CSI volume"));
        };
        let secrets = volume_secrets(self.store.as_ref(), volume).await?;
        let capability = volume.capability();

        debug!(handle = %csi.volume_handle, requested_bytes, "calling driver expand");
        let response = with_timeout(
            self.timeout,
            self.driver
                .expand(&csi.volume_handle, requested_bytes, &secrets, &capability),
        )
        .await?;
        Ok(response)
    }
}

/// For drivers that only expand on the node: reports the requested size
/// with node expansion required, without any RPC.
pub struct TrivialResizer {
    name: String,
}

impl TrivialResizer {
    /// Resizer acting for the driver called `name`.
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait]
impl Resizer for TrivialResizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_control_plane_expansion(&self) -> bool {
        false
    }

    async fn resize(
        &self,
        _volume: &Volume,
        requested_bytes: u64,
    ) -> Result<ExpandResponse, Error> {
        Ok(ExpandResponse {
            capacity_bytes: requested_bytes,
            node_expansion_required: true,
        })
    }
}

/// Probe the driver and pick the matching [`Resizer`].
///
/// Returns the resizer together with the driver name.
pub async fn new_resizer(
    driver: Arc<dyn DriverClient>,
    store: Arc<dyn ResourceStore>,
    timeout: Duration,
) -> Result<(Arc<dyn Resizer>, String), Error> {
    let name = with_timeout(timeout, driver.get_driver_name()).await?;
    let controller_service = with_timeout(timeout, driver.supports_controller_service()).await?;
    let controller_expand =
        controller_service && with_timeout(timeout, driver.supports_controller_expand()).await?;

    if controller_expand {
        info!(driver = %name, "using controller expansion");
        let resizer = CsiResizer::new(name.clone(), driver, store, timeout);
        return Ok((Arc::new(resizer), name));
    }

    if with_timeout(timeout, driver.supports_node_expand()).await? {
        info!(driver = %name, "driver expands on the node only, using trivial resizer");
        return Ok((Arc::new(TrivialResizer::new(name.clone())), name));
    }

    Err(Error::Unsupported(format!(
        "driver {name} supports neither controller nor node expansion"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CsiVolumeSource, ObjectMeta, VolumeSpec};

    fn volume(driver: &str) -> Volume {
        Volume {
            meta: ObjectMeta::cluster("pv-1"),
            spec: VolumeSpec {
                capacity_bytes: 1,
                csi: Some(CsiVolumeSource {
                    driver: driver.into(),
                    volume_handle: "h".into(),
                    fs_type: String::new(),
                    secret_ref: None,
                }),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn trivial_resizer_defers_to_node() {
        let resizer = TrivialResizer::new("node.csi".into());
        let resp = resizer.resize(&volume("node.csi"), 42).await.unwrap();
        assert_eq!(resp.capacity_bytes, 42);
        assert!(resp.node_expansion_required);
        assert!(!resizer.supports_control_plane_expansion());
    }

    #[test]
    fn can_support_matches_driver_name() {
        let resizer = TrivialResizer::new("node.csi".into());
        assert!(resizer.can_support(&volume("node.csi")));
        assert!(!resizer.can_support(&volume("other.csi")));
        assert!(!resizer.can_support(&Volume::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_not_final() {
        let err = with_timeout(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), DriverError>(())
        })
        .await
        .unwrap_err();
        assert!(!err.is_final());
    }
}
