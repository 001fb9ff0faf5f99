//! Volume expansion controller.
//!
//! With `recover_from_failure` enabled the claim's resize status drives the
//! state machine, so an expansion interrupted at any step resumes with the
//! size it committed to:
//!
//! | Outcome of the driver call | Status written |
//! |---|---|
//! | (before the call) | `ControllerResizeInProgress`, allocated = target |
//! | success, node work remains | `NodeResizePending` |
//! | success, nothing left | none, capacity = new size |
//! | final error | `ControllerResizeFailed` |
//! | retriable error | unchanged (`ControllerResizeInProgress`) |
//!
//! Without it, progress is tracked through claim conditions only.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{Reconcile, run_controller};
use crate::conditions::{remove_conditions, replace_conditions};
use crate::config::ControllerConfig;
use crate::driver::DriverClient;
use crate::error::{DriverError, Error};
use crate::events::{EventRecorder, EventType, reason};
use crate::inuse::InUseTracker;
use crate::resizer::{Resizer, new_resizer};
use crate::store::{Precondition, ResourceStore, StoreEvent};
use crate::types::{
    ClaimCondition, ClaimConditionType, ResizeStatus, Volume, VolumeClaim, split_key,
};
use crate::workqueue::WorkQueue;

/// Outcome of comparing a claim's request with its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionPlan {
    /// Nothing for the controller to do.
    Satisfied,
    /// Call the driver with this target size.
    Expand(u64),
}

/// Pick the expansion target for `claim` bound to `volume`.
///
/// A recorded allocated size is reused whenever an operation is already in
/// flight, so a request edited mid-operation never moves the target.
pub fn plan_expansion(
    claim: &VolumeClaim,
    volume: &Volume,
    supports_control_plane: bool,
) -> ExpansionPlan {
    use ResizeStatus::*;

    let requested = claim.spec.requested_bytes;
    let capacity = volume.spec.capacity_bytes;
    let allocated = claim.status.allocated_bytes.unwrap_or(requested);

    if capacity < requested {
        match claim.status.resize_status {
            Some(ControllerResizeInProgress | NodeResizeFailed) => ExpansionPlan::Expand(allocated),
            Some(NodeResizePending | NodeResizeInProgress) => {
                if capacity >= allocated {
                    ExpansionPlan::Satisfied
                } else {
                    ExpansionPlan::Expand(allocated)
                }
            }
            None | Some(ControllerResizeFailed | ControllerResizeInfeasible) => {
                ExpansionPlan::Expand(requested)
            }
        }
    } else {
        match claim.status.resize_status {
            None | Some(NodeResizePending | NodeResizeInProgress) => ExpansionPlan::Satisfied,
            Some(NodeResizeFailed) if !supports_control_plane => ExpansionPlan::Expand(requested),
            Some(
                NodeResizeFailed
                | ControllerResizeInProgress
                | ControllerResizeFailed
                | ControllerResizeInfeasible,
            ) => ExpansionPlan::Expand(allocated),
        }
    }
}

const NODE_PENDING_MESSAGE: &str =
    "Waiting for user to (re-)start a pod to finish file system resize of volume on node.";

/// Grows volumes to the size their claims request.
pub struct ResizeController {
    resizer: Arc<dyn Resizer>,
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventRecorder>,
    in_use: InUseTracker,
    config: ControllerConfig,
}

/// Probe `driver`, select a resizer, and build the controller.
///
/// Returns the controller together with the resolved driver name.
pub async fn new_resize_controller(
    driver: Arc<dyn DriverClient>,
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventRecorder>,
    config: ControllerConfig,
) -> Result<(Arc<ResizeController>, String), Error> {
    config.validate()?;
    let (resizer, name) = new_resizer(driver, Arc::clone(&store), config.driver_timeout).await?;
    let controller = ResizeController::new(resizer, store, events, config);
    Ok((Arc::new(controller), name))
}

impl ResizeController {
    /// Build a controller around an already selected resizer.
    pub fn new(
        resizer: Arc<dyn Resizer>,
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            resizer,
            store,
            events,
            in_use: InUseTracker::new(),
            config,
        }
    }

    /// Mount tracking fed by pod change notifications.
    pub fn in_use(&self) -> &InUseTracker {
        &self.in_use
    }

    /// Run the reconciler loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) {
        let queue = WorkQueue::new(
            self.config.retry_interval_start,
            self.config.retry_interval_max,
        );
        let store = Arc::clone(&self.store);
        let resync = self.config.resync_period;
        run_controller(self, store, queue, workers, resync, shutdown).await;
    }

    /// Drive one claim towards its requested size.
    ///
    /// Returns the claim and volume as last written.
    pub async fn expand(
        &self,
        claim: VolumeClaim,
        volume: Volume,
    ) -> Result<(VolumeClaim, Volume), Error> {
        if self.config.recover_from_failure {
            self.expand_and_recover(claim, volume).await
        } else {
            self.expand_legacy(claim, volume).await
        }
    }

    #[instrument(skip_all, fields(claim = %claim.key(), volume = %volume.name()))]
    async fn expand_and_recover(
        &self,
        claim: VolumeClaim,
        volume: Volume,
    ) -> Result<(VolumeClaim, Volume), Error> {
        let target = match plan_expansion(
            &claim,
            &volume,
            self.resizer.supports_control_plane_expansion(),
        ) {
            ExpansionPlan::Satisfied => {
                debug!(status = ?claim.status.resize_status, "no expansion needed");
                return Ok((claim, volume));
            }
            ExpansionPlan::Expand(target) => target,
        };

        let claim = self.mark_controller_resize_in_progress(claim, target).await?;
        self.guard_in_use(&claim)?;

        match self.call_resizer(&claim, &volume, target).await {
            Ok((new_size, node_expansion_required)) => {
                self.finish_expansion(claim, volume, new_size, node_expansion_required)
                    .await
            }
            Err(err) => Err(self.handle_expansion_failure(claim, &volume, err).await),
        }
    }

    /// Condition-driven expansion used when resize statuses are disabled.
    #[instrument(skip_all, fields(claim = %claim.key(), volume = %volume.name()))]
    async fn expand_legacy(
        &self,
        claim: VolumeClaim,
        volume: Volume,
    ) -> Result<(VolumeClaim, Volume), Error> {
        let requested = claim.spec.requested_bytes;
        if requested <= claim.capacity() {
            debug!("claim already at requested size");
            return Ok((claim, volume));
        }

        if volume.spec.capacity_bytes >= requested {
            if claim.has_condition(&ClaimConditionType::FileSystemResizePending) {
                debug!("waiting for node expansion");
                return Ok((claim, volume));
            }
            let size = volume.spec.capacity_bytes;
            let claim = self.mark_resize_finished(claim, size).await?;
            return Ok((claim, volume));
        }

        let claim = self.mark_resizing(claim).await?;
        self.guard_in_use(&claim)?;

        match self.call_resizer(&claim, &volume, requested).await {
            Ok((new_size, node_expansion_required)) => {
                self.finish_expansion(claim, volume, new_size, node_expansion_required)
                    .await
            }
            Err(err) => {
                self.record_in_use_rejection(&claim, &err);
                self.events.event(
                    &claim.key(),
                    EventType::Warning,
                    reason::RESIZE_FAILED,
                    &err.to_string(),
                );
                Err(err)
            }
        }
    }

    /// Fail fast when the driver already refused this claim while mounted and
    /// it is still mounted.
    fn guard_in_use(&self, claim: &VolumeClaim) -> Result<(), Error> {
        if !self.config.handle_volume_in_use_error {
            return Ok(());
        }
        let key = claim.key();
        if self.in_use.has_in_use_error(&key) && self.in_use.check_for_use(&key) {
            let err = Error::VolumeInUse { claim: key.clone() };
            self.events
                .event(&key, EventType::Warning, reason::RESIZE_FAILED, &err.to_string());
            return Err(err);
        }
        Ok(())
    }

    async fn call_resizer(
        &self,
        claim: &VolumeClaim,
        volume: &Volume,
        target: u64,
    ) -> Result<(u64, bool), Error> {
        let key = claim.key();
        if self.config.handle_volume_in_use_error {
            self.in_use.remove_in_use_error(&key);
        }
        self.events.event(
            &key,
            EventType::Normal,
            reason::RESIZING,
            &format!("External resizer is resizing volume {}", volume.name()),
        );
        let response = self.resizer.resize(volume, target).await?;
        Ok((response.capacity_bytes, response.node_expansion_required))
    }

    fn record_in_use_rejection(&self, claim: &VolumeClaim, err: &Error) {
        if self.config.handle_volume_in_use_error
            && err.driver_error().is_some_and(DriverError::is_in_use)
        {
            self.in_use.mark_in_use_error(&claim.key());
        }
    }

    async fn handle_expansion_failure(
        &self,
        claim: VolumeClaim,
        volume: &Volume,
        err: Error,
    ) -> Error {
        let key = claim.key();
        self.record_in_use_rejection(&claim, &err);
        self.events.event(
            &key,
            EventType::Warning,
            reason::RESIZE_FAILED,
            &format!("resize volume {} failed: {err}", volume.name()),
        );

        if !err.driver_error().is_some_and(DriverError::is_final) {
            warn!(error = %err, "expansion may still be in progress, will retry");
            return err;
        }

        match self.mark_controller_expansion_failed(claim, &err).await {
            Ok(_) => err,
            Err(status_error) => {
                error!(error = %err, %status_error, "failed to record expansion failure");
                Error::StatusUpdate {
                    source: Box::new(err),
                    status_error: Box::new(status_error),
                }
            }
        }
    }

    async fn finish_expansion(
        &self,
        claim: VolumeClaim,
        volume: Volume,
        new_size: u64,
        node_expansion_required: bool,
    ) -> Result<(VolumeClaim, Volume), Error> {
        let volume = self.update_volume_capacity(volume, new_size).await?;
        let key = claim.key();

        if node_expansion_required {
            let claim = self.mark_node_expansion_pending(claim).await?;
            info!(%key, new_size, "controller expansion done, node expansion pending");
            self.events.event(
                &key,
                EventType::Normal,
                reason::NODE_EXPANSION_REQUIRED,
                "Require file system resize of volume on node",
            );
            return Ok((claim, volume));
        }

        let claim = self.mark_resize_finished(claim, new_size).await?;
        info!(%key, new_size, "expansion finished");
        self.events.event(
            &key,
            EventType::Normal,
            reason::RESIZE_SUCCESSFUL,
            "Resize volume succeeded",
        );
        Ok((claim, volume))
    }

    /// Grow the volume's recorded capacity; never shrinks it.
    async fn update_volume_capacity(&self, mut volume: Volume, size: u64) -> Result<Volume, Error> {
        if volume.spec.capacity_bytes >= size {
            return Ok(volume);
        }
        volume.spec.capacity_bytes = size;
        self.store.patch_volume(&volume).await
    }

    async fn mark_controller_resize_in_progress(
        &self,
        mut claim: VolumeClaim,
        target: u64,
    ) -> Result<VolumeClaim, Error> {
        claim.status.resize_status = Some(ResizeStatus::ControllerResizeInProgress);
        claim.status.allocated_bytes = Some(target);
        claim.status.conditions = replace_conditions(
            &claim.status.conditions,
            &[
                ClaimConditionType::FileSystemResizePending,
                ClaimConditionType::ControllerResizeError,
            ],
            [resizing_condition()],
        );
        self.store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await
    }

    async fn mark_resizing(&self, mut claim: VolumeClaim) -> Result<VolumeClaim, Error> {
        claim.status.conditions = replace_conditions(
            &claim.status.conditions,
            &[ClaimConditionType::FileSystemResizePending],
            [resizing_condition()],
        );
        self.store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await
    }

    /// Terminal failure record; written without a version check so it
    /// survives a lost race.
    async fn mark_controller_expansion_failed(
        &self,
        mut claim: VolumeClaim,
        err: &Error,
    ) -> Result<VolumeClaim, Error> {
        claim.status.resize_status = Some(ResizeStatus::ControllerResizeFailed);
        claim.status.conditions = replace_conditions(
            &claim.status.conditions,
            &[ClaimConditionType::Resizing],
            [ClaimCondition::new(
                ClaimConditionType::ControllerResizeError,
                "ControllerResizeFailed",
                err.to_string(),
            )],
        );
        self.store
            .patch_claim_status(&claim, Precondition::Unconditional)
            .await
    }

    async fn mark_node_expansion_pending(
        &self,
        mut claim: VolumeClaim,
    ) -> Result<VolumeClaim, Error> {
        if self.config.recover_from_failure {
            claim.status.resize_status = Some(ResizeStatus::NodeResizePending);
        }
        claim.status.conditions = replace_conditions(
            &claim.status.conditions,
            &[ClaimConditionType::Resizing],
            [ClaimCondition::new(
                ClaimConditionType::FileSystemResizePending,
                "",
                NODE_PENDING_MESSAGE,
            )],
        );
        self.store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await
    }

    async fn mark_resize_finished(
        &self,
        mut claim: VolumeClaim,
        size: u64,
    ) -> Result<VolumeClaim, Error> {
        claim.status.capacity_bytes = Some(size);
        claim.status.resize_status = None;
        claim.status.conditions =
            remove_conditions(&claim.status.conditions, &ClaimConditionType::RESIZE);
        self.store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await
    }

    /// Whether a claim seen by a watch or resync needs a reconcile.
    fn needs_attention(claim: &VolumeClaim) -> bool {
        claim.is_bound()
            && (claim.spec.requested_bytes > claim.capacity()
                || claim.status.resize_status.is_some())
    }
}

fn resizing_condition() -> ClaimCondition {
    ClaimCondition::new(
        ClaimConditionType::Resizing,
        "",
        "External resizer is resizing volume",
    )
}

#[async_trait]
impl Reconcile for ResizeController {
    fn name(&self) -> &'static str {
        "resize"
    }

    async fn reconcile(&self, key: &str) -> Result<(), Error> {
        let (namespace, name) = split_key(key);
        let claim = match self.store.get_claim(namespace, name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                debug!(%key, "claim deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !claim.is_bound() {
            debug!(%key, "claim not bound, skipping");
            return Ok(());
        }
        let Some(volume_name) = claim.spec.volume_name.as_deref() else {
            return Ok(());
        };
        let volume = match self.store.get_volume(volume_name).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => {
                debug!(%key, volume = volume_name, "bound volume not found");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !self.resizer.can_support(&volume) {
            debug!(%key, driver = ?volume.driver(), "volume belongs to another driver");
            return Ok(());
        }
        if let Some(bound_to) = volume.spec.claim_ref.as_deref()
            && bound_to != key
        {
            warn!(%key, volume = volume_name, %bound_to, "volume is bound to a different claim");
            return Ok(());
        }

        self.expand(claim, volume).await.map(|_| ())
    }

    fn key_for(&self, event: &StoreEvent) -> Option<String> {
        match event {
            StoreEvent::PodAdded(pod) => {
                self.in_use.add_pod(pod);
                None
            }
            StoreEvent::PodUpdated { old, new } => {
                self.in_use.update_pod(old, new);
                None
            }
            StoreEvent::PodDeleted(pod) => {
                self.in_use.remove_pod(pod);
                None
            }
            StoreEvent::ClaimAdded(claim) => Self::needs_attention(claim).then(|| claim.key()),
            StoreEvent::ClaimUpdated { old, new } => {
                if old.meta.resource_version == new.meta.resource_version {
                    return Self::needs_attention(new).then(|| new.key());
                }
                let grown = new.spec.requested_bytes > old.spec.requested_bytes;
                let newly_bound = new.is_bound() && !old.is_bound();
                let node_failed = new.status.resize_status == Some(ResizeStatus::NodeResizeFailed)
                    && old.status.resize_status != new.status.resize_status;
                (new.is_bound() && (grown || newly_bound || node_failed)).then(|| new.key())
            }
            StoreEvent::ClaimDeleted(claim) => {
                self.in_use.remove_in_use_error(&claim.key());
                None
            }
        }
    }
}
