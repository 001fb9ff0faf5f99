//! Attribute-class modification controller.
//!
//! The claim's modify status records which target class an outstanding
//! modification refers to:
//!
//! | Status | Meaning | Next reconcile |
//! |---|---|---|
//! | none | nothing outstanding | start if target differs from current |
//! | `Pending` | target class does not exist yet | start once it does |
//! | `InProgress` | driver call issued, outcome unknown | call again |
//! | `Infeasible` | driver rejected the parameters | call again after the backoff window |
//!
//! Claims whose status is `InProgress` or `Infeasible` when first seen are
//! kept in an uncertain set so a restart mid-modification is picked up by
//! the periodic resync even without a user edit.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{Reconcile, run_controller};
use crate::conditions::{remove_conditions, replace_conditions};
use crate::config::ControllerConfig;
use crate::driver::DriverClient;
use crate::error::{DriverError, Error};
use crate::events::{EventRecorder, EventType, reason};
use crate::modifier::{Modifier, new_modifier};
use crate::slowset::SlowSet;
use crate::store::{Precondition, ResourceStore, StoreEvent};
use crate::types::{
    ClaimCondition, ClaimConditionType, ModifyVolumeStatus, ModifyVolumeStatusPhase, Volume,
    VolumeAttributesClass, VolumeClaim, split_key,
};
use crate::workqueue::WorkQueue;

/// Applies volume attribute classes requested by claims.
pub struct ModifyController {
    modifier: Arc<dyn Modifier>,
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventRecorder>,
    config: ControllerConfig,
    slow_set: Arc<SlowSet>,
    /// Claims whose modification may still be running on the driver.
    uncertain: DashSet<String>,
}

/// Probe `driver` for modify support and build the controller.
///
/// Returns the controller together with the resolved driver name.
pub async fn new_modify_controller(
    driver: Arc<dyn DriverClient>,
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventRecorder>,
    config: ControllerConfig,
) -> Result<(Arc<ModifyController>, String), Error> {
    config.validate()?;
    if !config.volume_attributes_class {
        return Err(Error::Unsupported(
            "volume attributes classes are disabled".into(),
        ));
    }
    let (modifier, name) = new_modifier(
        driver,
        Arc::clone(&store),
        config.driver_timeout,
        config.extra_modify_metadata,
    )
    .await?;
    let controller = ModifyController::new(modifier, store, events, config);
    Ok((Arc::new(controller), name))
}

impl ModifyController {
    /// Build a controller around an already selected modifier.
    pub fn new(
        modifier: Arc<dyn Modifier>,
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Self {
        let slow_set = Arc::new(SlowSet::new(
            config.slow_set_retention,
            config.slow_set_sweep_interval,
        ));
        Self {
            modifier,
            store,
            events,
            config,
            slow_set,
            uncertain: DashSet::new(),
        }
    }

    /// Keys whose infeasible target is backing off.
    pub fn slow_set(&self) -> &SlowSet {
        &self.slow_set
    }

    /// Whether a driver call for `key` may still be outstanding.
    pub fn is_uncertain(&self, key: &str) -> bool {
        self.uncertain.contains(key)
    }

    /// Run the reconciler loop and the backoff sweeper until `shutdown`
    /// fires.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) {
        let slow_set = Arc::clone(&self.slow_set);
        let sweeper = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { slow_set.run(shutdown).await }
        });

        let queue = WorkQueue::new(
            self.config.retry_interval_start,
            self.config.retry_interval_max,
        );
        let store = Arc::clone(&self.store);
        let resync = self.config.resync_period;
        run_controller(self, store, queue, workers, resync, shutdown).await;

        if let Err(e) = sweeper.await {
            warn!(error = %e, "slow set sweeper panicked");
        }
    }

    /// Move the volume bound to `claim` towards the claim's target class.
    ///
    /// Returns the claim and volume as last written.
    #[instrument(skip_all, fields(claim = %claim.key(), volume = %volume.name()))]
    pub async fn modify(
        &self,
        claim: VolumeClaim,
        volume: Volume,
    ) -> Result<(VolumeClaim, Volume), Error> {
        let key = claim.key();
        let target = match claim.spec.volume_attributes_class_name.clone() {
            Some(target)
                if claim.status.current_volume_attributes_class_name.as_ref() != Some(&target) =>
            {
                target
            }
            _ => return self.settle(claim, volume).await,
        };

        let previous = claim.status.modify_volume_status.clone();
        let retrying_infeasible = previous.as_ref().is_some_and(|status| {
            status.targets(&target) && status.status == ModifyVolumeStatusPhase::Infeasible
        });
        if retrying_infeasible && self.slow_set.contains(&key) {
            let after = self.slow_set.time_remaining(&key);
            debug!(%target, ?after, "infeasible target still backing off");
            return Err(Error::DelayRetry { key, after });
        }

        let class = match self.store.get_attributes_class(&target).await {
            Ok(class) => class,
            Err(e) if e.is_not_found() => {
                let claim = self.mark_pending(claim, &target).await?;
                return Ok((claim, volume));
            }
            Err(e) => return Err(e),
        };
        if class.driver_name != self.modifier.name() {
            let err = Error::invalid(
                class.meta.key(),
                format!(
                    "class belongs to driver {}, not {}",
                    class.driver_name,
                    self.modifier.name()
                ),
            );
            self.events
                .event(&key, EventType::Warning, reason::MODIFY_FAILED, &err.to_string());
            return Err(err);
        }

        let first_attempt = match previous.as_ref() {
            None => true,
            Some(status) => {
                !status.targets(&target) || status.status == ModifyVolumeStatusPhase::Pending
            }
        };
        let claim = if first_attempt {
            if previous.as_ref().is_some_and(|status| !status.targets(&target)) {
                self.slow_set.remove(&key);
            }
            self.mark_in_progress(claim, &target).await?
        } else {
            claim
        };

        self.uncertain.insert(key.clone());
        match self.modifier.modify(&claim, &volume, &class).await {
            Ok(()) => self.finish_modification(claim, volume, &target).await,
            Err(err) => {
                Err(self
                    .handle_modify_failure(claim, &volume, &class, retrying_infeasible, err)
                    .await)
            }
        }
    }

    /// Nothing to apply: clear a leftover status from a rolled-back change.
    async fn settle(
        &self,
        mut claim: VolumeClaim,
        volume: Volume,
    ) -> Result<(VolumeClaim, Volume), Error> {
        let key = claim.key();
        if claim.status.modify_volume_status.is_none() {
            self.uncertain.remove(&key);
            return Ok((claim, volume));
        }

        info!(
            target = ?claim.spec.volume_attributes_class_name,
            "target reverted, dropping outstanding modification",
        );
        claim.status.modify_volume_status = None;
        claim.status.conditions =
            remove_conditions(&claim.status.conditions, &ClaimConditionType::MODIFY);
        let claim = self
            .store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await?;
        self.slow_set.remove(&key);
        self.uncertain.remove(&key);
        Ok((claim, volume))
    }

    async fn mark_pending(
        &self,
        mut claim: VolumeClaim,
        target: &str,
    ) -> Result<VolumeClaim, Error> {
        let key = claim.key();
        self.events.event(
            &key,
            EventType::Warning,
            reason::MODIFY_PENDING,
            &format!("VolumeAttributesClass {target} does not exist"),
        );
        let pending = ModifyVolumeStatus::new(target, ModifyVolumeStatusPhase::Pending);
        if claim.status.modify_volume_status.as_ref() == Some(&pending) {
            return Ok(claim);
        }
        debug!(%target, "attributes class not found, marking pending");
        claim.status.modify_volume_status = Some(pending);
        self.store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await
    }

    async fn mark_in_progress(
        &self,
        mut claim: VolumeClaim,
        target: &str,
    ) -> Result<VolumeClaim, Error> {
        claim.status.modify_volume_status = Some(ModifyVolumeStatus::new(
            target,
            ModifyVolumeStatusPhase::InProgress,
        ));
        claim.status.conditions = replace_conditions(
            &claim.status.conditions,
            &[ClaimConditionType::ModifyVolumeError],
            [ClaimCondition::new(
                ClaimConditionType::ModifyingVolume,
                "",
                format!("modifying volume to attributes class {target}"),
            )],
        );
        self.store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await
    }

    async fn finish_modification(
        &self,
        mut claim: VolumeClaim,
        mut volume: Volume,
        target: &str,
    ) -> Result<(VolumeClaim, Volume), Error> {
        let key = claim.key();
        if volume.spec.volume_attributes_class_name.as_deref() != Some(target) {
            volume.spec.volume_attributes_class_name = Some(target.to_owned());
            volume = self.store.patch_volume(&volume).await?;
        }

        claim.status.current_volume_attributes_class_name = Some(target.to_owned());
        claim.status.modify_volume_status = None;
        claim.status.conditions =
            remove_conditions(&claim.status.conditions, &ClaimConditionType::MODIFY);
        let claim = self
            .store
            .patch_claim_status(&claim, Precondition::MatchVersion)
            .await?;

        self.slow_set.remove(&key);
        self.uncertain.remove(&key);
        info!(%target, "modification finished");
        self.events.event(
            &key,
            EventType::Normal,
            reason::MODIFY_SUCCESSFUL,
            &format!(
                "external resizer modified volume {} with attributes class {target}",
                volume.name()
            ),
        );
        Ok((claim, volume))
    }

    async fn handle_modify_failure(
        &self,
        mut claim: VolumeClaim,
        volume: &Volume,
        class: &VolumeAttributesClass,
        retrying_infeasible: bool,
        err: Error,
    ) -> Error {
        let key = claim.key();
        let target = class.meta.name.as_str();
        let infeasible = err.driver_error().is_some_and(DriverError::is_infeasible);
        self.events.event(
            &key,
            EventType::Warning,
            reason::MODIFY_FAILED,
            &format!("modify volume {} failed: {err}", volume.name()),
        );

        let (phase, precondition) = if infeasible {
            (ModifyVolumeStatusPhase::Infeasible, Precondition::Unconditional)
        } else {
            warn!(error = %err, %target, "modification may still be in progress, will retry");
            (ModifyVolumeStatusPhase::InProgress, Precondition::MatchVersion)
        };
        if infeasible || retrying_infeasible {
            self.slow_set.add(&key);
        }

        claim.status.modify_volume_status = Some(ModifyVolumeStatus::new(target, phase));
        claim.status.conditions = replace_conditions(
            &claim.status.conditions,
            &[ClaimConditionType::ModifyingVolume],
            [ClaimCondition::new(
                ClaimConditionType::ModifyVolumeError,
                "",
                err.to_string(),
            )],
        );
        match self.store.patch_claim_status(&claim, precondition).await {
            Ok(_) => err,
            Err(status_error) => {
                error!(error = %err, %status_error, "failed to record modify failure");
                Error::StatusUpdate {
                    source: Box::new(err),
                    status_error: Box::new(status_error),
                }
            }
        }
    }

    /// Claims whose recorded status says a driver call may be outstanding.
    fn in_flight(claim: &VolumeClaim) -> bool {
        claim.status.modify_volume_status.as_ref().is_some_and(|status| {
            matches!(
                status.status,
                ModifyVolumeStatusPhase::InProgress | ModifyVolumeStatusPhase::Infeasible
            )
        })
    }

    /// A named target not yet applied.  Clearing the target is not a
    /// modification: the volume keeps the attributes it already has.
    fn target_differs(claim: &VolumeClaim) -> bool {
        claim.spec.volume_attributes_class_name.is_some()
            && claim.spec.volume_attributes_class_name
                != claim.status.current_volume_attributes_class_name
    }
}

#[async_trait]
impl Reconcile for ModifyController {
    fn name(&self) -> &'static str {
        "modify"
    }

    async fn reconcile(&self, key: &str) -> Result<(), Error> {
        let (namespace, name) = split_key(key);
        let claim = match self.store.get_claim(namespace, name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                debug!(%key, "claim deleted");
                self.uncertain.remove(key);
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
        if !self.modifier.can_support(&volume) {
            debug!(%key, driver = ?volume.driver(), "volume belongs to another driver");
            return Ok(());
        }

        self.modify(claim, volume).await.map(|_| ())
    }

    fn key_for(&self, event: &StoreEvent) -> Option<String> {
        match event {
            StoreEvent::ClaimAdded(claim) => {
                let key = claim.key();
                if Self::in_flight(claim) {
                    self.uncertain.insert(key.clone());
                }
                (Self::target_differs(claim) || claim.status.modify_volume_status.is_some())
                    .then_some(key)
            }
            StoreEvent::ClaimUpdated { old, new } => {
                let key = new.key();
                if old.meta.resource_version == new.meta.resource_version {
                    return (Self::target_differs(new) || self.uncertain.contains(&key))
                        .then_some(key);
                }
                (old.spec.volume_attributes_class_name != new.spec.volume_attributes_class_name)
                    .then_some(key)
            }
            StoreEvent::ClaimDeleted(claim) => {
                let key = claim.key();
                self.uncertain.remove(&key);
                self.slow_set.remove(&key);
                None
            }
            StoreEvent::PodAdded(_) | StoreEvent::PodUpdated { .. } | StoreEvent::PodDeleted(_) => {
                None
            }
        }
    }
}
