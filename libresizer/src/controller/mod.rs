//! Reconciler loop shared by the resize and modify controllers.
//!
//! [`run_controller`] lists the current objects, follows store change
//! notifications, and feeds the resulting keys through a [`WorkQueue`] to
//! a pool of workers.  A worker forgets a key's backoff on success and
//! re-queues it with backoff on failure.  Deleted objects count as success.

pub mod modify;
pub mod resize;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::store::{ResourceStore, StoreEvent};
use crate::workqueue::WorkQueue;

pub use modify::{ModifyController, new_modify_controller};
pub use resize::{ExpansionPlan, ResizeController, new_resize_controller, plan_expansion};

/// One controller's reconciliation logic.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Drive the object behind `key` one step towards its desired state.
    async fn reconcile(&self, key: &str) -> Result<(), Error>;

    /// Observe a change notification and return the key to enqueue, if
    /// any.  Called from a single task, concurrently with `reconcile`.
    fn key_for(&self, event: &StoreEvent) -> Option<String>;
}

/// Resolves once shutdown is requested or the signal's sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Replay current objects as add events (`initial`) or same-version
/// updates (resync).
async fn replay<R: Reconcile>(
    reconciler: &R,
    store: &dyn ResourceStore,
    queue: &WorkQueue,
    initial: bool,
) -> Result<(), Error> {
    if initial {
        for pod in store.list_pods().await? {
            reconciler.key_for(&StoreEvent::PodAdded(pod));
        }
    }
    let claims = store.list_claims().await?;
    let count = claims.len();
    for claim in claims {
        let event = if initial {
            StoreEvent::ClaimAdded(claim)
        } else {
            StoreEvent::ClaimUpdated {
                old: claim.clone(),
                new: claim,
            }
        };
        if let Some(key) = reconciler.key_for(&event) {
            queue.add(&key);
        }
    }
    debug!(controller = reconciler.name(), count, initial, "claims replayed");
    Ok(())
}

async fn pump_events<R: Reconcile>(
    reconciler: Arc<R>,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue>,
    mut events: broadcast::Receiver<StoreEvent>,
    resync_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + resync_period,
        resync_period,
    );
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let needs_resync = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(key) = reconciler.key_for(&event) {
                        queue.add(&key);
                    }
                    false
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(controller = reconciler.name(), missed, "change notifications lagged, resyncing");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(controller = reconciler.name(), "change notifications closed");
                    break;
                }
            },
            _ = resync.tick() => true,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        if needs_resync
            && let Err(e) = replay(reconciler.as_ref(), store.as_ref(), &queue, false).await
        {
            warn!(controller = reconciler.name(), error = %e, "resync failed");
        }
    }
}

async fn worker<R: Reconcile>(
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    while let Some(key) = queue.get().await {
        let result = tokio::select! {
            result = reconciler.reconcile(&key) => result,
            _ = shutdown_requested(&mut shutdown) => {
                queue.done(&key);
                break;
            }
        };

        match result {
            Ok(()) => queue.forget(&key),
            Err(e) if e.is_not_found() => {
                debug!(controller = reconciler.name(), %key, error = %e, "object gone, nothing to reconcile");
                queue.forget(&key);
            }
            Err(e) => match e.retry_after() {
                Some(after) => {
                    debug!(controller = reconciler.name(), %key, ?after, "retry delayed");
                    queue.add_after(&key, after);
                }
                None => {
                    warn!(
                        controller = reconciler.name(),
                        %key,
                        error = %e,
                        requeues = queue.num_requeues(&key),
                        "reconcile failed, requeueing",
                    );
                    queue.add_rate_limited(&key);
                }
            },
        }
        queue.done(&key);
    }
    debug!(controller = reconciler.name(), id, "worker stopped");
}

/// Run `reconciler` with `workers` workers until `shutdown` fires.
///
/// Returns after the queue is shut down and every worker has exited.
pub async fn run_controller<R: Reconcile>(
    reconciler: Arc<R>,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue>,
    workers: usize,
    resync_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(controller = reconciler.name(), workers, "starting controller");

    // Subscribe before listing so nothing between the two is missed.
    let events = store.subscribe();
    if let Err(e) = replay(reconciler.as_ref(), store.as_ref(), &queue, true).await {
        warn!(controller = reconciler.name(), error = %e, "initial listing failed, waiting for resync");
    }

    let mut tasks = JoinSet::new();
    tasks.spawn(pump_events(
        Arc::clone(&reconciler),
        Arc::clone(&store),
        Arc::clone(&queue),
        events,
        resync_period,
        shutdown.clone(),
    ));
    for id in 0..workers {
        tasks.spawn(worker(
            id,
            Arc::clone(&reconciler),
            Arc::clone(&queue),
            shutdown.clone(),
        ));
    }

    shutdown_requested(&mut shutdown).await;
    queue.shut_down();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(controller = reconciler.name(), error = %e, "controller task panicked");
        }
    }
    info!(controller = reconciler.name(), "controller stopped");
}
