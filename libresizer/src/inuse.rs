//! Tracks which claims are mounted by live pods, and which claims the driver
//! refused to expand while mounted.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::types::Pod;

#[derive(Default)]
struct State {
    /// Claim key -> keys of pods mounting it.
    users: HashMap<String, HashSet<String>>,
    /// Claims whose last expansion hit an in-use rejection.
    rejected: HashSet<String>,
}

/// Both maps sit behind one lock, but callers must not rely on reading them
/// atomically together.
#[derive(Default)]
pub struct InUseTracker {
    state: Mutex<State>,
}

impl InUseTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the claims a pod mounts.  Finished pods mount nothing.
    pub fn add_pod(&self, pod: &Pod) {
        if pod.phase.is_terminal() {
            return;
        }
        let pod_key = pod.meta.key();
        let mut state = self.lock();
        for claim in pod.claim_keys() {
            debug!(%claim, pod = %pod_key, "claim mounted");
            state
                .users
                .entry(claim)
                .or_default()
                .insert(pod_key.clone());
        }
    }

    /// Forget a pod's mounts regardless of its phase.
    pub fn remove_pod(&self, pod: &Pod) {
        let pod_key = pod.meta.key();
        let mut state = self.lock();
        for claim in pod.claim_keys() {
            if let Some(pods) = state.users.get_mut(&claim) {
                pods.remove(&pod_key);
                if pods.is_empty() {
                    state.users.remove(&claim);
                }
            }
        }
    }

    /// A pod moved to a terminal phase releases its claims; otherwise its
    /// (possibly changed) volume list is re-recorded.
    pub fn update_pod(&self, old: &Pod, new: &Pod) {
        self.remove_pod(old);
        self.add_pod(new);
    }

    /// Whether any live pod mounts `claim`.
    pub fn check_for_use(&self, claim: &str) -> bool {
        self.lock()
            .users
            .get(claim)
            .is_some_and(|pods| !pods.is_empty())
    }

    /// Remember that the driver refused `claim` while it was mounted.
    pub fn mark_in_use_error(&self, claim: &str) {
        self.lock().rejected.insert(claim.to_owned());
    }

    /// Clear the refusal flag before a new driver call.
    pub fn remove_in_use_error(&self, claim: &str) {
        self.lock().rejected.remove(claim);
    }

    /// Whether the last expansion of `claim` was refused as in use.
    pub fn has_in_use_error(&self, claim: &str) -> bool {
        self.lock().rejected.contains(claim)
    }
}
