//! In-process [`ResourceStore`] with versioned writes and change
//! notifications.
//!
//! Every write bumps a store-wide version counter and stamps it on the
//! object, so version checks behave like an API server's.  User-side
//! mutations (`upsert_*`, `delete_*`) broadcast the same [`StoreEvent`]s a
//! watch would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Precondition, ResourceStore, StoreEvent};
use crate::error::Error;
use crate::types::{Pod, Volume, VolumeAttributesClass, VolumeClaim, object_key};

const EVENT_BUFFER: usize = 1024;

#[derive(Default)]
struct State {
    version: u64,
    claims: BTreeMap<String, VolumeClaim>,
    volumes: BTreeMap<String, Volume>,
    classes: BTreeMap<String, VolumeAttributesClass>,
    pods: BTreeMap<String, Pod>,
    secrets: HashMap<String, HashMap<String, String>>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Store backed by process memory.
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine: nobody is watching yet.
        let _ = self.events.send(event);
    }

    /// Create or replace a claim, spec and status alike.
    pub fn upsert_claim(&self, mut claim: VolumeClaim) -> VolumeClaim {
        let key = claim.key();
        let event = {
            let mut state = self.lock();
            claim.meta.resource_version = state.next_version();
            let old = state.claims.insert(key, claim.clone());
            match old {
                Some(old) => StoreEvent::ClaimUpdated {
                    old,
                    new: claim.clone(),
                },
                None => StoreEvent::ClaimAdded(claim.clone()),
            }
        };
        self.publish(event);
        claim
    }

    /// Remove a claim and notify watchers.
    pub fn delete_claim(&self, namespace: &str, name: &str) -> Option<VolumeClaim> {
        let removed = self.lock().claims.remove(&object_key(namespace, name));
        if let Some(claim) = &removed {
            self.publish(StoreEvent::ClaimDeleted(claim.clone()));
        }
        removed
    }

    /// Create or replace a volume.  Volumes produce no notifications.
    pub fn upsert_volume(&self, mut volume: Volume) -> Volume {
        let mut state = self.lock();
        volume.meta.resource_version = state.next_version();
        state
            .volumes
            .insert(volume.meta.name.clone(), volume.clone());
        volume
    }

    /// Create or replace an attributes class.
    pub fn upsert_class(&self, mut class: VolumeAttributesClass) -> VolumeAttributesClass {
        let mut state = self.lock();
        class.meta.resource_version = state.next_version();
        state.classes.insert(class.meta.name.clone(), class.clone());
        class
    }

    /// Remove an attributes class.
    pub fn delete_class(&self, name: &str) -> Option<VolumeAttributesClass> {
        self.lock().classes.remove(name)
    }

    /// Create or replace a pod and notify watchers.
    pub fn upsert_pod(&self, mut pod: Pod) -> Pod {
        let key = pod.meta.key();
        let event = {
            let mut state = self.lock();
            pod.meta.resource_version = state.next_version();
            match state.pods.insert(key, pod.clone()) {
                Some(old) => StoreEvent::PodUpdated {
                    old,
                    new: pod.clone(),
                },
                None => StoreEvent::PodAdded(pod.clone()),
            }
        };
        self.publish(event);
        pod
    }

    /// Remove a pod and notify watchers.
    pub fn delete_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        let removed = self.lock().pods.remove(&object_key(namespace, name));
        if let Some(pod) = &removed {
            self.publish(StoreEvent::PodDeleted(pod.clone()));
        }
        removed
    }

    /// Store secret data under `namespace/name`.
    pub fn put_secret(&self, namespace: &str, name: &str, data: HashMap<String, String>) {
        self.lock()
            .secrets
            .insert(object_key(namespace, name), data);
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<VolumeClaim, Error> {
        let key = object_key(namespace, name);
        self.lock()
            .claims
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found("claim", key))
    }

    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, Error> {
        Ok(self.lock().claims.values().cloned().collect())
    }

    async fn get_volume(&self, name: &str) -> Result<Volume, Error> {
        self.lock()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("volume", name))
    }

    async fn get_attributes_class(&self, name: &str) -> Result<VolumeAttributesClass, Error> {
        self.lock()
            .classes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("attributes class", name))
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        Ok(self.lock().pods.values().cloned().collect())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HashMap<String, String>, Error> {
        let key = object_key(namespace, name);
        self.lock()
            .secrets
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found("secret", key))
    }

    async fn patch_claim_status(
        &self,
        claim: &VolumeClaim,
        precondition: Precondition,
    ) -> Result<VolumeClaim, Error> {
        let key = claim.key();
        let (old, new) = {
            let mut state = self.lock();
            let version = state.next_version();
            let Some(stored) = state.claims.get_mut(&key) else {
                return Err(Error::not_found("claim", key));
            };
            if precondition == Precondition::MatchVersion
                && stored.meta.resource_version != claim.meta.resource_version
            {
                debug!(
                    %key,
                    stored = stored.meta.resource_version,
                    given = claim.meta.resource_version,
                    "status write rejected by version check",
                );
                return Err(Error::conflict(key));
            }
            let old = stored.clone();
            stored.status = claim.status.clone();
            stored.meta.resource_version = version;
            (old, stored.clone())
        };
        self.publish(StoreEvent::ClaimUpdated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    async fn patch_volume(&self, volume: &Volume) -> Result<Volume, Error> {
        let mut state = self.lock();
        let version = state.next_version();
        let Some(stored) = state.volumes.get_mut(&volume.meta.name) else {
            return Err(Error::not_found("volume", volume.meta.name.clone()));
        };
        stored.spec = volume.spec.clone();
        stored.meta.resource_version = version;
        Ok(stored.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
