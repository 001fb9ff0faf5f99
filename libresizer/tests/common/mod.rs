//! Shared fixtures for the controller integration tests: a scripted fake
//! driver, an event recorder that keeps what it sees, and object builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libresizer::store::memory::MemoryStore;
use libresizer::{
    ClaimPhase, CsiVolumeSource, DriverClient, DriverError, EventRecorder, EventType,
    ExpandResponse, ObjectMeta, Volume, VolumeAttributesClass, VolumeCapability, VolumeClaim,
};
use tracing_subscriber::EnvFilter;

pub const GI: u64 = 1 << 30;
pub const DRIVER: &str = "fake.csi.rk8s.io";

/// Install a log subscriber once per test binary.  Honours `RUST_LOG`.
pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandCall {
    pub volume_id: String,
    pub requested_bytes: u64,
    pub secrets: HashMap<String, String>,
    pub capability: VolumeCapability,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyCall {
    pub volume_id: String,
    pub parameters: HashMap<String, String>,
}

/// Driver whose answers are scripted per call.  Once a script runs out,
/// expand echoes the requested size and modify succeeds.
pub struct FakeDriver {
    controller_service: bool,
    controller_expand: bool,
    node_expand: bool,
    controller_modify: bool,
    node_expansion_required: bool,
    expand_script: Mutex<VecDeque<Result<ExpandResponse, DriverError>>>,
    modify_script: Mutex<VecDeque<Result<(), DriverError>>>,
    expand_calls: Mutex<Vec<ExpandCall>>,
    modify_calls: Mutex<Vec<ModifyCall>>,
    during_call: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FakeDriver {
    /// Supports every controller capability.
    pub fn new() -> Self {
        Self {
            controller_service: true,
            controller_expand: true,
            node_expand: true,
            controller_modify: true,
            node_expansion_required: false,
            expand_script: Mutex::default(),
            modify_script: Mutex::default(),
            expand_calls: Mutex::default(),
            modify_calls: Mutex::default(),
            during_call: Mutex::default(),
        }
    }

    /// Expands on the node only.
    pub fn node_only() -> Self {
        Self {
            controller_expand: false,
            controller_modify: false,
            ..Self::new()
        }
    }

    pub fn without_expansion() -> Self {
        Self {
            controller_expand: false,
            node_expand: false,
            ..Self::new()
        }
    }

    pub fn without_modify() -> Self {
        Self {
            controller_modify: false,
            ..Self::new()
        }
    }

    /// Default expand answers report node-side work.
    pub fn requiring_node_expansion(self) -> Self {
        Self {
            node_expansion_required: true,
            ..self
        }
    }

    pub fn push_expand(&self, response: Result<ExpandResponse, DriverError>) {
        self.expand_script.lock().unwrap().push_back(response);
    }

    pub fn push_modify(&self, response: Result<(), DriverError>) {
        self.modify_script.lock().unwrap().push_back(response);
    }

    /// Run `hook` inside every expand and modify call, before answering.
    pub fn on_call(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.during_call.lock().unwrap() = Some(Box::new(hook));
    }

    fn run_hook(&self) {
        if let Some(hook) = self.during_call.lock().unwrap().as_ref() {
            hook();
        }
    }

    pub fn expand_calls(&self) -> Vec<ExpandCall> {
        self.expand_calls.lock().unwrap().clone()
    }

    pub fn modify_calls(&self) -> Vec<ModifyCall> {
        self.modify_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriverClient for FakeDriver {
    async fn get_driver_name(&self) -> Result<String, DriverError> {
        Ok(DRIVER.to_owned())
    }

    async fn supports_controller_service(&self) -> Result<bool, DriverError> {
        Ok(self.controller_service)
    }

    async fn supports_controller_expand(&self) -> Result<bool, DriverError> {
        Ok(self.controller_expand)
    }

    async fn supports_node_expand(&self) -> Result<bool, DriverError> {
        Ok(self.node_expand)
    }

    async fn supports_controller_modify(&self) -> Result<bool, DriverError> {
        Ok(self.controller_modify)
    }

    async fn expand(
        &self,
        volume_id: &str,
        requested_bytes: u64,
        secrets: &HashMap<String, String>,
        capability: &VolumeCapability,
    ) -> Result<ExpandResponse, DriverError> {
        self.expand_calls.lock().unwrap().push(ExpandCall {
            volume_id: volume_id.to_owned(),
            requested_bytes,
            secrets: secrets.clone(),
            capability: capability.clone(),
        });
        self.run_hook();
        let scripted = self.expand_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(ExpandResponse {
            capacity_bytes: requested_bytes,
            node_expansion_required: self.node_expansion_required,
        }))
    }

    async fn modify(
        &self,
        volume_id: &str,
        _secrets: &HashMap<String, String>,
        parameters: &HashMap<String, String>,
    ) -> Result<(), DriverError> {
        self.modify_calls.lock().unwrap().push(ModifyCall {
            volume_id: volume_id.to_owned(),
            parameters: parameters.clone(),
        });
        self.run_hook();
        let scripted = self.modify_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub claim: String,
    pub kind: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn has(&self, kind: EventType, reason: &str) -> bool {
        self.all()
            .iter()
            .any(|e| e.kind == kind && e.reason == reason)
    }
}

impl EventRecorder for RecordingEvents {
    fn event(&self, claim: &str, kind: EventType, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            claim: claim.to_owned(),
            kind,
            reason: reason.to_owned(),
            message: message.to_owned(),
        });
    }
}

pub fn volume(name: &str, capacity: u64, claim_key: &str) -> Volume {
    let mut volume = Volume {
        meta: ObjectMeta::cluster(name),
        ..Default::default()
    };
    volume.spec.capacity_bytes = capacity;
    volume.spec.claim_ref = Some(claim_key.to_owned());
    volume.spec.csi = Some(CsiVolumeSource {
        driver: DRIVER.to_owned(),
        volume_handle: format!("handle-{name}"),
        fs_type: "ext4".to_owned(),
        secret_ref: None,
    });
    volume
}

/// A claim bound to `volume_name` with matching recorded capacity.
pub fn bound_claim(namespace: &str, name: &str, requested: u64, capacity: u64, volume_name: &str) -> VolumeClaim {
    let mut claim = VolumeClaim {
        meta: ObjectMeta::namespaced(namespace, name),
        ..Default::default()
    };
    claim.spec.requested_bytes = requested;
    claim.spec.volume_name = Some(volume_name.to_owned());
    claim.status.phase = ClaimPhase::Bound;
    claim.status.capacity_bytes = Some(capacity);
    claim
}

pub fn attributes_class(name: &str, parameters: &[(&str, &str)]) -> VolumeAttributesClass {
    VolumeAttributesClass {
        meta: ObjectMeta::cluster(name),
        driver_name: DRIVER.to_owned(),
        parameters: parameters
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
    }
}

/// Store plus a claim of `requested` bytes bound to a volume of
/// `capacity` bytes, both named after `name`.
pub fn store_with_claim(
    name: &str,
    requested: u64,
    capacity: u64,
    edit: impl FnOnce(&mut VolumeClaim, &mut Volume),
) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let volume_name = format!("pv-{name}");
    let mut claim = bound_claim("default", name, requested, capacity, &volume_name);
    let mut volume = volume(&volume_name, capacity, &claim.key());
    edit(&mut claim, &mut volume);
    store.upsert_volume(volume);
    store.upsert_claim(claim);
    store
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in time");
}
