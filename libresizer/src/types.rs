//! Core data model: claims, volumes, attribute classes, pods, and the
//! status enums the engines drive.
//!
//! These are the cached views the [`ResourceStore`](crate::store::ResourceStore)
//! hands out.  Sizes are plain byte counts and are compared exactly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

// ---------------------------------------------------------------------------
// Object identity
// ---------------------------------------------------------------------------

/// Identity and optimistic-concurrency metadata shared by every object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Namespace; empty for cluster-scoped objects (volumes, classes).
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    /// Metadata of a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Metadata of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

/// Build a queue key in `namespace/name` form.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a queue key back into `(namespace, name)`.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => ("", key),
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Single-pod read-write.
    ReadWriteOncePod,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Whether the volume is consumed through a filesystem or as a raw device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

/// How the driver should expose the volume, sent alongside `Expand`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    Mount {
        #[serde(default)]
        fs_type: String,
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    Block,
}

/// Capability descriptor handed to the driver on expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Reference to a secret holding driver credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

/// The CSI-specific part of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsiVolumeSource {
    /// Name of the driver that owns this volume.
    pub driver: String,
    /// Driver-assigned volume identifier.
    pub volume_handle: String,
    #[serde(default)]
    pub fs_type: String,
    /// Credentials for controller-side expand/modify calls.
    #[serde(default)]
    pub secret_ref: Option<SecretRef>,
}

/// Desired state of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    pub capacity_bytes: u64,
    #[serde(default)]
    pub csi: Option<CsiVolumeSource>,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub volume_mode: VolumeMode,
    #[serde(default)]
    pub mount_options: Vec<String>,
    /// Attribute class currently applied to the backing storage.
    #[serde(default)]
    pub volume_attributes_class_name: Option<String>,
    /// Key of the claim this volume is bound to.
    #[serde(default)]
    pub claim_ref: Option<String>,
}

/// The bound, driver-managed storage resource backing a claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub meta: ObjectMeta,
    pub spec: VolumeSpec,
}

impl Volume {
    /// Volume name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Driver name, if this is a CSI volume.
    pub fn driver(&self) -> Option<&str> {
        self.spec.csi.as_ref().map(|csi| csi.driver.as_str())
    }

    /// Build the capability descriptor sent with `Expand`.
    ///
    /// The first declared access mode wins; volumes without one are treated
    /// as single-node read-write.
    pub fn capability(&self) -> VolumeCapability {
        let access_mode = self
            .spec
            .access_modes
            .first()
            .copied()
            .unwrap_or(AccessMode::ReadWriteOnce);
        let access_type = match self.spec.volume_mode {
            VolumeMode::Block => AccessType::Block,
            VolumeMode::Filesystem => AccessType::Mount {
                fs_type: self
                    .spec
                    .csi
                    .as_ref()
                    .map(|csi| csi.fs_type.clone())
                    .unwrap_or_default(),
                mount_flags: self.spec.mount_options.clone(),
            },
        };
        VolumeCapability {
            access_mode,
            access_type,
        }
    }
}

// ---------------------------------------------------------------------------
// Claim status enums
// ---------------------------------------------------------------------------

/// Progress of a control-plane/node expansion recorded on the claim.
///
/// The absence of a status (`None` on the claim) means no operation is
/// outstanding.  Whenever a status is present the claim must also carry an
/// allocated size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResizeStatus {
    ControllerResizeInProgress,
    ControllerResizeInfeasible,
    ControllerResizeFailed,
    NodeResizePending,
    NodeResizeInProgress,
    NodeResizeFailed,
}

impl ResizeStatus {
    /// Node-side statuses: the node plugin owns finishing the operation.
    pub fn is_node_owned(self) -> bool {
        matches!(self, Self::NodeResizePending | Self::NodeResizeInProgress)
    }
}

impl fmt::Display for ResizeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Phase of an outstanding attribute-class modification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModifyVolumeStatusPhase {
    /// The target class does not exist yet.
    Pending,
    InProgress,
    /// The driver rejected the target parameters.
    Infeasible,
}

/// Outstanding modification, always tied to the target class it refers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModifyVolumeStatus {
    pub target_volume_attributes_class_name: String,
    pub status: ModifyVolumeStatusPhase,
}

impl ModifyVolumeStatus {
    /// Status of a modification towards `target`.
    pub fn new(target: impl Into<String>, status: ModifyVolumeStatusPhase) -> Self {
        Self {
            target_volume_attributes_class_name: target.into(),
            status,
        }
    }

    /// Whether this status refers to `class`.
    pub fn targets(&self, class: &str) -> bool {
        self.target_volume_attributes_class_name == class
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Condition types this crate writes.  Anything else is carried through
/// untouched as [`ClaimConditionType::Other`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClaimConditionType {
    Resizing,
    FileSystemResizePending,
    ControllerResizeError,
    ModifyingVolume,
    ModifyVolumeError,
    Other(String),
}

impl ClaimConditionType {
    /// Conditions owned by the resize controller.
    pub const RESIZE: [ClaimConditionType; 3] = [
        Self::Resizing,
        Self::FileSystemResizePending,
        Self::ControllerResizeError,
    ];

    /// Conditions owned by the modify controller.
    pub const MODIFY: [ClaimConditionType; 2] = [Self::ModifyingVolume, Self::ModifyVolumeError];
}

/// Human-readable condition attached to a claim's status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimCondition {
    #[serde(rename = "type")]
    pub type_: ClaimConditionType,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: SystemTime,
}

impl ClaimCondition {
    /// Condition stamped with the current time.
    pub fn new(type_: ClaimConditionType, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_,
            status: true,
            reason: reason.to_owned(),
            message: message.into(),
            last_transition_time: SystemTime::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

/// Binding phase of a claim.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

/// User-owned part of a claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimSpec {
    /// Requested size in bytes.
    pub requested_bytes: u64,
    /// Name of the bound volume.
    #[serde(default)]
    pub volume_name: Option<String>,
    /// Attribute class the user wants applied.
    #[serde(default)]
    pub volume_attributes_class_name: Option<String>,
}

/// System-owned part of a claim, written through the status subresource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
    /// Observed bound size.
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    /// Last size the system committed to act on.
    #[serde(default)]
    pub allocated_bytes: Option<u64>,
    #[serde(default)]
    pub resize_status: Option<ResizeStatus>,
    #[serde(default)]
    pub current_volume_attributes_class_name: Option<String>,
    #[serde(default)]
    pub modify_volume_status: Option<ModifyVolumeStatus>,
    #[serde(default)]
    pub conditions: Vec<ClaimCondition>,
}

/// A user's request for storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeClaim {
    pub meta: ObjectMeta,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

impl VolumeClaim {
    /// `namespace/name` key used by the work queues.
    pub fn key(&self) -> String {
        self.meta.key()
    }

    /// Bound to a named volume.
    pub fn is_bound(&self) -> bool {
        self.status.phase == ClaimPhase::Bound && self.spec.volume_name.is_some()
    }

    /// Observed bound size, zero when nothing has been recorded yet.
    pub fn capacity(&self) -> u64 {
        self.status.capacity_bytes.unwrap_or(0)
    }

    /// Whether a condition of `type_` is present.
    pub fn has_condition(&self, type_: &ClaimConditionType) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| &c.type_ == type_ && c.status)
    }
}

// ---------------------------------------------------------------------------
// Attribute class
// ---------------------------------------------------------------------------

/// A named bundle of driver-specific volume parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeAttributesClass {
    pub meta: ObjectMeta,
    pub driver_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Pod
// ---------------------------------------------------------------------------

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Finished pods no longer mount anything.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A volume entry in a pod spec.  Only claim-backed volumes matter here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodVolume {
    pub name: String,
    #[serde(default)]
    pub claim_name: Option<String>,
}

/// A workload that may mount claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
}

impl Pod {
    /// Keys of every claim this pod references.
    pub fn claim_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.volumes
            .iter()
            .filter_map(|v| v.claim_name.as_deref())
            .map(|claim| object_key(&self.meta.namespace, claim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_through_split() {
        let meta = ObjectMeta::namespaced("default", "data");
        assert_eq!(meta.key(), "default/data");
        assert_eq!(split_key("default/data"), ("default", "data"));
        assert_eq!(split_key("pv-1"), ("", "pv-1"));
        assert_eq!(ObjectMeta::cluster("pv-1").key(), "pv-1");
    }

    #[test]
    fn capability_follows_volume_mode() {
        let mut vol = Volume {
            meta: ObjectMeta::cluster("pv"),
            spec: VolumeSpec {
                capacity_bytes: 1,
                csi: Some(CsiVolumeSource {
                    driver: "d".into(),
                    volume_handle: "h".into(),
                    fs_type: "ext4".into(),
                    secret_ref: None,
                }),
                access_modes: vec![AccessMode::ReadWriteMany],
                mount_options: vec!["noatime".into()],
                ..Default::default()
            },
        };
        let cap = vol.capability();
        assert_eq!(cap.access_mode, AccessMode::ReadWriteMany);
        assert_eq!(
            cap.access_type,
            AccessType::Mount {
                fs_type: "ext4".into(),
                mount_flags: vec!["noatime".into()],
            }
        );

        vol.spec.volume_mode = VolumeMode::Block;
        assert_eq!(vol.capability().access_type, AccessType::Block);
    }

    #[test]
    fn pod_claim_keys_skip_non_claim_volumes() {
        let pod = Pod {
            meta: ObjectMeta::namespaced("ns", "web-0"),
            phase: PodPhase::Running,
            volumes: vec![
                PodVolume {
                    name: "data".into(),
                    claim_name: Some("data-web-0".into()),
                },
                PodVolume {
                    name: "scratch".into(),
                    claim_name: None,
                },
            ],
        };
        assert_eq!(pod.claim_keys().collect::<Vec<_>>(), vec!["ns/data-web-0"]);
    }

    #[test]
    fn node_owned_statuses() {
        assert!(ResizeStatus::NodeResizePending.is_node_owned());
        assert!(ResizeStatus::NodeResizeInProgress.is_node_owned());
        assert!(!ResizeStatus::NodeResizeFailed.is_node_owned());
        assert!(!ResizeStatus::ControllerResizeInProgress.is_node_owned());
    }
}
