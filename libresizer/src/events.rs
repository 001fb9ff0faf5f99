//! User-visible events attached to claims.

use tracing::{info, warn};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Event reasons.
pub mod reason {
    /// Expansion call issued.
    pub const RESIZING: &str = "Resizing";
    /// Expansion failed or was deferred.
    pub const RESIZE_FAILED: &str = "VolumeResizeFailed";
    /// Expansion finished.
    pub const RESIZE_SUCCESSFUL: &str = "VolumeResizeSuccessful";
    /// Control-plane expansion done; the node must finish.
    pub const NODE_EXPANSION_REQUIRED: &str = "FileSystemResizeRequired";
    /// Modification failed.
    pub const MODIFY_FAILED: &str = "VolumeModifyFailed";
    /// Modification applied.
    pub const MODIFY_SUCCESSFUL: &str = "VolumeModifySuccessful";
    /// Target attributes class does not exist yet.
    pub const MODIFY_PENDING: &str = "VolumeModifyPending";
}

/// Sink for events about a claim, identified by its `namespace/name` key.
pub trait EventRecorder: Send + Sync {
    /// Record an event against `claim`.
    fn event(&self, claim: &str, kind: EventType, reason: &str, message: &str);
}

/// Recorder that only writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    /// Record an event against `claim`.
    fn event(&self, claim: &str, kind: EventType, reason: &str, message: &str) {
        match kind {
            EventType::Normal => info!(%claim, %reason, "{message}"),
            EventType::Warning => warn!(%claim, %reason, "{message}"),
        }
    }
}
