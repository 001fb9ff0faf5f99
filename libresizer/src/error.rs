//! Error types.
//!
//! Every fallible operation in `libresizer` returns [`Error`].  Failures
//! coming back from the storage driver are kept as a distinct
//! [`DriverError`] so the engines can classify them (final vs. retriable,
//! infeasible, in-use) without string matching.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for reconciliation.
#[derive(Debug, Error)]
pub enum Error {
    /// The object was deleted; callers treat this as a successful no-op.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// A version-checked write lost a race with another writer.
    #[error("conflict writing {key}: the object has been modified")]
    Conflict { key: String },

    /// The resource store failed for a reason other than not-found/conflict.
    #[error("resource store error: {0}")]
    Store(String),

    /// The storage driver rejected or failed the call.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Expansion was skipped because the driver previously refused it while
    /// the volume was mounted, and it still is.
    #[error("claim {claim} is in use; expansion deferred until it is no longer mounted")]
    VolumeInUse { claim: String },

    /// The modification was rejected as infeasible recently; retry later.
    #[error("delaying modification of {key} for {after:?} after an infeasible attempt")]
    DelayRetry { key: String, after: Duration },

    /// The object is missing data required for reconciliation.
    #[error("invalid object {key}: {reason}")]
    InvalidObject { key: String, reason: String },

    /// The driver lacks a capability the caller depends on.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Recording a terminal status failed after the operation itself failed.
    /// `source` is the original failure.
    #[error("{source}; additionally failed to record failure status: {status_error}")]
    StatusUpdate {
        source: Box<Error>,
        status_error: Box<Error>,
    },
}

impl Error {
    /// Create an [`Error::NotFound`] for an object of `kind`.
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Create an [`Error::Conflict`] for `key`.
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Create an [`Error::Store`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn store<E: fmt::Display>(e: E) -> Self {
        Self::Store(e.to_string())
    }

    /// Create an [`Error::InvalidObject`].
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether the reconciled object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a version-checked write lost a race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Requested requeue delay for [`Error::DelayRetry`].
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::DelayRetry { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Driver failure carried by this error, looking through status-update
    /// wrappers.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Driver(e) => Some(e),
            Self::StatusUpdate { source, .. } => source.driver_error(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver errors
// ---------------------------------------------------------------------------

/// Status codes a driver may answer with.  Mirrors the gRPC code space the
/// CSI protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for DriverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed driver call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The driver answered with an error status.
    #[error("{code}: {message}")]
    Status { code: DriverCode, message: String },

    /// The call never produced a driver answer (connection refused, request
    /// could not be encoded, ...).
    #[error("transport: {0}")]
    Transport(String),
}

impl DriverError {
    /// Error status answered by the driver.
    pub fn status(code: DriverCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Create a [`DriverError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// The local timeout around a driver call expired.
    pub fn timeout(after: Duration) -> Self {
        Self::status(
            DriverCode::DeadlineExceeded,
            format!("driver call timed out after {after:?}"),
        )
    }

    /// Status code, `None` when the call never got an answer.
    pub fn code(&self) -> Option<DriverCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::Transport(_) => None,
        }
    }

    /// Whether the driver is known to have stopped working on the request.
    ///
    /// Timeouts, unavailability, throttling, aborts and cancellation may
    /// leave the operation running remotely, so they are not final.  Neither
    /// is a transport failure: we cannot tell whether an earlier call is
    /// still in flight.
    pub fn is_final(&self) -> bool {
        match self.code() {
            None => false,
            Some(
                DriverCode::Cancelled
                | DriverCode::DeadlineExceeded
                | DriverCode::Unavailable
                | DriverCode::ResourceExhausted
                | DriverCode::Aborted,
            ) => false,
            Some(_) => true,
        }
    }

    /// Parameter/validation rejections that retrying cannot fix.
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self.code(),
            Some(DriverCode::InvalidArgument | DriverCode::OutOfRange)
        )
    }

    /// The driver declined to act while the volume is attached.
    pub fn is_in_use(&self) -> bool {
        self.code() == Some(DriverCode::FailedPrecondition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::not_found("claim", "ns/data");
        assert_eq!(err.to_string(), "claim ns/data not found");

        let err = Error::from(DriverError::status(DriverCode::InvalidArgument, "bad iops"));
        assert_eq!(err.to_string(), "driver error: InvalidArgument: bad iops");
    }

    #[test]
    fn non_final_codes() {
        for code in [
            DriverCode::Cancelled,
            DriverCode::DeadlineExceeded,
            DriverCode::Unavailable,
            DriverCode::ResourceExhausted,
            DriverCode::Aborted,
        ] {
            assert!(!DriverError::status(code, "").is_final(), "{code}");
        }
        assert!(!DriverError::transport("connection refused").is_final());
        assert!(!DriverError::timeout(Duration::from_secs(1)).is_final());
    }

    #[test]
    fn final_and_infeasible_codes() {
        let invalid = DriverError::status(DriverCode::InvalidArgument, "");
        assert!(invalid.is_final());
        assert!(invalid.is_infeasible());

        let internal = DriverError::status(DriverCode::Internal, "");
        assert!(internal.is_final());
        assert!(!internal.is_infeasible());

        let in_use = DriverError::status(DriverCode::FailedPrecondition, "attached");
        assert!(in_use.is_final());
        assert!(in_use.is_in_use());
    }

    #[test]
    fn driver_error_seen_through_status_update() {
        let err = Error::StatusUpdate {
            source: Box::new(DriverError::status(DriverCode::Internal, "boom").into()),
            status_error: Box::new(Error::conflict("ns/a")),
        };
        assert_eq!(
            err.driver_error().and_then(DriverError::code),
            Some(DriverCode::Internal)
        );
        assert!(err.to_string().contains("failed to record failure status"));
    }

    #[test]
    fn retry_after_only_for_delay() {
        let err = Error::DelayRetry {
            key: "ns/a".into(),
            after: Duration::from_secs(3),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(Error::conflict("ns/a").retry_after(), None);
    }
}
