//! CSI error types.
//!
//! Every failure surfaced by the controller and node services is a
//! [`CsiError`].  Errors derive [`thiserror::Error`] for ergonomic handling and
//! implement [`Serialize`]/[`Deserialize`] so they can travel inside a
//! [`CsiMessage`](crate::message::CsiMessage) frame.  [`CsiError::code`] maps
//! each variant onto the gRPC status code an orchestrator expects.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// gRPC-style status code carried alongside every error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    Unauthenticated,
    Unimplemented,
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Aborted => "Aborted",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Unavailable => "Unavailable",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Cancelled => "Cancelled",
            Self::Unauthenticated => "Unauthenticated",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The requested snapshot was not found.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// Some other referenced resource (node, path) was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A volume with the same name but different parameters already exists.
    #[error("volume {0} already exists with different parameters")]
    VolumeAlreadyExists(String),

    /// A snapshot with the same name but a different source already exists.
    #[error("snapshot {0} already exists with a different source volume")]
    SnapshotAlreadyExists(String),

    /// The resource is not in a state that allows the requested transition.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Another operation on the same resource is still running.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The provider kept throttling until retries ran out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The provider or network kept failing until retries ran out.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The request deadline passed before the operation finished.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The request was cancelled by the caller.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A mount or format operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The device already carries a different filesystem than requested.
    #[error("device {device} holds {existing} but {requested} was requested")]
    FilesystemMismatch {
        device: String,
        existing: String,
        requested: String,
    },

    /// The passphrase does not unlock the encrypted device.
    #[error("passphrase rejected for encrypted device {0}")]
    BadPassphrase(String),

    /// Formatting, opening or closing an encrypted device failed.
    #[error("encryption failed on {device}: {reason}")]
    EncryptionFailed { device: String, reason: String },

    /// The RPC group is not served in the configured mode.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// The cloud provider returned an unclassified error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A socket / framing error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Status code reported to the orchestrator.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::VolumeNotFound(_) | Self::SnapshotNotFound(_) | Self::NotFound(_) => {
                Code::NotFound
            }
            Self::VolumeAlreadyExists(_) | Self::SnapshotAlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Aborted(_) => Code::Aborted,
            Self::ResourceExhausted(_) => Code::ResourceExhausted,
            Self::Unavailable(_) | Self::TransportError(_) => Code::Unavailable,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::Cancelled(_) => Code::Cancelled,
            Self::BadPassphrase(_) => Code::Unauthenticated,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::FilesystemMismatch { .. }
            | Self::EncryptionFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => Code::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::FilesystemMismatch {
            device: "/dev/xvdb".into(),
            existing: "ext4".into(),
            requested: "xfs".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), Code::Internal);
    }

    #[test]
    fn codes_keep_credentials_apart_from_storage() {
        assert_eq!(
            CsiError::BadPassphrase("/dev/xvdc".into()).code(),
            Code::Unauthenticated
        );
        assert_eq!(
            CsiError::EncryptionFailed {
                device: "/dev/xvdc".into(),
                reason: "corrupt header".into(),
            }
            .code(),
            Code::Internal
        );
        assert_eq!(
            CsiError::MountFailed {
                path: "/stage".into(),
                reason: "EIO".into(),
            }
            .code(),
            Code::Internal
        );
    }

    #[test]
    fn contention_and_conflicts() {
        assert_eq!(CsiError::Aborted("busy".into()).code(), Code::Aborted);
        assert_eq!(
            CsiError::VolumeAlreadyExists("pvc-1".into()).code(),
            Code::AlreadyExists
        );
        assert_eq!(
            CsiError::FailedPrecondition("attached".into()).code(),
            Code::FailedPrecondition
        );
    }
}
