//! Cloud block-storage client.
//!
//! Two layers:
//!
//! | Layer | Item | Role |
//! |---|---|---|
//! | raw | [`ProviderApi`] | One method per provider verb, no retries. |
//! | raw | [`OscApi`] | HTTP implementation with request signing. |
//! | raw | [`FakeProvider`] | In-memory provider for tests. |
//! | high | [`Cloud`] | Disk / snapshot operations the controller needs. |
//! | high | [`BsuCloud`] | [`Cloud`] over any [`ProviderApi`], with backoff, device-name allocation and completion polling. |

pub mod api;
pub mod bsu;
pub mod devices;
pub mod fake;
pub mod osc;
mod sign;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::CsiError;

pub use api::ProviderApi;
pub use bsu::BsuCloud;
pub use fake::FakeProvider;
pub use osc::{OscApi, OscCredentials};

/// Tag holding the CSI volume name.
pub const TAG_VOLUME_NAME: &str = "CSIVolumeName";
/// Tag holding the creation idempotency token.
pub const TAG_VOLUME_TOKEN: &str = "CSIVolumeToken";
/// Tag holding the CSI snapshot name.
pub const TAG_SNAPSHOT_NAME: &str = "CSIVolumeSnapshotName";
/// Tag holding the snapshot idempotency token.
pub const TAG_SNAPSHOT_TOKEN: &str = "CSISnapshotToken";

/// Provider error codes meaning "another operation is still running".
const IN_PROGRESS_CODES: &[&str] = &["OperationInProgress", "ResourceBusy", "ConcurrentModification"];
/// Provider error codes meaning "the resource is attached / in use".
const IN_USE_CODES: &[&str] = &["VolumeInUse", "IncorrectState"];

#[derive(Debug, Error, Clone)]
pub enum CloudError {
    #[error("{0} not found")]
    NotFound(String),

    /// Non-success HTTP answer from the provider.
    #[error("provider returned {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Connection, TLS or timeout failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// A polled resource never reached its terminal state.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The provider reports the resource in a failed terminal state.
    #[error("{0}")]
    Failed(String),

    #[error("multiple disks share the name {0}")]
    MultipleDisks(String),

    #[error("no free device name left on {0}")]
    NoDeviceName(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CloudError {
    pub fn api(status: u16, code: &str, message: &str) -> Self {
        Self::Api {
            status,
            code: code.to_owned(),
            message: message.to_owned(),
        }
    }

    /// Throttling, 5xx, network failures and in-progress conflicts are worth
    /// retrying.  Everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, code, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
                    || (*status == 409 && IN_PROGRESS_CODES.contains(&code.as_str()))
            }
            _ => false,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Api { status: 429, .. })
            || matches!(self, Self::Api { code, .. } if code == "RequestLimitExceeded")
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::Api { code, .. } if IN_USE_CODES.contains(&code.as_str()))
    }
}

impl From<CloudError> for CsiError {
    fn from(e: CloudError) -> Self {
        let msg = e.to_string();
        match e {
            CloudError::NotFound(_) => CsiError::NotFound(msg),
            _ if e.is_throttled() => CsiError::ResourceExhausted(msg),
            _ if e.is_in_use() => CsiError::FailedPrecondition(msg),
            _ if e.is_transient() => CsiError::Unavailable(msg),
            CloudError::Api { status: 400, .. } => CsiError::InvalidArgument(msg),
            CloudError::Timeout(_) => CsiError::DeadlineExceeded(msg),
            CloudError::Failed(_) => CsiError::ResourceExhausted(msg),
            CloudError::NoDeviceName(_) => CsiError::ResourceExhausted(msg),
            _ => CsiError::BackendError(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Provider volume states the driver acts on.
pub mod state {
    pub const CREATING: &str = "creating";
    pub const AVAILABLE: &str = "available";
    pub const IN_USE: &str = "in-use";
    pub const ERROR: &str = "error";

    pub const ATTACHING: &str = "attaching";
    pub const ATTACHED: &str = "attached";
    pub const DETACHING: &str = "detaching";
    pub const DETACHED: &str = "detached";

    pub const SNAPSHOT_COMPLETED: &str = "completed";
}

/// A link between a disk and a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLink {
    pub vm_id: String,
    pub device_name: String,
    pub state: String,
}

impl DiskLink {
    /// Still counts as an attachment (attaching, attached or detaching).
    pub fn is_active(&self) -> bool {
        self.state != state::DETACHED
    }
}

/// Cloud block volume as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub volume_id: String,
    pub capacity_gib: u64,
    pub availability_zone: String,
    pub volume_type: String,
    pub iops: Option<u32>,
    pub state: String,
    pub snapshot_id: Option<String>,
    pub tags: HashMap<String, String>,
    pub links: Vec<DiskLink>,
}

impl Disk {
    pub fn link_to(&self, vm_id: &str) -> Option<&DiskLink> {
        self.links
            .iter()
            .find(|l| l.vm_id == vm_id && l.is_active())
    }

    pub fn active_links(&self) -> impl Iterator<Item = &DiskLink> {
        self.links.iter().filter(|l| l.is_active())
    }
}

/// Parameters for a new disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiskOptions {
    pub capacity_gib: u64,
    pub volume_type: String,
    /// Per-GiB IOPS, only meaningful for `io1`.
    pub iops_per_gb: Option<u32>,
    pub availability_zone: Option<String>,
    pub snapshot_id: Option<String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSnapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_gib: u64,
    pub creation_time: i64,
    pub state: String,
    pub tags: HashMap<String, String>,
}

impl CloudSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == state::SNAPSHOT_COMPLETED
    }

    pub fn is_failed(&self) -> bool {
        self.state == state::ERROR
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotPage {
    pub snapshots: Vec<CloudSnapshot>,
    pub next_token: Option<String>,
}

/// High-level provider operations used by the controller service.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Create a disk and wait until it is available.
    async fn create_disk(&self, opts: &DiskOptions) -> Result<Disk, CloudError>;

    /// Delete a disk.  Returns `false` when it was already gone.
    async fn delete_disk(&self, volume_id: &str) -> Result<bool, CloudError>;

    /// Fetch a disk by id; [`CloudError::NotFound`] when absent.
    async fn get_disk(&self, volume_id: &str) -> Result<Disk, CloudError>;

    /// Find the disk carrying `CSIVolumeName=name`.
    async fn get_disk_by_name(&self, name: &str) -> Result<Option<Disk>, CloudError>;

    async fn instance_exists(&self, vm_id: &str) -> Result<bool, CloudError>;

    /// Attach a disk and wait for the link to be realised.  Returns the
    /// device path.
    async fn attach_disk(&self, volume_id: &str, vm_id: &str) -> Result<String, CloudError>;

    /// Detach a disk and wait until the link is gone.
    async fn detach_disk(&self, volume_id: &str, vm_id: &str) -> Result<(), CloudError>;

    /// Grow a disk to at least `new_gib` and return the confirmed size.
    async fn resize_disk(&self, volume_id: &str, new_gib: u64) -> Result<u64, CloudError>;

    async fn create_snapshot(
        &self,
        source_volume_id: &str,
        tags: &HashMap<String, String>,
    ) -> Result<CloudSnapshot, CloudError>;

    /// Delete a snapshot.  Returns `false` when it was already gone.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool, CloudError>;

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<CloudSnapshot, CloudError>;

    /// Find the snapshot carrying `CSIVolumeSnapshotName=name`.
    async fn get_snapshot_by_name(&self, name: &str) -> Result<Option<CloudSnapshot>, CloudError>;

    async fn list_snapshots(
        &self,
        source_volume_id: Option<&str>,
        max_results: Option<u32>,
        next_token: Option<&str>,
    ) -> Result<SnapshotPage, CloudError>;
}
