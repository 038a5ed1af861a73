//! CSI Controller service trait.
//!
//! The Controller service manages the cloud-side volume lifecycle: creation,
//! deletion, attachment to nodes, expansion, and snapshots.  It owns no local
//! OS state.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, CreateSnapshotRequest,
    CreateVolumeRequest, ListSnapshotsRequest, ListSnapshotsResponse, Snapshot, SnapshotId,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability, VolumeId,
};

/// Controller service: cloud volume and snapshot management.
///
/// Every mutating call is idempotent: repeating a call that already took
/// effect succeeds without touching the provider again.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the one already created under the
    /// same name with the same parameters.
    ///
    /// The returned [`Volume`] carries the `volume_context` that must be
    /// forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  An absent volume is success; an attached one is a
    /// failed precondition.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node and return the publish context (device
    /// path).
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError>;

    /// Detach a volume from a node.  Already detached is success.
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// Grow a volume on the provider side.  Never shrinks.
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError>;

    /// Snapshot a volume, idempotent by name.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot.  An absent snapshot is success.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    /// List snapshots, optionally filtered by id or source volume.
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError>;

    /// Advertise the controller RPCs implemented.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
