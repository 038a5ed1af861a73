//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes an attached block
//! device usable by workloads:
//!
//! 1. **Stage**: open the LUKS mapping if encrypted, format if blank, mount
//!    at the per-volume staging path.
//! 2. **Publish**: bind-mount the staging path at the workload's target.
//! 3. **Unpublish**: remove the bind mount.
//! 4. **Unstage**: unmount the staging path and close the LUKS mapping.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeInfo,
    NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service: local format / mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its staging path.
    ///
    /// Idempotent; calling it again for an already-staged volume
    /// succeeds without reformatting or remounting.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.
    ///
    /// Idempotent; calling it on an already-unstaged volume
    /// succeeds without error.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path at the target.
    ///
    /// Idempotent; calling it again for the same `target_path`
    /// succeeds without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount and remove the target path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Grow the filesystem to the (already expanded) device size.
    async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError>;

    /// Report usage of a published or staged volume path.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Advertise the node RPCs implemented.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
