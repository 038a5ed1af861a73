//! Core CSI types: volumes, snapshots, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, the socket
//! transport, and the controller/node services.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be framed as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Topology segment key the driver publishes for a node's zone.
pub const TOPOLOGY_ZONE_KEY: &str = "topology.bsu.csi.outscale.com/zone";
/// Well-known orchestrator zone label, accepted on input.
pub const WELL_KNOWN_ZONE_KEY: &str = "topology.kubernetes.io/zone";

/// Publish-context key holding the device path chosen at attach time.
pub const PUBLISH_CONTEXT_DEVICE_PATH: &str = "devicePath";
/// Secret key holding the LUKS passphrase.
pub const SECRET_LUKS_PASSPHRASE: &str = "luksPassphrase";

/// Volume-context keys describing at-rest encryption.
pub const CONTEXT_ENCRYPTED: &str = "encrypted";
pub const CONTEXT_LUKS_CIPHER: &str = "luks-cipher";
pub const CONTEXT_LUKS_HASH: &str = "luks-hash";
pub const CONTEXT_LUKS_KEY_SIZE: &str = "luks-key-size";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque, unique identifier for a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
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
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

impl AccessMode {
    /// Modes a block volume can honour.  A disk links to one VM at a time,
    /// so only single-node access is served.
    pub fn is_supported(self) -> bool {
        matches!(self, Self::ReadWriteOnce)
    }
}

/// How the volume is consumed on the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Formatted and mounted as a filesystem.
    Mount {
        /// Requested filesystem; empty means "node default or whatever is
        /// already on the device".
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// Exposed as a raw block device.
    Block,
}

impl Default for AccessType {
    fn default() -> Self {
        Self::Mount {
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Filesystem or raw block access.
    #[serde(default)]
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// Filesystem capability with the given type and no extra flags.
    pub fn mount(fs_type: &str) -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount {
                fs_type: fs_type.to_owned(),
                mount_flags: Vec::new(),
            },
        }
    }

    /// Raw block capability.
    pub fn block() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Block,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::default(),
        }
    }
}

/// Requested size bounds.  Zero means "unset".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: u64,
    #[serde(default)]
    pub limit_bytes: u64,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.kubernetes.io/zone": "eu-west-2a"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl Topology {
    /// Single-segment topology for a zone under the driver key.
    pub fn zone(zone: &str) -> Self {
        Self {
            segments: HashMap::from([(TOPOLOGY_ZONE_KEY.to_owned(), zone.to_owned())]),
        }
    }

    /// Zone named by this topology, under either accepted key.
    pub fn zone_segment(&self) -> Option<&str> {
        self.segments
            .get(TOPOLOGY_ZONE_KEY)
            .or_else(|| self.segments.get(WELL_KNOWN_ZONE_KEY))
            .map(String::as_str)
    }
}

/// Placement hints supplied with `CreateVolume`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyRequirement {
    #[serde(default)]
    pub requisite: Vec<Topology>,
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

// ---------------------------------------------------------------------------
// Volume & snapshot metadata
// ---------------------------------------------------------------------------

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Snapshot the volume was restored from, if any.
    #[serde(default)]
    pub source_snapshot_id: Option<SnapshotId>,
    /// Topology constraints (the zone holding the volume).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Point-in-time copy of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub source_volume_id: VolumeId,
    pub size_bytes: u64,
    /// Creation time in unix seconds.
    pub creation_time: i64,
    /// Set once the provider reports the snapshot completed.
    pub ready_to_use: bool,
}

// ---------------------------------------------------------------------------
// Controller requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-chosen name, the idempotency key.
    pub name: String,
    /// Desired capacity bounds.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Placement hints.
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
    /// Restore from this snapshot.
    #[serde(default)]
    pub source_snapshot_id: Option<SnapshotId>,
}

/// Request to attach a volume to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to detach a volume from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
}

/// Request to grow a volume on the provider side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: VolumeId,
    pub capacity_range: CapacityRange,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
    /// The node must additionally grow the filesystem.
    pub node_expansion_required: bool,
}

/// Outcome of `ValidateVolumeCapabilities`: `confirmed` is `None` when any
/// requested capability is unsupported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    #[serde(default)]
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub message: String,
}

/// Request to snapshot a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: VolumeId,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Paged snapshot listing.  `max_entries == 0` means "provider default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub source_volume_id: Option<VolumeId>,
    #[serde(default)]
    pub max_entries: u32,
    #[serde(default)]
    pub starting_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<Snapshot>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// RPCs the controller service implements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    CreateDeleteSnapshot,
    ListSnapshots,
    ExpandVolume,
}

// ---------------------------------------------------------------------------
// Node requests & responses
// ---------------------------------------------------------------------------

/// Secret material handed over by the orchestrator.  `Debug` never prints
/// the values.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secrets(pub HashMap<String, String>);

impl Secrets {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Secrets {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

/// Request to stage (format and mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Context returned by `ControllerPublishVolume`.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// Per-node staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Holds the LUKS passphrase for encrypted volumes.
    #[serde(default)]
    pub secrets: Secrets,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// The staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Target path visible to the workload.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to grow the filesystem after a controller-side expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    pub volume_path: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub unit: UsageUnit,
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

/// Usage reported by `NodeGetVolumeStats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
}

/// RPCs the node service implements beyond publish/unpublish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
    GetVolumeStats,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"bsu.csi.outscale.com"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
    /// Volumes can be expanded while detached.
    OfflineVolumeExpansion,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier (the provider's VM id).
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
