//! CSI protocol messages carried over the plugin socket.
//!
//! [`CsiMessage`] is the envelope for every request and response variant.
//! A client wraps a request variant in a [`CsiRequest`] (optionally with a
//! deadline) and the server replies with the matching response variant or
//! [`CsiMessage::Error`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// A request frame: one [`CsiMessage`] plus an optional deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsiRequest {
    /// Milliseconds the server may spend on the call before answering
    /// `DeadlineExceeded`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub message: CsiMessage,
}

impl CsiRequest {
    pub fn new(message: CsiMessage) -> Self {
        Self {
            timeout_ms: None,
            message,
        }
    }

    pub fn with_timeout(message: CsiMessage, timeout: Duration) -> Self {
        Self {
            timeout_ms: Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            message,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// RPC group a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceGroup {
    Identity,
    Controller,
    Node,
}

/// Top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests -----------------------------------------------
    /// Health probe.
    Probe,
    /// Query plugin info.
    GetPluginInfo,
    /// Query plugin capabilities.
    GetPluginCapabilities,

    // ----- Controller requests ---------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    ControllerExpandVolume(ControllerExpandVolumeRequest),
    CreateSnapshot(CreateSnapshotRequest),
    DeleteSnapshot(SnapshotId),
    ListSnapshots(ListSnapshotsRequest),
    ControllerGetCapabilities,

    // ----- Node requests ---------------------------------------------------
    /// Format (if needed) and mount a volume at its staging path.
    StageVolume(NodeStageVolumeRequest),
    /// Unmount the staging path and close any encrypted mapping.
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Bind-mount a staged volume at a target path.
    PublishVolume(NodePublishVolumeRequest),
    /// Remove a bind mount.
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeExpandVolume(NodeExpandVolumeRequest),
    NodeGetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeGetCapabilities,
    /// Query node info.
    GetNodeInfo,

    // ----- Responses -------------------------------------------------------
    VolumeCreated(Volume),
    /// Publish context returned by `ControllerPublishVolume`.
    Published(HashMap<String, String>),
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    ControllerExpanded(ControllerExpandVolumeResponse),
    SnapshotCreated(Snapshot),
    SnapshotList(ListSnapshotsResponse),
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    NodeExpanded(NodeExpandVolumeResponse),
    VolumeStatsResponse(VolumeStats),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// Group of a request variant; `None` for responses.
    pub fn group(&self) -> Option<ServiceGroup> {
        match self {
            Self::Probe | Self::GetPluginInfo | Self::GetPluginCapabilities => {
                Some(ServiceGroup::Identity)
            }
            Self::CreateVolume(_)
            | Self::DeleteVolume(_)
            | Self::ControllerPublishVolume(_)
            | Self::ControllerUnpublishVolume(_)
            | Self::ValidateVolumeCapabilities { .. }
            | Self::ControllerExpandVolume(_)
            | Self::CreateSnapshot(_)
            | Self::DeleteSnapshot(_)
            | Self::ListSnapshots(_)
            | Self::ControllerGetCapabilities => Some(ServiceGroup::Controller),
            Self::StageVolume(_)
            | Self::UnstageVolume { .. }
            | Self::PublishVolume(_)
            | Self::UnpublishVolume { .. }
            | Self::NodeExpandVolume(_)
            | Self::NodeGetVolumeStats { .. }
            | Self::NodeGetCapabilities
            | Self::GetNodeInfo => Some(ServiceGroup::Node),
            _ => None,
        }
    }

    /// Turn an error response back into a `Result`.
    pub fn into_result(self) -> Result<Self, CsiError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({})", id),
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume(req) => write!(
                f,
                "ControllerUnpublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({})", volume_id)
            }
            Self::ControllerExpandVolume(req) => {
                write!(f, "ControllerExpandVolume({})", req.volume_id)
            }
            Self::CreateSnapshot(req) => write!(f, "CreateSnapshot(name={})", req.name),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({})", id),
            Self::ListSnapshots(_) => f.write_str("ListSnapshots"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::NodeExpandVolume(req) => write!(f, "NodeExpandVolume({})", req.volume_id),
            Self::NodeGetVolumeStats { volume_id, .. } => {
                write!(f, "NodeGetVolumeStats({})", volume_id)
            }
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::Published(ctx) => write!(f, "Published(keys={})", ctx.len()),
            Self::CapabilitiesValidated(r) => {
                write!(f, "CapabilitiesValidated({})", r.confirmed.is_some())
            }
            Self::ControllerExpanded(r) => write!(f, "ControllerExpanded({})", r.capacity_bytes),
            Self::SnapshotCreated(s) => write!(f, "SnapshotCreated({})", s.snapshot_id),
            Self::SnapshotList(r) => write!(f, "SnapshotList(count={})", r.entries.len()),
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeExpanded(r) => write!(f, "NodeExpanded({})", r.capacity_bytes),
            Self::VolumeStatsResponse(s) => write!(f, "VolumeStats(count={})", s.usage.len()),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_serde() {
        let req = CsiRequest::with_timeout(
            CsiMessage::DeleteVolume(VolumeId("vol-1".into())),
            Duration::from_secs(3),
        );
        let json = serde_json::to_string(&req).expect("serialize");
        let de: CsiRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.timeout(), Some(Duration::from_secs(3)));
        assert!(matches!(de.message, CsiMessage::DeleteVolume(ref id) if id.0 == "vol-1"));
    }

    #[test]
    fn error_message_keeps_variant() {
        let msg = CsiMessage::Error(CsiError::Aborted("vol-1 busy".into()));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de.into_result(), Err(CsiError::Aborted(_))));
    }

    #[test]
    fn groups() {
        assert_eq!(CsiMessage::Probe.group(), Some(ServiceGroup::Identity));
        assert_eq!(
            CsiMessage::DeleteSnapshot(SnapshotId("snap-1".into())).group(),
            Some(ServiceGroup::Controller)
        );
        assert_eq!(CsiMessage::GetNodeInfo.group(), Some(ServiceGroup::Node));
        assert_eq!(CsiMessage::Ok.group(), None);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        let msg = CsiMessage::UnstageVolume {
            volume_id: VolumeId("vol-9".into()),
            staging_target_path: "/stage".into(),
        };
        assert_eq!(msg.to_string(), "UnstageVolume(vol-9)");
    }
}
