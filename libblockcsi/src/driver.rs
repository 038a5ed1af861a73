//! Plugin entry point: identity service plus request routing.
//!
//! A [`Driver`] always serves the identity RPCs and holds the controller
//! and/or node service depending on its [`Mode`].  Requests for a service
//! that is not registered answer `Unimplemented`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{DRIVER_NAME, DRIVER_VERSION};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::{CsiMessage, CsiRequest, ServiceGroup};
use crate::node::CsiNode;
use crate::types::{PluginCapability, PluginInfo};

/// Which services the process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    Controller,
    Node,
    #[default]
    All,
}

impl Mode {
    pub fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn runs_node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            "all" => Ok(Self::All),
            other => Err(format!("unknown mode {other:?}, expected controller, node or all")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Controller => "controller",
            Self::Node => "node",
            Self::All => "all",
        })
    }
}

pub struct Driver {
    name: String,
    version: String,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    pub fn new() -> Self {
        Self {
            name: DRIVER_NAME.to_owned(),
            version: DRIVER_VERSION.to_owned(),
            controller: None,
            node: None,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn CsiController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn CsiNode>) -> Self {
        self.node = Some(node);
        self
    }

    fn controller(&self) -> Result<&dyn CsiController, CsiError> {
        self.controller
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented("controller service is not running".into()))
    }

    fn node(&self) -> Result<&dyn CsiNode, CsiError> {
        self.node
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented("node service is not running".into()))
    }

    /// Serve one request frame, enforcing its deadline.
    pub async fn handle(&self, request: CsiRequest) -> CsiMessage {
        let label = request.message.to_string();
        match request.timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.dispatch(request.message)).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(request = %label, ?limit, "request deadline exceeded");
                    CsiMessage::Error(CsiError::DeadlineExceeded(format!(
                        "{label} did not finish within {limit:?}"
                    )))
                }
            },
            None => self.dispatch(request.message).await,
        }
    }

    /// Route a request to its service and wrap the outcome in a response.
    pub async fn dispatch(&self, request: CsiMessage) -> CsiMessage {
        debug!(%request, "dispatching");
        let result = match request.group() {
            Some(ServiceGroup::Identity) => self.identity(request).await,
            Some(ServiceGroup::Controller) => match self.controller() {
                Ok(c) => dispatch_controller(c, request).await,
                Err(e) => Err(e),
            },
            Some(ServiceGroup::Node) => match self.node() {
                Ok(n) => dispatch_node(n, request).await,
                Err(e) => Err(e),
            },
            None => {
                warn!(msg = %request, "response variant received as request");
                Err(CsiError::InvalidArgument(format!("unexpected message: {request}")))
            }
        };
        result.unwrap_or_else(CsiMessage::Error)
    }

    async fn identity(&self, request: CsiMessage) -> Result<CsiMessage, CsiError> {
        Ok(match request {
            CsiMessage::Probe => CsiMessage::ProbeResult(self.probe().await?),
            CsiMessage::GetPluginInfo => CsiMessage::PluginInfoResponse(self.get_plugin_info().await?),
            CsiMessage::GetPluginCapabilities => {
                CsiMessage::PluginCapabilitiesResponse(self.get_plugin_capabilities().await?)
            }
            other => return Err(CsiError::Internal(format!("{other} is not an identity call"))),
        })
    }
}

async fn dispatch_controller(
    c: &dyn CsiController,
    request: CsiMessage,
) -> Result<CsiMessage, CsiError> {
    Ok(match request {
        CsiMessage::CreateVolume(req) => CsiMessage::VolumeCreated(c.create_volume(req).await?),
        CsiMessage::DeleteVolume(id) => {
            c.delete_volume(&id).await?;
            CsiMessage::Ok
        }
        CsiMessage::ControllerPublishVolume(req) => {
            CsiMessage::Published(c.controller_publish_volume(req).await?)
        }
        CsiMessage::ControllerUnpublishVolume(req) => {
            c.controller_unpublish_volume(req).await?;
            CsiMessage::Ok
        }
        CsiMessage::ValidateVolumeCapabilities {
            volume_id,
            capabilities,
        } => CsiMessage::CapabilitiesValidated(
            c.validate_volume_capabilities(&volume_id, &capabilities).await?,
        ),
        CsiMessage::ControllerExpandVolume(req) => {
            CsiMessage::ControllerExpanded(c.controller_expand_volume(req).await?)
        }
        CsiMessage::CreateSnapshot(req) => CsiMessage::SnapshotCreated(c.create_snapshot(req).await?),
        CsiMessage::DeleteSnapshot(id) => {
            c.delete_snapshot(&id).await?;
            CsiMessage::Ok
        }
        CsiMessage::ListSnapshots(req) => CsiMessage::SnapshotList(c.list_snapshots(req).await?),
        CsiMessage::ControllerGetCapabilities => {
            CsiMessage::ControllerCapabilitiesResponse(c.get_capabilities().await?)
        }
        other => return Err(CsiError::Internal(format!("{other} is not a controller call"))),
    })
}

async fn dispatch_node(n: &dyn CsiNode, request: CsiMessage) -> Result<CsiMessage, CsiError> {
    Ok(match request {
        CsiMessage::StageVolume(req) => {
            n.stage_volume(req).await?;
            CsiMessage::Ok
        }
        CsiMessage::UnstageVolume {
            volume_id,
            staging_target_path,
        } => {
            n.unstage_volume(&volume_id, &staging_target_path).await?;
            CsiMessage::Ok
        }
        CsiMessage::PublishVolume(req) => {
            n.publish_volume(req).await?;
            CsiMessage::Ok
        }
        CsiMessage::UnpublishVolume {
            volume_id,
            target_path,
        } => {
            n.unpublish_volume(&volume_id, &target_path).await?;
            CsiMessage::Ok
        }
        CsiMessage::NodeExpandVolume(req) => CsiMessage::NodeExpanded(n.expand_volume(req).await?),
        CsiMessage::NodeGetVolumeStats {
            volume_id,
            volume_path,
        } => CsiMessage::VolumeStatsResponse(n.get_volume_stats(&volume_id, &volume_path).await?),
        CsiMessage::NodeGetCapabilities => CsiMessage::NodeCapabilitiesResponse(n.get_capabilities().await?),
        CsiMessage::GetNodeInfo => CsiMessage::NodeInfoResponse(n.get_info().await?),
        other => return Err(CsiError::Internal(format!("{other} is not a node call"))),
    })
}

#[async_trait]
impl CsiIdentity for Driver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let mut caps = Vec::with_capacity(3);
        if self.controller.is_some() {
            caps.push(PluginCapability::ControllerService);
        }
        caps.push(PluginCapability::VolumeAccessibilityConstraints);
        caps.push(PluginCapability::OfflineVolumeExpansion);
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeMetadata, NodeOptions};
    use crate::error::Code;
    use crate::mounter::{FakeMounter, Mounter};
    use crate::service::NodeService;
    use crate::types::VolumeId;
    use std::time::Duration;

    struct SlowNode;

    #[async_trait]
    impl CsiNode for SlowNode {
        async fn stage_volume(&self, _: crate::types::NodeStageVolumeRequest) -> Result<(), CsiError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        async fn unstage_volume(&self, _: &VolumeId, _: &str) -> Result<(), CsiError> {
            Ok(())
        }
        async fn publish_volume(&self, _: crate::types::NodePublishVolumeRequest) -> Result<(), CsiError> {
            Ok(())
        }
        async fn unpublish_volume(&self, _: &VolumeId, _: &str) -> Result<(), CsiError> {
            Ok(())
        }
        async fn expand_volume(
            &self,
            _: crate::types::NodeExpandVolumeRequest,
        ) -> Result<crate::types::NodeExpandVolumeResponse, CsiError> {
            Ok(crate::types::NodeExpandVolumeResponse { capacity_bytes: 0 })
        }
        async fn get_volume_stats(&self, _: &VolumeId, _: &str) -> Result<crate::types::VolumeStats, CsiError> {
            Ok(crate::types::VolumeStats::default())
        }
        async fn get_capabilities(&self) -> Result<Vec<crate::types::NodeCapability>, CsiError> {
            Ok(Vec::new())
        }
        async fn get_info(&self) -> Result<crate::types::NodeInfo, CsiError> {
            Err(CsiError::Internal("unused".into()))
        }
    }

    fn node_driver() -> Driver {
        let node = NodeService::new(
            Arc::new(FakeMounter::new()) as Arc<dyn Mounter>,
            NodeMetadata {
                instance_id: "i-1".into(),
                region: "eu-west-2".into(),
                zone: "eu-west-2a".into(),
            },
            NodeOptions {
                luks_open_flags: Vec::new(),
                max_volumes: 39,
            },
        );
        Driver::new().with_node(Arc::new(node))
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("Controller".parse::<Mode>().unwrap(), Mode::Controller);
        assert_eq!("node".parse::<Mode>().unwrap(), Mode::Node);
        assert_eq!(Mode::default(), Mode::All);
        assert!("both".parse::<Mode>().is_err());
        assert!(Mode::All.runs_controller() && Mode::All.runs_node());
        assert!(!Mode::Node.runs_controller());
        assert_eq!(Mode::Controller.to_string(), "controller");
    }

    #[tokio::test]
    async fn node_only_driver_refuses_controller_calls() {
        let driver = node_driver();
        let resp = driver
            .dispatch(CsiMessage::DeleteVolume(VolumeId::from("vol-1")))
            .await;
        match resp.into_result() {
            Err(e) => assert_eq!(e.code(), Code::Unimplemented),
            Ok(other) => panic!("unexpected response {other}"),
        }

        let caps = driver.get_plugin_capabilities().await.unwrap();
        assert!(!caps.contains(&PluginCapability::ControllerService));

        let info = driver.dispatch(CsiMessage::GetNodeInfo).await;
        assert!(matches!(info, CsiMessage::NodeInfoResponse(ref i) if i.node_id == "i-1"));
    }

    #[tokio::test]
    async fn identity_is_always_served() {
        let driver = Driver::new();
        assert!(matches!(driver.dispatch(CsiMessage::Probe).await, CsiMessage::ProbeResult(true)));
        match driver.dispatch(CsiMessage::GetPluginInfo).await {
            CsiMessage::PluginInfoResponse(info) => assert_eq!(info.name, DRIVER_NAME),
            other => panic!("unexpected response {other}"),
        }
        let resp = driver.dispatch(CsiMessage::GetNodeInfo).await;
        assert!(matches!(resp, CsiMessage::Error(ref e) if e.code() == Code::Unimplemented));
    }

    #[tokio::test]
    async fn responses_are_not_requests() {
        let resp = Driver::new().dispatch(CsiMessage::Ok).await;
        assert!(matches!(resp, CsiMessage::Error(ref e) if e.code() == Code::InvalidArgument));
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let driver = Driver::new().with_node(Arc::new(SlowNode));
        let req = CsiRequest::with_timeout(
            CsiMessage::StageVolume(crate::types::NodeStageVolumeRequest {
                volume_id: VolumeId::from("vol-1"),
                publish_context: Default::default(),
                staging_target_path: "/stage".into(),
                volume_capability: Default::default(),
                secrets: Default::default(),
                volume_context: Default::default(),
            }),
            Duration::from_millis(50),
        );
        let resp = driver.handle(req).await;
        assert!(matches!(resp, CsiMessage::Error(ref e) if e.code() == Code::DeadlineExceeded));
    }
}
