//! Controller service over a [`Cloud`].
//!
//! Every mutating RPC holds an [`InFlight`] guard on the resource it targets
//! for its whole duration.  Creation is made idempotent by tagging each disk
//! with its CSI name and a token derived from the request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::require;
use crate::cloud::bsu::{VOLUME_TYPE_GP2, VOLUME_TYPE_IO1, VOLUME_TYPE_STANDARD};
use crate::cloud::{
    state, Cloud, CloudError, CloudSnapshot, Disk, DiskOptions, TAG_SNAPSHOT_NAME,
    TAG_SNAPSHOT_TOKEN, TAG_VOLUME_NAME, TAG_VOLUME_TOKEN,
};
use crate::config::ControllerOptions;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::inflight::InFlight;
use crate::types::{
    ControllerCapability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, CreateSnapshotRequest,
    CreateVolumeRequest, ListSnapshotsRequest, ListSnapshotsResponse, Snapshot, SnapshotId,
    Topology, TopologyRequirement, ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability,
    VolumeId, CONTEXT_ENCRYPTED, CONTEXT_LUKS_CIPHER, CONTEXT_LUKS_HASH, CONTEXT_LUKS_KEY_SIZE,
    PUBLISH_CONTEXT_DEVICE_PATH,
};
use crate::util::{capacity_gib, snapshot_token, validate_extra_tags, volume_token, GIB};

const PARAM_TYPE: &str = "type";
const PARAM_IOPS_PER_GB: &str = "iopspergb";
const PARAM_ENCRYPTED: &str = "encrypted";
const PARAM_LUKS_CIPHER: &str = "luks-cipher";
const PARAM_LUKS_HASH: &str = "luks-hash";
const PARAM_LUKS_KEY_SIZE: &str = "luks-key-size";
const PARAM_FS_TYPE: &str = "fstype";
/// Keys the orchestrator adds on its own (PVC name, namespace, ...).
const ORCHESTRATOR_PARAM_PREFIX: &str = "csi.storage.k8s.io/";

/// `ListSnapshots` page sizes the provider refuses.
const MIN_LIST_ENTRIES: u32 = 5;

/// Creation parameters after validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VolumeParams {
    volume_type: String,
    iops_per_gb: Option<u32>,
    encrypted: bool,
    luks_cipher: Option<String>,
    luks_hash: Option<String>,
    luks_key_size: Option<String>,
}

impl VolumeParams {
    fn parse(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let mut out = Self {
            volume_type: VOLUME_TYPE_GP2.to_owned(),
            ..Default::default()
        };
        for (key, value) in params {
            let lower = key.to_ascii_lowercase();
            match lower.as_str() {
                PARAM_TYPE => {
                    let t = value.to_ascii_lowercase();
                    if ![VOLUME_TYPE_STANDARD, VOLUME_TYPE_GP2, VOLUME_TYPE_IO1].contains(&t.as_str()) {
                        return Err(CsiError::InvalidArgument(format!("unsupported volume type {value:?}")));
                    }
                    out.volume_type = t;
                }
                PARAM_IOPS_PER_GB => {
                    let iops = value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| CsiError::InvalidArgument(format!("invalid iopsPerGB {value:?}")))?;
                    out.iops_per_gb = Some(iops);
                }
                PARAM_ENCRYPTED => {
                    out.encrypted = value
                        .trim()
                        .to_ascii_lowercase()
                        .parse::<bool>()
                        .map_err(|_| CsiError::InvalidArgument(format!("invalid encrypted flag {value:?}")))?;
                }
                PARAM_LUKS_CIPHER => out.luks_cipher = Some(value.clone()),
                PARAM_LUKS_HASH => out.luks_hash = Some(value.clone()),
                PARAM_LUKS_KEY_SIZE => out.luks_key_size = Some(value.clone()),
                PARAM_FS_TYPE => {
                    warn!(fs_type = %value, "the fstype parameter is deprecated, use the volume capability instead");
                }
                k if k.starts_with(ORCHESTRATOR_PARAM_PREFIX) => {}
                _ => {
                    return Err(CsiError::InvalidArgument(format!("unknown parameter {key:?}")));
                }
            }
        }
        if out.volume_type == VOLUME_TYPE_IO1 && out.iops_per_gb.is_none() {
            return Err(CsiError::InvalidArgument(
                "iopsPerGB is required for io1 volumes".into(),
            ));
        }
        Ok(out)
    }

    /// Context handed to the node so it can open the encrypted device.
    fn volume_context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        if !self.encrypted {
            return ctx;
        }
        ctx.insert(CONTEXT_ENCRYPTED.to_owned(), "true".to_owned());
        for (key, value) in [
            (CONTEXT_LUKS_CIPHER, &self.luks_cipher),
            (CONTEXT_LUKS_HASH, &self.luks_hash),
            (CONTEXT_LUKS_KEY_SIZE, &self.luks_key_size),
        ] {
            if let Some(v) = value {
                ctx.insert(key.to_owned(), v.clone());
            }
        }
        ctx
    }
}

fn check_capabilities(caps: &[VolumeCapability]) -> Result<(), CsiError> {
    if caps.is_empty() {
        return Err(CsiError::InvalidArgument("volume capabilities are required".into()));
    }
    match caps.iter().find(|c| !c.access_mode.is_supported()) {
        Some(c) => Err(CsiError::InvalidArgument(format!(
            "access mode {:?} is not supported",
            c.access_mode
        ))),
        None => Ok(()),
    }
}

/// Zone from the first preferred, then requisite, topology naming one.
fn pick_zone(req: Option<&TopologyRequirement>) -> Option<String> {
    let req = req?;
    req.preferred
        .iter()
        .chain(req.requisite.iter())
        .find_map(Topology::zone_segment)
        .map(str::to_owned)
}

fn to_volume(disk: &Disk, context: HashMap<String, String>) -> Volume {
    Volume {
        volume_id: VolumeId(disk.volume_id.clone()),
        capacity_bytes: disk.capacity_gib * GIB,
        volume_context: context,
        source_snapshot_id: disk.snapshot_id.as_deref().map(SnapshotId::from),
        accessible_topology: vec![Topology::zone(&disk.availability_zone)],
    }
}

fn to_snapshot(s: &CloudSnapshot) -> Snapshot {
    Snapshot {
        snapshot_id: SnapshotId(s.snapshot_id.clone()),
        source_volume_id: VolumeId(s.source_volume_id.clone()),
        size_bytes: s.size_gib * GIB,
        creation_time: s.creation_time,
        ready_to_use: s.is_ready(),
    }
}

fn volume_lookup(volume_id: &str) -> impl FnOnce(CloudError) -> CsiError + '_ {
    move |e| match e {
        CloudError::NotFound(_) => CsiError::VolumeNotFound(volume_id.to_owned()),
        other => other.into(),
    }
}

pub struct ControllerService {
    cloud: Arc<dyn Cloud>,
    inflight: InFlight,
    options: ControllerOptions,
}

impl ControllerService {
    /// Fails when the extra tags break the provider's tag rules.
    pub fn new(cloud: Arc<dyn Cloud>, options: ControllerOptions) -> Result<Self, CsiError> {
        validate_extra_tags(&options.extra_volume_tags)?;
        validate_extra_tags(&options.extra_snapshot_tags)?;
        Ok(Self {
            cloud,
            inflight: InFlight::new(),
            options,
        })
    }

    pub fn with_inflight(mut self, inflight: InFlight) -> Self {
        self.inflight = inflight;
        self
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }
}

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        require(&req.name, "volume name")?;
        check_capabilities(&req.volume_capabilities)?;
        let params = VolumeParams::parse(&req.parameters)?;
        let size_gib = capacity_gib(req.capacity_range.as_ref())?;

        let _guard = self.inflight.try_acquire(req.name.as_str())?;

        let source_snapshot = req.source_snapshot_id.as_ref().map(|s| s.0.as_str());
        let token = volume_token(&req.name, &req.parameters, size_gib, source_snapshot);

        if let Some(existing) = self.cloud.get_disk_by_name(&req.name).await? {
            let same = match existing.tags.get(TAG_VOLUME_TOKEN) {
                Some(t) => *t == token,
                None => {
                    existing.capacity_gib == size_gib
                        && existing.snapshot_id.as_deref() == source_snapshot
                }
            };
            if !same {
                return Err(CsiError::VolumeAlreadyExists(req.name));
            }
            debug!(volume_id = %existing.volume_id, "volume already exists");
            return Ok(to_volume(&existing, params.volume_context()));
        }

        if let Some(snapshot_id) = source_snapshot {
            self.cloud.get_snapshot(snapshot_id).await.map_err(|e| match e {
                CloudError::NotFound(_) => CsiError::SnapshotNotFound(snapshot_id.to_owned()),
                other => other.into(),
            })?;
        }

        let mut tags = self.options.extra_volume_tags.clone();
        tags.insert(TAG_VOLUME_NAME.to_owned(), req.name.clone());
        tags.insert(TAG_VOLUME_TOKEN.to_owned(), token);

        let disk = self
            .cloud
            .create_disk(&DiskOptions {
                capacity_gib: size_gib,
                volume_type: params.volume_type.clone(),
                iops_per_gb: params.iops_per_gb,
                availability_zone: pick_zone(req.accessibility_requirements.as_ref()),
                snapshot_id: source_snapshot.map(str::to_owned),
                tags,
            })
            .await?;

        info!(volume_id = %disk.volume_id, size_gib, zone = %disk.availability_zone, "volume created");
        Ok(to_volume(&disk, params.volume_context()))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        let _guard = self.inflight.try_acquire(volume_id.0.as_str())?;

        let disk = match self.cloud.get_disk(&volume_id.0).await {
            Ok(disk) => disk,
            Err(CloudError::NotFound(_)) => {
                debug!("volume already deleted");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(link) = disk.active_links().next() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still attached to {}",
                link.vm_id
            )));
        }

        if self.cloud.delete_disk(&volume_id.0).await? {
            info!("volume deleted");
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.node_id, "node id")?;
        check_capabilities(std::slice::from_ref(&req.volume_capability))?;
        let volume_id = req.volume_id.0.as_str();
        let _guard = self.inflight.try_acquire(volume_id)?;

        if !self.cloud.instance_exists(&req.node_id).await? {
            return Err(CsiError::NotFound(format!("instance {}", req.node_id)));
        }
        let disk = self
            .cloud
            .get_disk(volume_id)
            .await
            .map_err(volume_lookup(volume_id))?;

        let mut context = req.volume_context.clone();
        if let Some(link) = disk.link_to(&req.node_id) {
            if link.state == state::ATTACHED {
                debug!(device = %link.device_name, "already attached");
                context.insert(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), link.device_name.clone());
                return Ok(context);
            }
        }
        if let Some(other) = disk.active_links().find(|l| l.vm_id != req.node_id) {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is attached to {}",
                other.vm_id
            )));
        }

        let device = self.cloud.attach_disk(volume_id, &req.node_id).await?;
        info!(%device, "volume attached");
        context.insert(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), device);
        Ok(context)
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.node_id, "node id")?;
        let volume_id = req.volume_id.0.as_str();
        let _guard = self.inflight.try_acquire(volume_id)?;

        let disk = match self.cloud.get_disk(volume_id).await {
            Ok(disk) => disk,
            Err(CloudError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if disk.link_to(&req.node_id).is_none() {
            debug!("volume not attached to node");
            return Ok(());
        }

        self.cloud.detach_disk(volume_id, &req.node_id).await?;
        info!("volume detached");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        require(&volume_id.0, "volume id")?;
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument("volume capabilities are required".into()));
        }
        self.cloud
            .get_disk(&volume_id.0)
            .await
            .map_err(volume_lookup(&volume_id.0))?;

        Ok(match capabilities.iter().find(|c| !c.access_mode.is_supported()) {
            None => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(capabilities.to_vec()),
                message: String::new(),
            },
            Some(c) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: format!("access mode {:?} is not supported", c.access_mode),
            },
        })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        require(&req.volume_id.0, "volume id")?;
        let range = req.capacity_range;
        if range.required_bytes == 0 && range.limit_bytes == 0 {
            return Err(CsiError::InvalidArgument("capacity range is required".into()));
        }
        let size_gib = capacity_gib(Some(&range))?;
        let volume_id = req.volume_id.0.as_str();
        let _guard = self.inflight.try_acquire(volume_id)?;

        let disk = self
            .cloud
            .get_disk(volume_id)
            .await
            .map_err(volume_lookup(volume_id))?;
        if disk.state != state::AVAILABLE && disk.state != state::IN_USE {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is {}, cannot expand",
                disk.state
            )));
        }

        let new_gib = if size_gib <= disk.capacity_gib {
            debug!(current_gib = disk.capacity_gib, size_gib, "volume already large enough");
            disk.capacity_gib
        } else {
            let gib = self.cloud.resize_disk(volume_id, size_gib).await?;
            info!(size_gib = gib, "volume expanded");
            gib
        };

        let block = req.volume_capability.as_ref().is_some_and(VolumeCapability::is_block);
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: new_gib * GIB,
            node_expansion_required: !block,
        })
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        require(&req.name, "snapshot name")?;
        require(&req.source_volume_id.0, "source volume id")?;
        let source = req.source_volume_id.0.as_str();
        let _guard = self.inflight.try_acquire(req.name.as_str())?;

        if let Some(existing) = self.cloud.get_snapshot_by_name(&req.name).await? {
            if existing.source_volume_id != source {
                return Err(CsiError::SnapshotAlreadyExists(req.name));
            }
            if existing.is_failed() {
                return Err(CsiError::ResourceExhausted(format!(
                    "snapshot {} is in the error state",
                    existing.snapshot_id
                )));
            }
            debug!(snapshot_id = %existing.snapshot_id, "snapshot already exists");
            return Ok(to_snapshot(&existing));
        }

        self.cloud
            .get_disk(source)
            .await
            .map_err(volume_lookup(source))?;

        let mut tags = self.options.extra_snapshot_tags.clone();
        tags.insert(TAG_SNAPSHOT_NAME.to_owned(), req.name.clone());
        tags.insert(TAG_SNAPSHOT_TOKEN.to_owned(), snapshot_token(&req.name, source));

        let snapshot = self.cloud.create_snapshot(source, &tags).await?;
        if snapshot.is_failed() {
            return Err(CsiError::ResourceExhausted(format!(
                "snapshot {} is in the error state",
                snapshot.snapshot_id
            )));
        }
        info!(snapshot_id = %snapshot.snapshot_id, "snapshot created");
        Ok(to_snapshot(&snapshot))
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        require(&snapshot_id.0, "snapshot id")?;
        let _guard = self.inflight.try_acquire(snapshot_id.0.as_str())?;

        if self.cloud.delete_snapshot(&snapshot_id.0).await? {
            info!("snapshot deleted");
        } else {
            debug!("snapshot already deleted");
        }
        Ok(())
    }

    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError> {
        if req.max_entries > 0 && req.max_entries < MIN_LIST_ENTRIES {
            return Err(CsiError::InvalidArgument(format!(
                "max entries must be 0 or at least {MIN_LIST_ENTRIES}"
            )));
        }

        if let Some(id) = &req.snapshot_id {
            let found = match self.cloud.get_snapshot(&id.0).await {
                Ok(s) => Some(s),
                Err(CloudError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
            let entries = found
                .filter(|s| {
                    req.source_volume_id
                        .as_ref()
                        .is_none_or(|v| v.0 == s.source_volume_id)
                })
                .map(|s| vec![to_snapshot(&s)])
                .unwrap_or_default();
            return Ok(ListSnapshotsResponse {
                entries,
                next_token: None,
            });
        }

        let page = self
            .cloud
            .list_snapshots(
                req.source_volume_id.as_ref().map(|v| v.0.as_str()),
                (req.max_entries > 0).then_some(req.max_entries),
                req.starting_token.as_deref(),
            )
            .await?;
        Ok(ListSnapshotsResponse {
            entries: page.snapshots.iter().map(to_snapshot).collect(),
            next_token: page.next_token,
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
            ControllerCapability::ExpandVolume,
        ])
    }
}
