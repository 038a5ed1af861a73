//! Node service over a [`Mounter`].
//!
//! A volume moves through `attached → staged → published` on each node.
//! Staging resolves the attached device, unlocks it when encrypted, puts a
//! filesystem on it if blank and mounts it at the staging path; publishing
//! bind-mounts the staging path (or the raw device) into the workload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::require;
use crate::cloud::devices::device_suffix;
use crate::config::{NodeMetadata, NodeOptions};
use crate::error::CsiError;
use crate::inflight::InFlight;
use crate::mounter::{
    luks_mapper_name, mapper_name, mapper_path, LuksOptions, MountEntry, MountError, Mounter,
    FS_TYPE_LUKS,
};
use crate::node::CsiNode;
use crate::types::{
    AccessType, NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeInfo,
    NodePublishVolumeRequest, NodeStageVolumeRequest, Secrets, Topology, UsageUnit, VolumeCapability,
    VolumeId, VolumeStats, VolumeUsage, CONTEXT_ENCRYPTED, CONTEXT_LUKS_CIPHER, CONTEXT_LUKS_HASH,
    CONTEXT_LUKS_KEY_SIZE, PUBLISH_CONTEXT_DEVICE_PATH, SECRET_LUKS_PASSPHRASE,
};
use crate::util::dedup_flags;

pub const DEFAULT_FS_TYPE: &str = "xfs";
pub const SUPPORTED_FS_TYPES: &[&str] = &["ext2", "ext3", "ext4", "xfs"];

/// Where udev links a disk when the hypervisor ignores the requested name.
const BY_ID_PREFIX: &str = "/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_sd";

fn mount_failed(path: &str) -> impl FnOnce(MountError) -> CsiError + '_ {
    move |e| CsiError::MountFailed {
        path: path.to_owned(),
        reason: e.to_string(),
    }
}

fn encryption_failed(device: &str) -> impl FnOnce(MountError) -> CsiError + '_ {
    move |e| CsiError::EncryptionFailed {
        device: device.to_owned(),
        reason: e.to_string(),
    }
}

fn is_encrypted(contexts: [&HashMap<String, String>; 2]) -> bool {
    contexts
        .iter()
        .any(|ctx| ctx.get(CONTEXT_ENCRYPTED).is_some_and(|v| v.eq_ignore_ascii_case("true")))
}

fn luks_options(ctx: &HashMap<String, String>) -> LuksOptions {
    LuksOptions {
        cipher: ctx.get(CONTEXT_LUKS_CIPHER).cloned(),
        hash: ctx.get(CONTEXT_LUKS_HASH).cloned(),
        key_size: ctx.get(CONTEXT_LUKS_KEY_SIZE).cloned(),
    }
}

fn check_access_mode(cap: &VolumeCapability) -> Result<(), CsiError> {
    if cap.access_mode.is_supported() {
        Ok(())
    } else {
        Err(CsiError::InvalidArgument(format!(
            "access mode {:?} is not supported",
            cap.access_mode
        )))
    }
}

/// Requested filesystem and flags; `None` for raw block access.
fn mount_params(cap: &VolumeCapability) -> Option<(&str, &[String])> {
    match &cap.access_type {
        AccessType::Mount {
            fs_type,
            mount_flags,
        } => Some((fs_type.as_str(), mount_flags.as_slice())),
        AccessType::Block => None,
    }
}

pub struct NodeService {
    mounter: Arc<dyn Mounter>,
    inflight: InFlight,
    metadata: NodeMetadata,
    options: NodeOptions,
}

impl NodeService {
    pub fn new(mounter: Arc<dyn Mounter>, metadata: NodeMetadata, options: NodeOptions) -> Self {
        Self {
            mounter,
            inflight: InFlight::new(),
            metadata,
            options,
        }
    }

    pub fn with_inflight(mut self, inflight: InFlight) -> Self {
        self.inflight = inflight;
        self
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    /// Canonical path of the attached device named in the publish context.
    async fn find_device(&self, publish_context: &HashMap<String, String>) -> Result<String, CsiError> {
        let hint = publish_context
            .get(PUBLISH_CONTEXT_DEVICE_PATH)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                CsiError::InvalidArgument(format!(
                    "{PUBLISH_CONTEXT_DEVICE_PATH} missing from publish context"
                ))
            })?;

        if let Some(device) = self.mounter.resolve_device(hint).await? {
            return Ok(device);
        }
        if let Some(suffix) = device_suffix(hint) {
            let by_id = format!("{BY_ID_PREFIX}{suffix}");
            if let Some(device) = self.mounter.resolve_device(&by_id).await? {
                debug!(%hint, %device, "device found through its by-id link");
                return Ok(device);
            }
        }
        Err(CsiError::FailedPrecondition(format!(
            "device {hint} not attached to this node"
        )))
    }

    /// Unlock `device`, formatting it as LUKS on first use.  Returns the
    /// mapper path and whether this call opened the mapping.  The
    /// passphrase is verified even when the mapping is already open.
    async fn open_encrypted(
        &self,
        device: &str,
        secrets: &Secrets,
        opts: &LuksOptions,
    ) -> Result<(String, bool), CsiError> {
        let passphrase = secrets.get(SECRET_LUKS_PASSPHRASE).ok_or_else(|| {
            CsiError::InvalidArgument(format!(
                "secret {SECRET_LUKS_PASSPHRASE} is required for encrypted volumes"
            ))
        })?;
        let name = luks_mapper_name(device);
        let already_open = self.mounter.luks_is_open(&name).await?;

        if !already_open && !self.mounter.is_luks(device).await? {
            info!(%device, "formatting device as LUKS");
            self.mounter
                .luks_format(device, passphrase, opts)
                .await
                .map_err(encryption_failed(device))?;
        }
        if !self
            .mounter
            .luks_check_passphrase(device, passphrase)
            .await
            .map_err(encryption_failed(device))?
        {
            return Err(CsiError::BadPassphrase(device.to_owned()));
        }
        if already_open {
            debug!(%name, "mapping already open");
            return Ok((mapper_path(&name), false));
        }
        self.mounter
            .luks_open(device, &name, passphrase, &self.options.luks_open_flags)
            .await
            .map_err(encryption_failed(device))?;
        Ok((mapper_path(&name), true))
    }

    /// Put a filesystem on `device` if needed and mount it at `staging`.
    async fn mount_staged(
        &self,
        device: &str,
        staging: &str,
        requested: &str,
        flags: &[String],
    ) -> Result<(), CsiError> {
        if let Some(existing) = self.mounter.mount_at(staging).await? {
            if existing.source == device {
                debug!(%staging, "already staged");
                return Ok(());
            }
            return Err(CsiError::FailedPrecondition(format!(
                "{staging} is already mounted from {}",
                existing.source
            )));
        }

        let fs_type = match self.mounter.probe_fs_type(device).await? {
            Some(existing) if !requested.is_empty() && existing != requested => {
                return Err(CsiError::FilesystemMismatch {
                    device: device.to_owned(),
                    existing,
                    requested: requested.to_owned(),
                });
            }
            Some(existing) => existing,
            None => {
                let fs_type = if requested.is_empty() {
                    DEFAULT_FS_TYPE
                } else {
                    requested
                };
                info!(%device, %fs_type, "formatting blank device");
                self.mounter
                    .format(device, fs_type)
                    .await
                    .map_err(mount_failed(staging))?;
                fs_type.to_owned()
            }
        };

        self.mounter.make_dir(staging).await?;
        self.mounter
            .mount(device, staging, &fs_type, flags)
            .await
            .map_err(mount_failed(staging))
    }

    async fn publish_block(&self, req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
        let device = self.find_device(&req.publish_context).await?;
        let target = req.target_path.as_str();
        self.mounter.make_file(target).await?;
        if self.mounter.mount_at(target).await?.is_some() {
            debug!(%target, "block device already published");
            return Ok(());
        }
        self.mounter
            .bind_mount(&device, target, req.read_only, &[])
            .await
            .map_err(mount_failed(target))
    }

    async fn publish_mount(
        &self,
        req: &NodePublishVolumeRequest,
        flags: &[String],
    ) -> Result<(), CsiError> {
        let staging = req.staging_target_path.as_str();
        let target = req.target_path.as_str();
        require(staging, "staging target path")?;

        let staged = self.mounter.mount_at(staging).await?.ok_or_else(|| {
            CsiError::FailedPrecondition(format!("volume {} is not staged at {staging}", req.volume_id))
        })?;
        self.mounter.make_dir(target).await?;

        if let Some(existing) = self.mounter.mount_at(target).await? {
            return check_published(&existing, &staged, target, req.read_only);
        }

        let flags = dedup_flags(flags.iter().cloned());
        self.mounter
            .bind_mount(staging, target, req.read_only, &flags)
            .await
            .map_err(mount_failed(target))
    }
}

fn check_published(
    existing: &MountEntry,
    staged: &MountEntry,
    target: &str,
    read_only: bool,
) -> Result<(), CsiError> {
    if existing.source != staged.source {
        return Err(CsiError::FailedPrecondition(format!(
            "{target} is already mounted from {}",
            existing.source
        )));
    }
    if existing.is_read_only() != read_only {
        return Err(CsiError::FailedPrecondition(format!(
            "{target} is already published with read_only={}",
            existing.is_read_only()
        )));
    }
    debug!(%target, "already published");
    Ok(())
}

#[async_trait]
impl CsiNode for NodeService {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        check_access_mode(&req.volume_capability)?;
        let Some((requested, flags)) = mount_params(&req.volume_capability) else {
            debug!("block volume, nothing to stage");
            return Ok(());
        };
        if !requested.is_empty() && !SUPPORTED_FS_TYPES.contains(&requested) {
            return Err(CsiError::InvalidArgument(format!(
                "unsupported filesystem {requested:?}"
            )));
        }
        let _guard = self.inflight.try_acquire(req.volume_id.0.as_str())?;

        let device = self.find_device(&req.publish_context).await?;
        let encrypted = is_encrypted([&req.publish_context, &req.volume_context]);

        let (source, opened) = if encrypted {
            self.open_encrypted(&device, &req.secrets, &luks_options(&req.volume_context))
                .await?
        } else {
            if self.mounter.probe_fs_type(&device).await?.as_deref() == Some(FS_TYPE_LUKS) {
                return Err(CsiError::FailedPrecondition(format!(
                    "device {device} is encrypted but the volume is not marked encrypted"
                )));
            }
            (device.clone(), false)
        };

        let staged = self
            .mount_staged(&source, &req.staging_target_path, requested, flags)
            .await;
        if let Err(e) = staged {
            if opened {
                if let Some(name) = mapper_name(&source) {
                    if let Err(close) = self.mounter.luks_close(name).await {
                        warn!(%name, error = %close, "closing mapping after failed stage");
                    }
                }
            }
            return Err(e);
        }

        info!(%source, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(&self, volume_id: &VolumeId, staging_target_path: &str) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        require(staging_target_path, "staging target path")?;
        let _guard = self.inflight.try_acquire(volume_id.0.as_str())?;

        let Some(entry) = self.mounter.mount_at(staging_target_path).await? else {
            debug!("not staged");
            return Ok(());
        };
        let others = self
            .mounter
            .other_mounts_of(&entry.source, staging_target_path)
            .await?;
        if !others.is_empty() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still published at {}",
                others.join(", ")
            )));
        }

        self.mounter
            .unmount(staging_target_path)
            .await
            .map_err(|e| CsiError::UnmountFailed {
                path: staging_target_path.to_owned(),
                reason: e.to_string(),
            })?;
        if let Some(name) = mapper_name(&entry.source) {
            self.mounter
                .luks_close(name)
                .await
                .map_err(encryption_failed(&entry.source))?;
        }
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.target_path, "target path")?;
        check_access_mode(&req.volume_capability)?;
        let _guard = self.inflight.try_acquire(req.volume_id.0.as_str())?;

        match mount_params(&req.volume_capability) {
            Some((_, flags)) => self.publish_mount(&req, flags).await?,
            None => self.publish_block(&req).await?,
        }
        info!(read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        require(target_path, "target path")?;
        let _guard = self.inflight.try_acquire(volume_id.0.as_str())?;

        if self.mounter.mount_at(target_path).await?.is_some() {
            self.mounter
                .unmount(target_path)
                .await
                .map_err(|e| CsiError::UnmountFailed {
                    path: target_path.to_owned(),
                    reason: e.to_string(),
                })?;
        }
        self.mounter.remove_path(target_path).await?;
        info!("volume unpublished");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, path = %req.volume_path))]
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<NodeExpandVolumeResponse, CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.volume_path, "volume path")?;
        let _guard = self.inflight.try_acquire(req.volume_id.0.as_str())?;

        if req.volume_capability.as_ref().is_some_and(VolumeCapability::is_block) {
            let capacity_bytes = match req.capacity_range {
                Some(r) if r.required_bytes > 0 => r.required_bytes,
                _ => self.mounter.device_size(&req.volume_path).await?,
            };
            return Ok(NodeExpandVolumeResponse { capacity_bytes });
        }

        let entry = self
            .mounter
            .mount_at(&req.volume_path)
            .await?
            .ok_or_else(|| CsiError::NotFound(format!("no volume mounted at {}", req.volume_path)))?;
        let device = entry.source.as_str();

        if let Some(name) = mapper_name(device) {
            self.mounter
                .luks_resize(name)
                .await
                .map_err(encryption_failed(device))?;
        }

        let device_size = self.mounter.device_size(device).await?;
        let fs_size = self
            .mounter
            .filesystem_size(device, &req.volume_path, &entry.fs_type)
            .await?;
        if device_size > fs_size {
            self.mounter
                .resize_fs(device, &req.volume_path, &entry.fs_type)
                .await
                .map_err(mount_failed(&req.volume_path))?;
            info!(fs_size, device_size, "filesystem grown");
        } else {
            debug!(fs_size, device_size, "filesystem already fills the device");
        }
        Ok(NodeExpandVolumeResponse {
            capacity_bytes: device_size,
        })
    }

    async fn get_volume_stats(&self, volume_id: &VolumeId, volume_path: &str) -> Result<VolumeStats, CsiError> {
        require(&volume_id.0, "volume id")?;
        require(volume_path, "volume path")?;
        if !self.mounter.path_exists(volume_path).await? {
            return Err(CsiError::NotFound(format!("path {volume_path}")));
        }

        if self.mounter.is_block_device(volume_path).await? {
            let total = self.mounter.device_size(volume_path).await?;
            return Ok(VolumeStats {
                usage: vec![VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total,
                    used: 0,
                    available: 0,
                }],
            });
        }

        let fs = self.mounter.volume_stats(volume_path).await?;
        Ok(VolumeStats {
            usage: vec![
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total: fs.total_bytes,
                    used: fs.used_bytes,
                    available: fs.available_bytes,
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    total: fs.total_inodes,
                    used: fs.used_inodes,
                    available: fs.free_inodes,
                },
            ],
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::ExpandVolume,
            NodeCapability::GetVolumeStats,
        ])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.metadata.instance_id.clone(),
            max_volumes: self.options.max_volumes,
            accessible_topology: Some(Topology::zone(&self.metadata.zone)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::mounter::fake::FakeMounter;
    use crate::types::{AccessMode, CapacityRange, TOPOLOGY_ZONE_KEY};

    const GIB: u64 = 1 << 30;
    const DEVICE: &str = "/dev/xvdb";
    const STAGE: &str = "/var/lib/kubelet/stage/vol-1";
    const TARGET: &str = "/var/lib/kubelet/pods/p1/vol-1";

    fn setup() -> (Arc<FakeMounter>, NodeService) {
        let mounter = Arc::new(FakeMounter::new());
        mounter.add_device(DEVICE, 4 * GIB);
        let svc = NodeService::new(
            Arc::clone(&mounter) as Arc<dyn Mounter>,
            NodeMetadata {
                instance_id: "i-1".into(),
                region: "eu-west-2".into(),
                zone: "eu-west-2a".into(),
            },
            NodeOptions {
                luks_open_flags: vec!["--perf-no_read_workqueue".into()],
                max_volumes: 25,
            },
        );
        (mounter, svc)
    }

    fn stage_req(cap: VolumeCapability) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: VolumeId::from("vol-1"),
            publish_context: HashMap::from([(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), DEVICE.to_owned())]),
            staging_target_path: STAGE.into(),
            volume_capability: cap,
            secrets: Secrets::default(),
            volume_context: HashMap::new(),
        }
    }

    fn encrypted_req(passphrase: &str) -> NodeStageVolumeRequest {
        let mut req = stage_req(VolumeCapability::mount("ext4"));
        req.volume_context = HashMap::from([
            (CONTEXT_ENCRYPTED.to_owned(), "true".to_owned()),
            (CONTEXT_LUKS_CIPHER.to_owned(), "aes-xts-plain64".to_owned()),
        ]);
        req.secrets = Secrets::from([(SECRET_LUKS_PASSPHRASE, passphrase)]);
        req
    }

    fn publish_req(read_only: bool) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: VolumeId::from("vol-1"),
            publish_context: HashMap::from([(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), DEVICE.to_owned())]),
            staging_target_path: STAGE.into(),
            target_path: TARGET.into(),
            volume_capability: VolumeCapability::mount("xfs"),
            read_only,
            volume_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn stage_formats_once() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::mount(""))).await.unwrap();
        svc.stage_volume(stage_req(VolumeCapability::mount(""))).await.unwrap();

        assert_eq!(mounter.format_count(), 1);
        let entry = mounter.mount_at(STAGE).await.unwrap().unwrap();
        assert_eq!(entry.source, DEVICE);
        assert_eq!(entry.fs_type, DEFAULT_FS_TYPE);
    }

    #[tokio::test]
    async fn stage_never_reformats() {
        let (mounter, svc) = setup();
        mounter.preformat(DEVICE, "ext4");

        let err = svc.stage_volume(stage_req(VolumeCapability::mount("xfs"))).await.unwrap_err();
        assert!(matches!(err, CsiError::FilesystemMismatch { .. }));

        svc.stage_volume(stage_req(VolumeCapability::mount(""))).await.unwrap();
        assert_eq!(mounter.mount_at(STAGE).await.unwrap().unwrap().fs_type, "ext4");
        assert_eq!(mounter.format_count(), 0);
    }

    #[tokio::test]
    async fn stage_finds_device_through_by_id_link() {
        let (mounter, svc) = setup();
        mounter.add_device("/dev/sdc", GIB);
        mounter.add_symlink("/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_sdc", "/dev/sdc");

        let mut req = stage_req(VolumeCapability::mount("ext4"));
        req.publish_context
            .insert(PUBLISH_CONTEXT_DEVICE_PATH.into(), "/dev/xvdc".into());
        svc.stage_volume(req).await.unwrap();
        assert_eq!(mounter.mount_at(STAGE).await.unwrap().unwrap().source, "/dev/sdc");

        let mut missing = stage_req(VolumeCapability::mount("ext4"));
        missing
            .publish_context
            .insert(PUBLISH_CONTEXT_DEVICE_PATH.into(), "/dev/xvdq".into());
        missing.staging_target_path = "/other".into();
        assert_eq!(svc.stage_volume(missing).await.unwrap_err().code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn block_stage_is_a_no_op() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::block())).await.unwrap();
        assert!(mounter.mount_table().is_empty());
        assert_eq!(mounter.format_count(), 0);
    }

    #[tokio::test]
    async fn stage_rejects_unknown_filesystems() {
        let (_mounter, svc) = setup();
        let err = svc
            .stage_volume(stage_req(VolumeCapability::mount("btrfs")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn shared_access_modes_are_refused() {
        let (mounter, svc) = setup();
        for mode in [AccessMode::ReadOnlyMany, AccessMode::ReadWriteMany] {
            let mut cap = VolumeCapability::mount("ext4");
            cap.access_mode = mode;
            let err = svc.stage_volume(stage_req(cap.clone())).await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);

            let mut req = publish_req(false);
            req.volume_capability = cap;
            let err = svc.publish_volume(req).await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);
        }
        assert!(mounter.mount_table().is_empty());
        assert_eq!(mounter.format_count(), 0);
    }

    #[tokio::test]
    async fn encrypted_stage_opens_mapping() {
        let (mounter, svc) = setup();
        svc.stage_volume(encrypted_req("s3cret")).await.unwrap();

        let entry = mounter.mount_at(STAGE).await.unwrap().unwrap();
        assert_eq!(entry.source, "/dev/mapper/xvdb_crypt");
        assert_eq!(mounter.luks_format_count(), 1);
        assert_eq!(
            mounter.luks_options(DEVICE).unwrap().cipher.as_deref(),
            Some("aes-xts-plain64")
        );
        assert_eq!(mounter.last_open_flags(), vec!["--perf-no_read_workqueue".to_owned()]);

        svc.stage_volume(encrypted_req("s3cret")).await.unwrap();
        assert_eq!(mounter.luks_format_count(), 1);

        let err = svc.stage_volume(encrypted_req("guess")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(mounter.open_mappings().len(), 1);

        svc.unstage_volume(&VolumeId::from("vol-1"), STAGE).await.unwrap();
        assert!(mounter.open_mappings().is_empty());

        let err = svc.stage_volume(encrypted_req("wrong")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert!(mounter.open_mappings().is_empty());
    }

    #[tokio::test]
    async fn encrypted_stage_needs_passphrase() {
        let (mounter, svc) = setup();
        let mut req = encrypted_req("unused");
        req.secrets = Secrets::default();
        assert_eq!(svc.stage_volume(req).await.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(mounter.luks_format_count(), 0);
    }

    #[tokio::test]
    async fn plain_stage_refuses_luks_device() {
        let (mounter, svc) = setup();
        mounter
            .luks_format(DEVICE, "x", &LuksOptions::default())
            .await
            .unwrap();
        let err = svc
            .stage_volume(stage_req(VolumeCapability::mount("ext4")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn publish_requires_stage_and_blocks_unstage() {
        let (mounter, svc) = setup();
        let err = svc.publish_volume(publish_req(false)).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        svc.stage_volume(stage_req(VolumeCapability::mount("xfs"))).await.unwrap();
        svc.publish_volume(publish_req(false)).await.unwrap();
        svc.publish_volume(publish_req(false)).await.unwrap();
        assert_eq!(mounter.mounts_at(TARGET).await.unwrap().len(), 1);

        let err = svc.publish_volume(publish_req(true)).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let err = svc
            .unstage_volume(&VolumeId::from("vol-1"), STAGE)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        svc.unpublish_volume(&VolumeId::from("vol-1"), TARGET).await.unwrap();
        svc.unpublish_volume(&VolumeId::from("vol-1"), TARGET).await.unwrap();
        assert!(!mounter.has_path(TARGET));
        svc.unstage_volume(&VolumeId::from("vol-1"), STAGE).await.unwrap();
        svc.unstage_volume(&VolumeId::from("vol-1"), STAGE).await.unwrap();
        assert!(mounter.mount_table().is_empty());
    }

    #[tokio::test]
    async fn read_only_publish() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::mount("xfs"))).await.unwrap();
        let mut req = publish_req(true);
        req.volume_capability = VolumeCapability {
            access_type: AccessType::Mount {
                fs_type: "xfs".into(),
                mount_flags: vec!["noatime".into(), "noatime".into()],
            },
            ..VolumeCapability::default()
        };
        svc.publish_volume(req).await.unwrap();

        let entry = mounter.mount_at(TARGET).await.unwrap().unwrap();
        assert!(entry.is_read_only());
        assert_eq!(entry.options.iter().filter(|o| *o == "noatime").count(), 1);
        assert!(mounter.write_file(TARGET, "f", b"x").is_err());
        mounter.write_file(STAGE, "f", b"x").unwrap();
    }

    #[tokio::test]
    async fn block_publish_and_stats() {
        let (mounter, svc) = setup();
        let mut req = publish_req(false);
        req.volume_capability = VolumeCapability::block();
        req.target_path = "/dev/block/vol-1".into();
        svc.publish_volume(req.clone()).await.unwrap();
        svc.publish_volume(req).await.unwrap();
        assert_eq!(mounter.mounts_at("/dev/block/vol-1").await.unwrap().len(), 1);

        let stats = svc
            .get_volume_stats(&VolumeId::from("vol-1"), "/dev/block/vol-1")
            .await
            .unwrap();
        assert_eq!(stats.usage.len(), 1);
        assert_eq!(stats.usage[0].total, 4 * GIB);
    }

    #[tokio::test]
    async fn filesystem_stats() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::mount("xfs"))).await.unwrap();
        mounter.write_file(STAGE, "data", &[0u8; 512]).unwrap();

        let stats = svc.get_volume_stats(&VolumeId::from("vol-1"), STAGE).await.unwrap();
        assert_eq!(stats.usage[0].unit, UsageUnit::Bytes);
        assert_eq!(stats.usage[0].used, 512);
        assert_eq!(stats.usage[1].unit, UsageUnit::Inodes);
        assert_eq!(stats.usage[1].used, 1);

        let err = svc
            .get_volume_stats(&VolumeId::from("vol-1"), "/nowhere")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn expand_grows_filesystem_to_device() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::mount("xfs"))).await.unwrap();
        let req = NodeExpandVolumeRequest {
            volume_id: VolumeId::from("vol-1"),
            volume_path: STAGE.into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 8 * GIB,
                limit_bytes: 0,
            }),
            volume_capability: None,
        };

        assert_eq!(svc.expand_volume(req.clone()).await.unwrap().capacity_bytes, 4 * GIB);

        mounter.set_device_size(DEVICE, 8 * GIB);
        assert_eq!(svc.expand_volume(req.clone()).await.unwrap().capacity_bytes, 8 * GIB);
        let stats = svc.get_volume_stats(&VolumeId::from("vol-1"), STAGE).await.unwrap();
        assert_eq!(stats.usage[0].total, 8 * GIB);

        let mut nowhere = req;
        nowhere.volume_path = "/nowhere".into();
        assert_eq!(svc.expand_volume(nowhere).await.unwrap_err().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn expand_resizes_mapping_first() {
        let (mounter, svc) = setup();
        svc.stage_volume(encrypted_req("s3cret")).await.unwrap();
        mounter.set_device_size(DEVICE, 8 * GIB);

        let resp = svc
            .expand_volume(NodeExpandVolumeRequest {
                volume_id: VolumeId::from("vol-1"),
                volume_path: STAGE.into(),
                capacity_range: None,
                volume_capability: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.capacity_bytes, 8 * GIB);
        assert_eq!(mounter.luks_resize_count(), 1);
    }

    #[tokio::test]
    async fn busy_volume_is_aborted() {
        let (_mounter, svc) = setup();
        let _held = svc.inflight().try_acquire("vol-1").unwrap();
        let err = svc
            .stage_volume(stage_req(VolumeCapability::mount("xfs")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
    }

    #[tokio::test]
    async fn info_reports_zone_and_limit() {
        let (_mounter, svc) = setup();
        let info = svc.get_info().await.unwrap();
        assert_eq!(info.node_id, "i-1");
        assert_eq!(info.max_volumes, 25);
        let topology = info.accessible_topology.unwrap();
        assert_eq!(topology.segments[TOPOLOGY_ZONE_KEY], "eu-west-2a");
        assert_eq!(svc.get_capabilities().await.unwrap().len(), 3);
    }
}
