//! [`Cloud`] implementation over a raw [`ProviderApi`].
//!
//! Every provider call runs under [`BackoffPolicy::retry`] with
//! [`CloudError::is_transient`] as the predicate.  Operations the provider
//! completes asynchronously (creation, link, unlink, resize) are confirmed
//! with [`BackoffPolicy::poll_until`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::api::*;
use super::devices::DeviceAllocator;
use super::{
    state, Cloud, CloudError, CloudSnapshot, Disk, DiskOptions, SnapshotPage, TAG_SNAPSHOT_NAME,
    TAG_VOLUME_NAME,
};
use crate::backoff::BackoffPolicy;

pub const VOLUME_TYPE_STANDARD: &str = "standard";
pub const VOLUME_TYPE_GP2: &str = "gp2";
pub const VOLUME_TYPE_IO1: &str = "io1";

const MAX_IOPS_PER_GB: u32 = 300;
const MIN_TOTAL_IOPS: u32 = 100;
const MAX_TOTAL_IOPS: u32 = 13_000;

/// Total IOPS for an `io1` disk: `size × per-GiB`, per-GiB capped, total
/// clamped to the provider's range.
pub fn provisioned_iops(capacity_gib: u64, iops_per_gb: u32) -> u32 {
    let per_gb = u64::from(iops_per_gb.min(MAX_IOPS_PER_GB));
    let total = capacity_gib.saturating_mul(per_gb);
    u32::try_from(total)
        .unwrap_or(u32::MAX)
        .clamp(MIN_TOTAL_IOPS, MAX_TOTAL_IOPS)
}

pub struct BsuCloud {
    api: Arc<dyn ProviderApi>,
    backoff: BackoffPolicy,
    region: String,
    devices: DeviceAllocator,
}

impl BsuCloud {
    pub fn new(api: Arc<dyn ProviderApi>, region: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            api,
            backoff,
            region: region.into(),
            devices: DeviceAllocator::new(),
        }
    }

    /// Zone used when the caller gives no topology.
    pub fn default_zone(&self) -> String {
        format!("{}a", self.region)
    }

    async fn read_volume(&self, volume_id: &str) -> Result<Option<ApiVolume>, CloudError> {
        let filter = VolumeFilter {
            volume_ids: vec![volume_id.to_owned()],
            ..Default::default()
        };
        let mut volumes = self
            .backoff
            .retry("ReadVolumes", CloudError::is_transient, || {
                self.api.read_volumes(filter.clone())
            })
            .await?;
        Ok(volumes.pop())
    }

    async fn read_snapshots(&self, query: SnapshotQuery) -> Result<SnapshotListing, CloudError> {
        self.backoff
            .retry("ReadSnapshots", CloudError::is_transient, || {
                self.api.read_snapshots(query.clone())
            })
            .await
    }

    async fn tag(&self, resource_id: &str, tags: &HashMap<String, String>) -> Result<(), CloudError> {
        if tags.is_empty() {
            return Ok(());
        }
        let ids = [resource_id.to_owned()];
        let tags = tags_from_map(tags);
        self.backoff
            .retry("CreateTags", CloudError::is_transient, || {
                self.api.create_tags(&ids, &tags)
            })
            .await
    }
}

#[async_trait]
impl Cloud for BsuCloud {
    #[instrument(skip(self, opts), fields(size_gib = opts.capacity_gib, kind = %opts.volume_type))]
    async fn create_disk(&self, opts: &DiskOptions) -> Result<Disk, CloudError> {
        let volume_type = if opts.volume_type.is_empty() {
            VOLUME_TYPE_GP2.to_owned()
        } else {
            opts.volume_type.clone()
        };
        let iops = match (volume_type.as_str(), opts.iops_per_gb) {
            (VOLUME_TYPE_IO1, Some(per_gb)) => Some(provisioned_iops(opts.capacity_gib, per_gb)),
            _ => None,
        };
        let input = CreateVolumeInput {
            size: opts.capacity_gib,
            subregion_name: opts
                .availability_zone
                .clone()
                .unwrap_or_else(|| self.default_zone()),
            volume_type,
            iops,
            snapshot_id: opts.snapshot_id.clone(),
        };

        let created = self
            .backoff
            .retry("CreateVolume", CloudError::is_transient, || {
                self.api.create_volume(input.clone())
            })
            .await?;
        let volume_id = created.volume_id.clone();

        if let Err(e) = self.tag(&volume_id, &opts.tags).await {
            // An untagged disk can never be found again by name.
            warn!(%volume_id, error = %e, "tagging failed, deleting new disk");
            if let Err(cleanup) = self
                .backoff
                .retry("DeleteVolume", CloudError::is_transient, || {
                    self.api.delete_volume(&volume_id)
                })
                .await
            {
                warn!(%volume_id, error = %cleanup, "untagged disk left behind");
            }
            return Err(e);
        }

        let ready = self
            .backoff
            .poll_until("volume creation", || async {
                match self.read_volume(&volume_id).await? {
                    Some(v) if v.state == state::AVAILABLE => Ok(Some(v)),
                    Some(v) if v.state == state::ERROR => Err(CloudError::Failed(format!(
                        "volume {volume_id} entered the error state"
                    ))),
                    _ => Ok(None),
                }
            })
            .await?;

        info!(%volume_id, zone = %ready.subregion_name, "disk created");
        Ok(Disk::from(ready))
    }

    #[instrument(skip(self))]
    async fn delete_disk(&self, volume_id: &str) -> Result<bool, CloudError> {
        match self
            .backoff
            .retry("DeleteVolume", CloudError::is_transient, || {
                self.api.delete_volume(volume_id)
            })
            .await
        {
            Ok(()) => {
                info!(%volume_id, "disk deleted");
                Ok(true)
            }
            Err(CloudError::NotFound(_)) => {
                debug!(%volume_id, "disk already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_disk(&self, volume_id: &str) -> Result<Disk, CloudError> {
        self.read_volume(volume_id)
            .await?
            .map(Disk::from)
            .ok_or_else(|| CloudError::NotFound(format!("volume {volume_id}")))
    }

    async fn get_disk_by_name(&self, name: &str) -> Result<Option<Disk>, CloudError> {
        let filter = VolumeFilter {
            tags: vec![format!("{TAG_VOLUME_NAME}={name}")],
            ..Default::default()
        };
        let mut volumes = self
            .backoff
            .retry("ReadVolumes", CloudError::is_transient, || {
                self.api.read_volumes(filter.clone())
            })
            .await?;
        match volumes.len() {
            0 => Ok(None),
            1 => Ok(volumes.pop().map(Disk::from)),
            _ => Err(CloudError::MultipleDisks(name.to_owned())),
        }
    }

    async fn instance_exists(&self, vm_id: &str) -> Result<bool, CloudError> {
        let ids = [vm_id.to_owned()];
        match self
            .backoff
            .retry("ReadVms", CloudError::is_transient, || self.api.read_vms(&ids))
            .await
        {
            Ok(vms) => Ok(vms.iter().any(|vm| vm.vm_id == vm_id)),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn attach_disk(&self, volume_id: &str, vm_id: &str) -> Result<String, CloudError> {
        let ids = [vm_id.to_owned()];
        let vm = self
            .backoff
            .retry("ReadVms", CloudError::is_transient, || self.api.read_vms(&ids))
            .await?
            .into_iter()
            .find(|vm| vm.vm_id == vm_id)
            .ok_or_else(|| CloudError::NotFound(format!("instance {vm_id}")))?;

        let disk = self.get_disk(volume_id).await?;
        let mut reservation = None;
        match disk.link_to(vm_id) {
            Some(link) if link.state == state::ATTACHED => return Ok(link.device_name.clone()),
            // A link from an earlier attempt is still settling.
            Some(link) => debug!(%volume_id, %vm_id, state = %link.state, "link already requested"),
            None => {
                let r = self.devices.reserve(
                    vm_id,
                    vm.block_device_mappings
                        .iter()
                        .map(|m| m.device_name.as_str()),
                )?;
                let device = r.name().to_owned();
                reservation = Some(r);
                debug!(%volume_id, %vm_id, %device, "linking volume");

                self.backoff
                    .retry("LinkVolume", CloudError::is_transient, || {
                        self.api.link_volume(volume_id, vm_id, &device)
                    })
                    .await?;
            }
        }

        let device = self
            .backoff
            .poll_until("volume attachment", || async {
                let disk = self.get_disk(volume_id).await?;
                Ok(disk
                    .link_to(vm_id)
                    .filter(|l| l.state == state::ATTACHED)
                    .map(|l| l.device_name.clone()))
            })
            .await?;
        drop(reservation);

        info!(%volume_id, %vm_id, %device, "disk attached");
        Ok(device)
    }

    #[instrument(skip(self))]
    async fn detach_disk(&self, volume_id: &str, vm_id: &str) -> Result<(), CloudError> {
        match self
            .backoff
            .retry("UnlinkVolume", CloudError::is_transient, || {
                self.api.unlink_volume(volume_id)
            })
            .await
        {
            Ok(()) | Err(CloudError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.backoff
            .poll_until("volume detachment", || async {
                match self.get_disk(volume_id).await {
                    Ok(disk) if disk.link_to(vm_id).is_some() => Ok(None),
                    Ok(_) | Err(CloudError::NotFound(_)) => Ok(Some(())),
                    Err(e) => Err(e),
                }
            })
            .await?;

        info!(%volume_id, %vm_id, "disk detached");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resize_disk(&self, volume_id: &str, new_gib: u64) -> Result<u64, CloudError> {
        let disk = self.get_disk(volume_id).await?;
        if new_gib <= disk.capacity_gib {
            return Ok(disk.capacity_gib);
        }

        self.backoff
            .retry("UpdateVolume", CloudError::is_transient, || {
                self.api.update_volume(volume_id, new_gib)
            })
            .await?;

        let size = self
            .backoff
            .poll_until("volume resize", || async {
                let disk = self.get_disk(volume_id).await?;
                Ok((disk.capacity_gib >= new_gib).then_some(disk.capacity_gib))
            })
            .await?;

        info!(%volume_id, size_gib = size, "disk resized");
        Ok(size)
    }

    #[instrument(skip(self, tags))]
    async fn create_snapshot(
        &self,
        source_volume_id: &str,
        tags: &HashMap<String, String>,
    ) -> Result<CloudSnapshot, CloudError> {
        let description = tags
            .get(TAG_SNAPSHOT_NAME)
            .cloned()
            .unwrap_or_else(|| format!("snapshot of {source_volume_id}"));
        let created = self
            .backoff
            .retry("CreateSnapshot", CloudError::is_transient, || {
                self.api.create_snapshot(source_volume_id, &description)
            })
            .await?;

        if let Err(e) = self.tag(&created.snapshot_id, tags).await {
            let snapshot_id = created.snapshot_id.as_str();
            warn!(%snapshot_id, error = %e, "tagging failed, deleting new snapshot");
            if let Err(cleanup) = self
                .backoff
                .retry("DeleteSnapshot", CloudError::is_transient, || {
                    self.api.delete_snapshot(snapshot_id)
                })
                .await
            {
                warn!(%snapshot_id, error = %cleanup, "untagged snapshot left behind");
            }
            return Err(e);
        }

        let mut snapshot = CloudSnapshot::from(created);
        snapshot.tags.extend(tags.clone());
        info!(snapshot_id = %snapshot.snapshot_id, state = %snapshot.state, "snapshot created");
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool, CloudError> {
        match self
            .backoff
            .retry("DeleteSnapshot", CloudError::is_transient, || {
                self.api.delete_snapshot(snapshot_id)
            })
            .await
        {
            Ok(()) => Ok(true),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<CloudSnapshot, CloudError> {
        let query = SnapshotQuery {
            filter: SnapshotFilter {
                snapshot_ids: vec![snapshot_id.to_owned()],
                ..Default::default()
            },
            ..Default::default()
        };
        self.read_snapshots(query)
            .await?
            .snapshots
            .into_iter()
            .next()
            .map(CloudSnapshot::from)
            .ok_or_else(|| CloudError::NotFound(format!("snapshot {snapshot_id}")))
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Option<CloudSnapshot>, CloudError> {
        let query = SnapshotQuery {
            filter: SnapshotFilter {
                tags: vec![format!("{TAG_SNAPSHOT_NAME}={name}")],
                ..Default::default()
            },
            ..Default::default()
        };
        Ok(self
            .read_snapshots(query)
            .await?
            .snapshots
            .into_iter()
            .next()
            .map(CloudSnapshot::from))
    }

    async fn list_snapshots(
        &self,
        source_volume_id: Option<&str>,
        max_results: Option<u32>,
        next_token: Option<&str>,
    ) -> Result<SnapshotPage, CloudError> {
        let query = SnapshotQuery {
            filter: SnapshotFilter {
                volume_ids: source_volume_id.map(str::to_owned).into_iter().collect(),
                ..Default::default()
            },
            results_per_page: max_results,
            next_page_token: next_token.map(str::to_owned),
        };
        let listing = self.read_snapshots(query).await?;
        Ok(SnapshotPage {
            snapshots: listing
                .snapshots
                .into_iter()
                .map(CloudSnapshot::from)
                .collect(),
            next_token: listing.next_page_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{FakeProvider, Verb};
    use std::time::Duration;

    fn cloud(fake: &Arc<FakeProvider>) -> BsuCloud {
        BsuCloud::new(
            Arc::clone(fake) as Arc<dyn ProviderApi>,
            "eu-west-2",
            BackoffPolicy::new(Duration::from_millis(1), 1.0, 6),
        )
    }

    fn opts(name: &str, gib: u64) -> DiskOptions {
        DiskOptions {
            capacity_gib: gib,
            tags: HashMap::from([(TAG_VOLUME_NAME.to_owned(), name.to_owned())]),
            ..Default::default()
        }
    }

    #[test]
    fn iops_clamping() {
        assert_eq!(provisioned_iops(4, 50), 200);
        assert_eq!(provisioned_iops(1, 50), MIN_TOTAL_IOPS);
        assert_eq!(provisioned_iops(100, 1000), 13_000);
        assert_eq!(provisioned_iops(10, 1000), 3_000);
    }

    #[tokio::test]
    async fn create_applies_defaults_and_waits_for_available() {
        let fake = Arc::new(FakeProvider::new());
        fake.set_creation_delay(2);
        let cloud = cloud(&fake);

        let disk = cloud.create_disk(&opts("pvc-1", 4)).await.unwrap();
        assert_eq!(disk.state, state::AVAILABLE);
        assert_eq!(disk.volume_type, VOLUME_TYPE_GP2);
        assert_eq!(disk.availability_zone, "eu-west-2a");
        assert_eq!(disk.iops, None);

        let found = cloud.get_disk_by_name("pvc-1").await.unwrap().unwrap();
        assert_eq!(found.volume_id, disk.volume_id);
    }

    #[tokio::test]
    async fn create_io1_sets_iops() {
        let fake = Arc::new(FakeProvider::new());
        let cloud = cloud(&fake);
        let mut o = opts("pvc-io", 4);
        o.volume_type = VOLUME_TYPE_IO1.into();
        o.iops_per_gb = Some(50);
        let disk = cloud.create_disk(&o).await.unwrap();
        assert_eq!(disk.iops, Some(200));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_next(Verb::CreateVolume, CloudError::api(503, "ServiceUnavailable", ""));
        fake.fail_next(Verb::CreateVolume, CloudError::api(429, "RequestLimitExceeded", ""));
        let cloud = cloud(&fake);

        cloud.create_disk(&opts("pvc-1", 1)).await.unwrap();
        assert_eq!(fake.calls(Verb::CreateVolume), 3);
        assert_eq!(fake.volume_count(), 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_next(
            Verb::CreateVolume,
            CloudError::api(400, "InvalidParameterValue", "size"),
        );
        let cloud = cloud(&fake);

        let err = cloud.create_disk(&opts("pvc-1", 1)).await.unwrap_err();
        assert!(matches!(err, CloudError::Api { status: 400, .. }));
        assert_eq!(fake.calls(Verb::CreateVolume), 1);
    }

    #[tokio::test]
    async fn attach_polls_until_linked_and_detach_releases() {
        let fake = Arc::new(FakeProvider::new());
        fake.add_vm("i-1");
        fake.set_link_delay(2);
        let cloud = cloud(&fake);
        let disk = cloud.create_disk(&opts("pvc-1", 4)).await.unwrap();

        let device = cloud.attach_disk(&disk.volume_id, "i-1").await.unwrap();
        assert_eq!(device, "/dev/xvdb");
        assert_eq!(cloud.devices.reserved_count("i-1"), 0);

        // Already attached: no second link call.
        let again = cloud.attach_disk(&disk.volume_id, "i-1").await.unwrap();
        assert_eq!(again, device);
        assert_eq!(fake.calls(Verb::LinkVolume), 1);

        cloud.detach_disk(&disk.volume_id, "i-1").await.unwrap();
        let disk = cloud.get_disk(&disk.volume_id).await.unwrap();
        assert!(disk.link_to("i-1").is_none());
    }

    #[tokio::test]
    async fn attach_that_never_completes_times_out() {
        let fake = Arc::new(FakeProvider::new());
        fake.add_vm("i-1");
        fake.set_link_delay(u32::MAX);
        let cloud = cloud(&fake);
        let disk = cloud.create_disk(&opts("pvc-1", 4)).await.unwrap();

        let err = cloud.attach_disk(&disk.volume_id, "i-1").await.unwrap_err();
        assert!(matches!(err, CloudError::Timeout(_)));
        assert_eq!(cloud.devices.reserved_count("i-1"), 0);
    }

    #[tokio::test]
    async fn delete_missing_disk_reports_false() {
        let fake = Arc::new(FakeProvider::new());
        let cloud = cloud(&fake);
        assert!(!cloud.delete_disk("vol-missing").await.unwrap());
    }

    #[tokio::test]
    async fn resize_never_shrinks() {
        let fake = Arc::new(FakeProvider::new());
        let cloud = cloud(&fake);
        let disk = cloud.create_disk(&opts("pvc-1", 8)).await.unwrap();

        assert_eq!(cloud.resize_disk(&disk.volume_id, 4).await.unwrap(), 8);
        assert_eq!(fake.calls(Verb::UpdateVolume), 0);
        assert_eq!(cloud.resize_disk(&disk.volume_id, 12).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn snapshot_lookup_by_name() {
        let fake = Arc::new(FakeProvider::new());
        let cloud = cloud(&fake);
        let disk = cloud.create_disk(&opts("pvc-1", 8)).await.unwrap();

        let tags = HashMap::from([(TAG_SNAPSHOT_NAME.to_owned(), "snap-a".to_owned())]);
        let snap = cloud.create_snapshot(&disk.volume_id, &tags).await.unwrap();
        assert!(!snap.is_ready());

        let found = cloud.get_snapshot_by_name("snap-a").await.unwrap().unwrap();
        assert_eq!(found.snapshot_id, snap.snapshot_id);
        assert!(cloud.get_snapshot_by_name("snap-b").await.unwrap().is_none());

        assert!(cloud.delete_snapshot(&snap.snapshot_id).await.unwrap());
        assert!(!cloud.delete_snapshot(&snap.snapshot_id).await.unwrap());
    }

    #[tokio::test]
    async fn untagged_disk_is_deleted_with_retries() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_next(Verb::CreateTags, CloudError::api(400, "InvalidParameterValue", "tag"));
        fake.fail_next(Verb::DeleteVolume, CloudError::api(503, "ServiceUnavailable", ""));
        let cloud = cloud(&fake);

        let err = cloud.create_disk(&opts("pvc-1", 1)).await.unwrap_err();
        assert!(matches!(err, CloudError::Api { status: 400, .. }));
        assert_eq!(fake.calls(Verb::DeleteVolume), 2);
        assert_eq!(fake.volume_count(), 0);
    }

    #[tokio::test]
    async fn untagged_snapshot_is_deleted() {
        let fake = Arc::new(FakeProvider::new());
        let cloud = cloud(&fake);
        let disk = cloud.create_disk(&opts("pvc-1", 8)).await.unwrap();
        fake.fail_next(Verb::CreateTags, CloudError::api(400, "InvalidParameterValue", "tag"));
        fake.fail_next(Verb::DeleteSnapshot, CloudError::api(503, "ServiceUnavailable", ""));

        let tags = HashMap::from([(TAG_SNAPSHOT_NAME.to_owned(), "snap-a".to_owned())]);
        let err = cloud.create_snapshot(&disk.volume_id, &tags).await.unwrap_err();
        assert!(matches!(err, CloudError::Api { status: 400, .. }));
        assert_eq!(fake.calls(Verb::DeleteSnapshot), 2);
        assert_eq!(fake.snapshot_count(), 0);
    }
}
