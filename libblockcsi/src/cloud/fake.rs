//! In-memory [`ProviderApi`] used by unit and integration tests.
//!
//! Behaves like the real provider closely enough for the controller paths:
//! volumes start out `creating` and links start out `attaching` for a
//! configurable number of reads, snapshots complete on the first read after
//! creation, and any verb can be made to fail with a queued error.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::api::*;
use super::{state, CloudError};

const PENDING: &str = "pending";
const ROOT_DEVICE: &str = "/dev/sda1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    CreateVolume,
    ReadVolumes,
    DeleteVolume,
    LinkVolume,
    UnlinkVolume,
    UpdateVolume,
    CreateSnapshot,
    ReadSnapshots,
    DeleteSnapshot,
    CreateTags,
    ReadVms,
}

#[derive(Debug)]
struct FakeVolume {
    volume: ApiVolume,
    reads_until_available: u32,
    reads_until_linked: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct State {
    volumes: BTreeMap<String, FakeVolume>,
    snapshots: BTreeMap<String, ApiSnapshot>,
    vms: HashSet<String>,
    failures: HashMap<Verb, VecDeque<CloudError>>,
    calls: HashMap<Verb, u32>,
    creation_delay: u32,
    link_delay: u32,
}

#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<State>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and pop an injected failure, if any.
    fn enter(&self, verb: Verb) -> Result<MutexGuard<'_, State>, CloudError> {
        let mut st = self.lock();
        *st.calls.entry(verb).or_default() += 1;
        if let Some(err) = st.failures.get_mut(&verb).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(st)
    }

    pub fn add_vm(&self, vm_id: &str) {
        self.lock().vms.insert(vm_id.to_owned());
    }

    /// Reads a new volume stays `creating` for.
    pub fn set_creation_delay(&self, reads: u32) {
        self.lock().creation_delay = reads;
    }

    /// Reads a new link stays `attaching` for.
    pub fn set_link_delay(&self, reads: u32) {
        self.lock().link_delay = reads;
    }

    /// Queue an error for the next call of `verb`.
    pub fn fail_next(&self, verb: Verb, err: CloudError) {
        self.lock().failures.entry(verb).or_default().push_back(err);
    }

    pub fn calls(&self, verb: Verb) -> u32 {
        self.lock().calls.get(&verb).copied().unwrap_or(0)
    }

    pub fn volume_count(&self) -> usize {
        self.lock().volumes.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn volume(&self, volume_id: &str) -> Option<ApiVolume> {
        self.lock().volumes.get(volume_id).map(|v| v.volume.clone())
    }

    /// Force a volume into `state`, e.g. to simulate a provider-side error.
    pub fn set_volume_state(&self, volume_id: &str, new_state: &str) {
        if let Some(v) = self.lock().volumes.get_mut(volume_id) {
            v.volume.state = new_state.to_owned();
            v.reads_until_available = 0;
        }
    }

    pub fn set_snapshot_state(&self, snapshot_id: &str, new_state: &str) {
        if let Some(s) = self.lock().snapshots.get_mut(snapshot_id) {
            s.state = new_state.to_owned();
        }
    }

    /// Insert a volume directly, bypassing `CreateVolume`.
    pub fn insert_volume(&self, volume: ApiVolume) {
        self.lock().volumes.insert(
            volume.volume_id.clone(),
            FakeVolume {
                volume,
                reads_until_available: 0,
                reads_until_linked: HashMap::new(),
            },
        );
    }
}

fn new_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

fn tag_matches(tags: &[ResourceTag], filters: &[String]) -> bool {
    filters.iter().all(|f| {
        let (k, v) = f.split_once('=').unwrap_or((f.as_str(), ""));
        tags.iter().any(|t| t.key == k && t.value == v)
    })
}

/// Advance the per-read countdowns of one volume.
fn tick(v: &mut FakeVolume) {
    if v.volume.state == state::CREATING {
        if v.reads_until_available == 0 {
            v.volume.state = state::AVAILABLE.to_owned();
        } else {
            v.reads_until_available -= 1;
        }
    }
    for link in &mut v.volume.linked_volumes {
        if link.state != state::ATTACHING {
            continue;
        }
        let left = v.reads_until_linked.entry(link.vm_id.clone()).or_default();
        if *left == 0 {
            link.state = state::ATTACHED.to_owned();
        } else {
            *left -= 1;
        }
    }
}

fn refresh_volume_state(v: &mut ApiVolume) {
    if v.state == state::AVAILABLE || v.state == state::IN_USE {
        v.state = if v.linked_volumes.is_empty() {
            state::AVAILABLE
        } else {
            state::IN_USE
        }
        .to_owned();
    }
}

#[async_trait]
impl ProviderApi for FakeProvider {
    async fn create_volume(&self, input: CreateVolumeInput) -> Result<ApiVolume, CloudError> {
        let mut st = self.enter(Verb::CreateVolume)?;
        if let Some(snap) = &input.snapshot_id {
            if !st.snapshots.contains_key(snap) {
                return Err(CloudError::NotFound(format!("snapshot {snap}")));
            }
        }
        let delay = st.creation_delay;
        let volume = ApiVolume {
            volume_id: new_id("vol"),
            size: input.size,
            subregion_name: input.subregion_name,
            volume_type: input.volume_type,
            iops: input.iops,
            state: if delay == 0 {
                state::AVAILABLE
            } else {
                state::CREATING
            }
            .to_owned(),
            snapshot_id: input.snapshot_id,
            tags: Vec::new(),
            linked_volumes: Vec::new(),
        };
        st.volumes.insert(
            volume.volume_id.clone(),
            FakeVolume {
                volume: volume.clone(),
                reads_until_available: delay.saturating_sub(1),
                reads_until_linked: HashMap::new(),
            },
        );
        Ok(volume)
    }

    async fn read_volumes(&self, filter: VolumeFilter) -> Result<Vec<ApiVolume>, CloudError> {
        let mut st = self.enter(Verb::ReadVolumes)?;
        let mut out = Vec::new();
        for (id, v) in st.volumes.iter_mut() {
            if !filter.volume_ids.is_empty() && !filter.volume_ids.contains(id) {
                continue;
            }
            if !tag_matches(&v.volume.tags, &filter.tags) {
                continue;
            }
            tick(v);
            out.push(v.volume.clone());
        }
        Ok(out)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        let mut st = self.enter(Verb::DeleteVolume)?;
        let v = st
            .volumes
            .get(volume_id)
            .ok_or_else(|| CloudError::NotFound(format!("volume {volume_id}")))?;
        if !v.volume.linked_volumes.is_empty() {
            return Err(CloudError::api(409, "VolumeInUse", "volume is linked"));
        }
        st.volumes.remove(volume_id);
        Ok(())
    }

    async fn link_volume(
        &self,
        volume_id: &str,
        vm_id: &str,
        device_name: &str,
    ) -> Result<(), CloudError> {
        let mut st = self.enter(Verb::LinkVolume)?;
        if !st.vms.contains(vm_id) {
            return Err(CloudError::NotFound(format!("vm {vm_id}")));
        }
        let device_taken = st.volumes.values().any(|v| {
            v.volume
                .linked_volumes
                .iter()
                .any(|l| l.vm_id == vm_id && l.device_name == device_name)
        });
        let delay = st.link_delay;
        let v = st
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(format!("volume {volume_id}")))?;
        if v.volume.linked_volumes.iter().any(|l| l.vm_id != vm_id) {
            return Err(CloudError::api(409, "VolumeInUse", "volume is linked elsewhere"));
        }
        if v.volume.linked_volumes.iter().any(|l| l.vm_id == vm_id) {
            return Ok(());
        }
        if device_taken {
            return Err(CloudError::api(
                400,
                "InvalidParameterValue",
                "device name already in use",
            ));
        }
        v.volume.linked_volumes.push(LinkedVolume {
            vm_id: vm_id.to_owned(),
            volume_id: volume_id.to_owned(),
            device_name: device_name.to_owned(),
            state: state::ATTACHING.to_owned(),
        });
        v.reads_until_linked.insert(vm_id.to_owned(), delay);
        refresh_volume_state(&mut v.volume);
        Ok(())
    }

    async fn unlink_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        let mut st = self.enter(Verb::UnlinkVolume)?;
        let v = st
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(format!("volume {volume_id}")))?;
        if v.volume.linked_volumes.is_empty() {
            return Err(CloudError::api(400, "IncorrectState", "volume is not linked"));
        }
        v.volume.linked_volumes.clear();
        v.reads_until_linked.clear();
        refresh_volume_state(&mut v.volume);
        Ok(())
    }

    async fn update_volume(&self, volume_id: &str, size_gib: u64) -> Result<ApiVolume, CloudError> {
        let mut st = self.enter(Verb::UpdateVolume)?;
        let v = st
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(format!("volume {volume_id}")))?;
        if size_gib < v.volume.size {
            return Err(CloudError::api(400, "InvalidParameterValue", "cannot shrink"));
        }
        v.volume.size = size_gib;
        Ok(v.volume.clone())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        _description: &str,
    ) -> Result<ApiSnapshot, CloudError> {
        let mut st = self.enter(Verb::CreateSnapshot)?;
        let size = st
            .volumes
            .get(volume_id)
            .map(|v| v.volume.size)
            .ok_or_else(|| CloudError::NotFound(format!("volume {volume_id}")))?;
        let snapshot = ApiSnapshot {
            snapshot_id: new_id("snap"),
            volume_id: volume_id.to_owned(),
            volume_size: size,
            state: PENDING.to_owned(),
            creation_date: chrono::Utc::now().to_rfc3339(),
            tags: Vec::new(),
        };
        st.snapshots
            .insert(snapshot.snapshot_id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn read_snapshots(&self, query: SnapshotQuery) -> Result<SnapshotListing, CloudError> {
        let mut st = self.enter(Verb::ReadSnapshots)?;
        let f = &query.filter;
        let mut matching = Vec::new();
        for (id, s) in st.snapshots.iter_mut() {
            if !f.snapshot_ids.is_empty() && !f.snapshot_ids.contains(id) {
                continue;
            }
            if !f.volume_ids.is_empty() && !f.volume_ids.contains(&s.volume_id) {
                continue;
            }
            if !tag_matches(&s.tags, &f.tags) {
                continue;
            }
            if s.state == PENDING {
                s.state = state::SNAPSHOT_COMPLETED.to_owned();
            }
            matching.push(s.clone());
        }

        let start = match &query.next_page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| CloudError::api(400, "InvalidParameterValue", "bad page token"))?,
            None => 0,
        };
        let per_page = query
            .results_per_page
            .map(|n| n as usize)
            .unwrap_or(usize::MAX);
        let end = start.saturating_add(per_page).min(matching.len());
        let page = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(SnapshotListing {
            snapshots: page,
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let mut st = self.enter(Verb::DeleteSnapshot)?;
        st.snapshots
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound(format!("snapshot {snapshot_id}")))
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[ResourceTag],
    ) -> Result<(), CloudError> {
        let mut guard = self.enter(Verb::CreateTags)?;
        let st = &mut *guard;
        for id in resource_ids {
            let target = if let Some(v) = st.volumes.get_mut(id) {
                &mut v.volume.tags
            } else if let Some(s) = st.snapshots.get_mut(id) {
                &mut s.tags
            } else {
                return Err(CloudError::NotFound(format!("resource {id}")));
            };
            for tag in tags {
                target.retain(|t| t.key != tag.key);
                target.push(tag.clone());
            }
        }
        Ok(())
    }

    async fn read_vms(&self, vm_ids: &[String]) -> Result<Vec<ApiVm>, CloudError> {
        let st = self.enter(Verb::ReadVms)?;
        Ok(vm_ids
            .iter()
            .filter(|id| st.vms.contains(id.as_str()))
            .map(|id| {
                let mut mappings = vec![BlockDeviceMapping {
                    device_name: ROOT_DEVICE.to_owned(),
                    bsu: BsuRef {
                        volume_id: format!("root-{id}"),
                    },
                }];
                for v in st.volumes.values() {
                    for l in v.volume.linked_volumes.iter().filter(|l| &l.vm_id == id) {
                        mappings.push(BlockDeviceMapping {
                            device_name: l.device_name.clone(),
                            bsu: BsuRef {
                                volume_id: v.volume.volume_id.clone(),
                            },
                        });
                    }
                }
                ApiVm {
                    vm_id: id.clone(),
                    block_device_mappings: mappings,
                }
            })
            .collect())
    }
}
