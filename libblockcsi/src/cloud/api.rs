//! Raw provider verbs and their wire types.
//!
//! The structs mirror the provider's JSON API (PascalCase fields), so
//! [`OscApi`](super::OscApi) can send and parse them directly and
//! [`FakeProvider`](super::FakeProvider) can speak the same shapes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CloudError, CloudSnapshot, Disk, DiskLink};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceTag {
    pub key: String,
    pub value: String,
}

pub fn tags_to_map(tags: &[ResourceTag]) -> HashMap<String, String> {
    tags.iter()
        .map(|t| (t.key.clone(), t.value.clone()))
        .collect()
}

pub fn tags_from_map(tags: &HashMap<String, String>) -> Vec<ResourceTag> {
    let mut out: Vec<ResourceTag> = tags
        .iter()
        .map(|(k, v)| ResourceTag {
            key: k.clone(),
            value: v.clone(),
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinkedVolume {
    pub vm_id: String,
    pub volume_id: String,
    pub device_name: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiVolume {
    pub volume_id: String,
    /// Size in GiB.
    pub size: u64,
    pub subregion_name: String,
    pub volume_type: String,
    #[serde(default)]
    pub iops: Option<u32>,
    pub state: String,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<ResourceTag>,
    #[serde(default)]
    pub linked_volumes: Vec<LinkedVolume>,
}

impl From<ApiVolume> for Disk {
    fn from(v: ApiVolume) -> Self {
        Self {
            tags: tags_to_map(&v.tags),
            links: v
                .linked_volumes
                .into_iter()
                .map(|l| DiskLink {
                    vm_id: l.vm_id,
                    device_name: l.device_name,
                    state: l.state,
                })
                .collect(),
            volume_id: v.volume_id,
            capacity_gib: v.size,
            availability_zone: v.subregion_name,
            volume_type: v.volume_type,
            iops: v.iops,
            state: v.state,
            snapshot_id: v.snapshot_id.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiSnapshot {
    pub snapshot_id: String,
    pub volume_id: String,
    pub volume_size: u64,
    pub state: String,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub creation_date: String,
    #[serde(default)]
    pub tags: Vec<ResourceTag>,
}

impl From<ApiSnapshot> for CloudSnapshot {
    fn from(s: ApiSnapshot) -> Self {
        let creation_time = chrono::DateTime::parse_from_rfc3339(&s.creation_date)
            .map(|t| t.timestamp())
            .unwrap_or_default();
        Self {
            tags: tags_to_map(&s.tags),
            snapshot_id: s.snapshot_id,
            source_volume_id: s.volume_id,
            size_gib: s.volume_size,
            creation_time,
            state: s.state,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BsuRef {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockDeviceMapping {
    pub device_name: String,
    pub bsu: BsuRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiVm {
    pub vm_id: String,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateVolumeInput {
    pub size: u64,
    pub subregion_name: String,
    pub volume_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

/// Volume filters; empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeFilter {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub volume_ids: Vec<String>,
    /// `key=value` pairs.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnapshotFilter {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub snapshot_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub volume_ids: Vec<String>,
    /// `key=value` pairs.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotQuery {
    pub filter: SnapshotFilter,
    pub results_per_page: Option<u32>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotListing {
    pub snapshots: Vec<ApiSnapshot>,
    pub next_page_token: Option<String>,
}

/// The provider verbs used by [`BsuCloud`](super::BsuCloud).  One call, one
/// request: implementations never retry.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn create_volume(&self, input: CreateVolumeInput) -> Result<ApiVolume, CloudError>;
    async fn read_volumes(&self, filter: VolumeFilter) -> Result<Vec<ApiVolume>, CloudError>;
    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError>;
    async fn link_volume(
        &self,
        volume_id: &str,
        vm_id: &str,
        device_name: &str,
    ) -> Result<(), CloudError>;
    async fn unlink_volume(&self, volume_id: &str) -> Result<(), CloudError>;
    async fn update_volume(&self, volume_id: &str, size_gib: u64) -> Result<ApiVolume, CloudError>;
    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<ApiSnapshot, CloudError>;
    async fn read_snapshots(&self, query: SnapshotQuery) -> Result<SnapshotListing, CloudError>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;
    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[ResourceTag],
    ) -> Result<(), CloudError>;
    async fn read_vms(&self, vm_ids: &[String]) -> Result<Vec<ApiVm>, CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_json_maps_to_disk() {
        let json = r#"{
            "VolumeId": "vol-12ab",
            "Size": 4,
            "SubregionName": "eu-west-2a",
            "VolumeType": "io1",
            "Iops": 200,
            "State": "in-use",
            "SnapshotId": "",
            "Tags": [{"Key": "CSIVolumeName", "Value": "pvc-1"}],
            "LinkedVolumes": [
                {"VmId": "i-1", "VolumeId": "vol-12ab", "DeviceName": "/dev/xvdb", "State": "attached"}
            ]
        }"#;
        let api: ApiVolume = serde_json::from_str(json).expect("deserialize");
        let disk = Disk::from(api);
        assert_eq!(disk.capacity_gib, 4);
        assert_eq!(disk.iops, Some(200));
        assert_eq!(disk.snapshot_id, None);
        assert_eq!(disk.tags.get("CSIVolumeName").map(String::as_str), Some("pvc-1"));
        assert_eq!(disk.link_to("i-1").map(|l| l.device_name.as_str()), Some("/dev/xvdb"));
    }

    #[test]
    fn snapshot_creation_date_parsed() {
        let api = ApiSnapshot {
            snapshot_id: "snap-1".into(),
            volume_id: "vol-1".into(),
            volume_size: 10,
            state: "completed".into(),
            creation_date: "2024-05-01T10:00:00.000Z".into(),
            tags: vec![],
        };
        let snap = CloudSnapshot::from(api);
        assert_eq!(snap.creation_time, 1_714_557_600);
        assert!(snap.is_ready());
    }

    #[test]
    fn filter_omits_empty_fields() {
        let filter = VolumeFilter {
            tags: vec!["CSIVolumeName=pvc-1".into()],
            ..Default::default()
        };
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"{"Tags":["CSIVolumeName=pvc-1"]}"#);
    }
}
