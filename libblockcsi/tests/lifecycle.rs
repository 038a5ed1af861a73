//! End-to-end flows over the plugin socket, backed by the in-memory
//! provider and mounter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use libblockcsi::backoff::BackoffPolicy;
use libblockcsi::cloud::{BsuCloud, FakeProvider, ProviderApi};
use libblockcsi::config::{ControllerOptions, NodeMetadata, NodeOptions};
use libblockcsi::inflight::InFlight;
use libblockcsi::mounter::{FakeMounter, Mounter};
use libblockcsi::service::{ControllerService, NodeService};
use libblockcsi::transport::{CsiClient, CsiServer, Endpoint};
use libblockcsi::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const GIB: u64 = 1 << 30;
const NODE: &str = "i-1";
const STAGE: &str = "/var/lib/kubelet/plugins/stage/pv-1";
const TARGET: &str = "/var/lib/kubelet/pods/p1/volumes/pv-1";

struct Harness {
    _dir: TempDir,
    cancel: CancellationToken,
    provider: Arc<FakeProvider>,
    mounter: Arc<FakeMounter>,
    inflight: InFlight,
    client: CsiClient,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start(mode: Mode) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::new());
    provider.add_vm(NODE);
    let mounter = Arc::new(FakeMounter::new());
    mounter.add_device("/dev/xvdb", 4 * GIB);
    let inflight = InFlight::new();

    let mut driver = Driver::new();
    if mode.runs_controller() {
        let cloud = BsuCloud::new(
            Arc::clone(&provider) as Arc<dyn ProviderApi>,
            "eu-west-2",
            BackoffPolicy::new(Duration::from_millis(1), 1.0, 10),
        );
        let controller = ControllerService::new(Arc::new(cloud), ControllerOptions::default())
            .expect("controller")
            .with_inflight(inflight.clone());
        driver = driver.with_controller(Arc::new(controller));
    }
    if mode.runs_node() {
        let node = NodeService::new(
            Arc::clone(&mounter) as Arc<dyn Mounter>,
            NodeMetadata {
                instance_id: NODE.into(),
                region: "eu-west-2".into(),
                zone: "eu-west-2a".into(),
            },
            NodeOptions {
                luks_open_flags: Vec::new(),
                max_volumes: 39,
            },
        );
        driver = driver.with_node(Arc::new(node));
    }

    let endpoint = Endpoint::Unix(dir.path().join("csi.sock"));
    let server = CsiServer::bind(endpoint.clone(), Arc::new(driver))
        .await
        .expect("bind");
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(cancel.clone()));
    let client = CsiClient::connect(&endpoint).await.expect("connect");

    Harness {
        _dir: dir,
        cancel,
        provider,
        mounter,
        inflight,
        client,
    }
}

impl Harness {
    async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.client.request(msg).await.expect("transport").into_result()
    }

    async fn ok(&self, msg: CsiMessage) -> CsiMessage {
        let label = msg.to_string();
        self.call(msg)
            .await
            .unwrap_or_else(|e| panic!("{label} failed: {e}"))
    }
}

fn stage(volume_id: &VolumeId, publish_context: &HashMap<String, String>) -> NodeStageVolumeRequest {
    NodeStageVolumeRequest {
        volume_id: volume_id.clone(),
        publish_context: publish_context.clone(),
        staging_target_path: STAGE.into(),
        volume_capability: VolumeCapability::mount("xfs"),
        secrets: Secrets::default(),
        volume_context: HashMap::new(),
    }
}

fn publish(volume_id: &VolumeId, publish_context: &HashMap<String, String>) -> NodePublishVolumeRequest {
    NodePublishVolumeRequest {
        volume_id: volume_id.clone(),
        publish_context: publish_context.clone(),
        staging_target_path: STAGE.into(),
        target_path: TARGET.into(),
        volume_capability: VolumeCapability::mount("xfs"),
        read_only: false,
        volume_context: HashMap::new(),
    }
}

async fn create_and_attach(h: &Harness, params: &[(&str, &str)]) -> (Volume, HashMap<String, String>) {
    let created = h
        .ok(CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "pv-1".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 4 * GIB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::mount("xfs")],
            parameters: params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            ..Default::default()
        }))
        .await;
    let CsiMessage::VolumeCreated(volume) = created else {
        panic!("unexpected response {created}");
    };

    let published = h
        .ok(CsiMessage::ControllerPublishVolume(ControllerPublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: NODE.into(),
            volume_capability: VolumeCapability::mount("xfs"),
            readonly: false,
            volume_context: volume.volume_context.clone(),
        }))
        .await;
    let CsiMessage::Published(context) = published else {
        panic!("unexpected response {published}");
    };
    (volume, context)
}

#[tokio::test]
async fn full_lifecycle_with_repeated_steps() {
    let h = start(Mode::All).await;
    let (volume, context) =
        create_and_attach(&h, &[("type", "io1"), ("iopsPerGB", "50")]).await;
    assert_eq!(volume.capacity_bytes, 4 * GIB);
    assert_eq!(context.get("devicePath").map(String::as_str), Some("/dev/xvdb"));

    let disk = h.provider.volume(&volume.volume_id.0).expect("volume exists");
    assert_eq!(disk.volume_type, "io1");
    assert_eq!(disk.iops, Some(200));

    for _ in 0..2 {
        h.ok(CsiMessage::StageVolume(stage(&volume.volume_id, &context))).await;
    }
    for _ in 0..2 {
        h.ok(CsiMessage::PublishVolume(publish(&volume.volume_id, &context))).await;
    }
    assert_eq!(h.mounter.format_count(), 1);

    h.mounter.write_file(TARGET, "hello.txt", b"hello").expect("write");
    assert_eq!(h.mounter.read_file(STAGE, "hello.txt").as_deref(), Some(&b"hello"[..]));

    let stats = h
        .ok(CsiMessage::NodeGetVolumeStats {
            volume_id: volume.volume_id.clone(),
            volume_path: TARGET.into(),
        })
        .await;
    let CsiMessage::VolumeStatsResponse(stats) = stats else {
        panic!("unexpected response {stats}");
    };
    assert_eq!(stats.usage[0].used, 5);

    for _ in 0..2 {
        h.ok(CsiMessage::UnpublishVolume {
            volume_id: volume.volume_id.clone(),
            target_path: TARGET.into(),
        })
        .await;
    }
    for _ in 0..2 {
        h.ok(CsiMessage::UnstageVolume {
            volume_id: volume.volume_id.clone(),
            staging_target_path: STAGE.into(),
        })
        .await;
    }
    assert!(h.mounter.mount_table().is_empty());

    for _ in 0..2 {
        h.ok(CsiMessage::ControllerUnpublishVolume(ControllerUnpublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: NODE.into(),
        }))
        .await;
    }
    for _ in 0..2 {
        h.ok(CsiMessage::DeleteVolume(volume.volume_id.clone())).await;
    }
    assert_eq!(h.provider.volume_count(), 0);
}

#[tokio::test]
async fn skipping_a_step_is_refused() {
    let h = start(Mode::All).await;
    let (volume, context) = create_and_attach(&h, &[]).await;

    let err = h
        .call(CsiMessage::PublishVolume(publish(&volume.volume_id, &context)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = h
        .call(CsiMessage::DeleteVolume(volume.volume_id.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn encrypted_restage_keeps_data() {
    let h = start(Mode::All).await;
    let (volume, context) = create_and_attach(&h, &[("encrypted", "true")]).await;
    assert_eq!(volume.volume_context.get("encrypted").map(String::as_str), Some("true"));

    let staged = |passphrase: &str| {
        let mut req = stage(&volume.volume_id, &context);
        req.volume_context = volume.volume_context.clone();
        req.secrets = Secrets::from([("luksPassphrase", passphrase)]);
        CsiMessage::StageVolume(req)
    };
    let unstage = || CsiMessage::UnstageVolume {
        volume_id: volume.volume_id.clone(),
        staging_target_path: STAGE.into(),
    };

    h.ok(staged("correct horse")).await;
    h.mounter.write_file(STAGE, "state.db", b"42").expect("write");
    h.ok(unstage()).await;

    let err = h.call(staged("battery staple")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    h.ok(staged("correct horse")).await;
    assert_eq!(h.mounter.read_file(STAGE, "state.db").as_deref(), Some(&b"42"[..]));
    assert_eq!(h.mounter.format_count(), 1);
    assert_eq!(h.mounter.luks_format_count(), 1);

    h.ok(unstage()).await;
    assert!(h.mounter.open_mappings().is_empty());
}

#[tokio::test]
async fn node_mode_leaves_controller_unimplemented() {
    let h = start(Mode::Node).await;
    let err = h
        .call(CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "pv-1".into(),
            volume_capabilities: vec![VolumeCapability::mount("xfs")],
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let info = h.ok(CsiMessage::GetNodeInfo).await;
    let CsiMessage::NodeInfoResponse(info) = info else {
        panic!("unexpected response {info}");
    };
    assert_eq!(info.node_id, NODE);

    let caps = h.ok(CsiMessage::GetPluginCapabilities).await;
    let CsiMessage::PluginCapabilitiesResponse(caps) = caps else {
        panic!("unexpected response {caps}");
    };
    assert!(!caps.contains(&PluginCapability::ControllerService));
}

#[tokio::test]
async fn concurrent_operation_is_aborted() {
    let h = start(Mode::Controller).await;
    let (volume, _) = create_and_attach(&h, &[]).await;

    let held = h.inflight.try_acquire(volume.volume_id.0.as_str()).expect("lock");
    let err = h
        .call(CsiMessage::ControllerUnpublishVolume(ControllerUnpublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: NODE.into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
    drop(held);

    h.ok(CsiMessage::ControllerUnpublishVolume(ControllerUnpublishVolumeRequest {
        volume_id: volume.volume_id.clone(),
        node_id: NODE.into(),
    }))
    .await;
    assert!(h.inflight.is_empty());
}

#[tokio::test]
async fn requests_share_one_connection() {
    let h = start(Mode::All).await;
    for _ in 0..3 {
        assert!(matches!(h.ok(CsiMessage::Probe).await, CsiMessage::ProbeResult(true)));
    }
    let probed = h
        .client
        .request_with_timeout(CsiMessage::Probe, Duration::from_secs(5))
        .await
        .expect("transport");
    assert!(matches!(probed, CsiMessage::ProbeResult(true)));
    let info = h.ok(CsiMessage::GetPluginInfo).await;
    assert!(matches!(info, CsiMessage::PluginInfoResponse(ref i) if i.name == "bsu.csi.outscale.com"));
}
