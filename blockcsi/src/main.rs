use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use libblockcsi::backoff::BackoffPolicy;
use libblockcsi::cloud::{BsuCloud, OscApi, OscCredentials, ProviderApi};
use libblockcsi::config::{ControllerOptions, NodeMetadata, NodeOptions, DRIVER_NAME, DRIVER_VERSION};
use libblockcsi::mounter::{LinuxMounter, Mounter};
use libblockcsi::service::{ControllerService, NodeService};
use libblockcsi::transport::{parse_endpoint, CsiServer};
use libblockcsi::util::parse_key_value_list;
use libblockcsi::{Driver, Mode};

#[derive(Parser, Debug)]
#[command(name = "blockcsi", version, about = "CSI plugin for cloud block storage volumes")]
struct Args {
    /// Socket to serve on: unix:///path or tcp://host:port
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Services to run: controller, node or all
    #[arg(long, env = "CSI_MODE", default_value_t = Mode::All)]
    mode: Mode,

    /// Tags added to every created volume, as k1=v1,k2=v2
    #[arg(long, default_value = "")]
    extra_volume_tags: String,

    /// Tags added to every created snapshot, as k1=v1,k2=v2
    #[arg(long, default_value = "")]
    extra_snapshot_tags: String,

    /// Extra flags for `cryptsetup luksOpen`, passed verbatim
    #[arg(long, value_delimiter = ' ', allow_hyphen_values = true)]
    luks_open_flags: Vec<String>,

    /// VM id of this node (required in node mode)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Availability zone of this node; defaults to `<region>a`
    #[arg(long, env = "NODE_ZONE")]
    zone: Option<String>,

    /// Provider region; falls back to OSC_REGION / AWS_REGION
    #[arg(long)]
    region: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_tags(raw: &str, flag: &str) -> Result<HashMap<String, String>> {
    parse_key_value_list(raw).map_err(|e| anyhow::anyhow!("--{flag}: {e}"))
}

fn controller(args: &Args) -> Result<Arc<ControllerService>> {
    let credentials = OscCredentials::from_env(args.region.as_deref())?;
    let region = credentials.region.clone();
    let api: Arc<dyn ProviderApi> = Arc::new(OscApi::new(credentials)?);
    let cloud = BsuCloud::new(api, region.clone(), BackoffPolicy::from_env());
    let options = ControllerOptions {
        extra_volume_tags: parse_tags(&args.extra_volume_tags, "extra-volume-tags")?,
        extra_snapshot_tags: parse_tags(&args.extra_snapshot_tags, "extra-snapshot-tags")?,
    };
    info!(%region, "controller service enabled");
    Ok(Arc::new(ControllerService::new(Arc::new(cloud), options)?))
}

fn node(args: &Args) -> Result<Arc<NodeService>> {
    let Some(instance_id) = args.node_id.clone().filter(|id| !id.is_empty()) else {
        bail!("--node-id is required when running the node service");
    };
    let region = args
        .region
        .clone()
        .or_else(|| std::env::var("OSC_REGION").ok())
        .unwrap_or_default();
    let zone = match (&args.zone, region.is_empty()) {
        (Some(zone), _) => zone.clone(),
        (None, false) => format!("{region}a"),
        (None, true) => bail!("--zone or --region is required when running the node service"),
    };
    let options = NodeOptions {
        luks_open_flags: args.luks_open_flags.iter().filter(|f| !f.is_empty()).cloned().collect(),
        ..NodeOptions::default()
    };
    info!(%instance_id, %zone, max_volumes = options.max_volumes, "node service enabled");
    let mounter: Arc<dyn Mounter> = Arc::new(LinuxMounter::new());
    Ok(Arc::new(NodeService::new(
        mounter,
        NodeMetadata {
            instance_id,
            region,
            zone,
        },
        options,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    info!(driver = DRIVER_NAME, version = DRIVER_VERSION, mode = %args.mode, "starting");

    let mut driver = Driver::new();
    if args.mode.runs_controller() {
        driver = driver.with_controller(controller(&args).context("controller setup")?);
    }
    if args.mode.runs_node() {
        driver = driver.with_node(node(&args).context("node setup")?);
    }

    let endpoint = parse_endpoint(&args.endpoint)?;
    let server = CsiServer::bind(endpoint, Arc::new(driver)).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c, shutting down"),
        }
        shutdown.cancel();
    });

    server.serve(cancel).await?;
    Ok(())
}
