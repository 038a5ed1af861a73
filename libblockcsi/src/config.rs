//! Plugin configuration.
//!
//! Environment variables:
//! - `MAX_BSU_VOLUMES`: volumes a node may attach, reported by
//!   `NodeGetInfo`.  Defaults to 39.
//!
//! Backoff tuning lives with [`BackoffPolicy`](crate::backoff::BackoffPolicy)
//! and provider credentials with [`OscCredentials`](crate::cloud::OscCredentials).

use std::collections::HashMap;
use std::sync::LazyLock;

pub const DRIVER_NAME: &str = "bsu.csi.outscale.com";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const ENV_MAX_BSU_VOLUMES: &str = "MAX_BSU_VOLUMES";
pub const DEFAULT_MAX_VOLUMES: u64 = 39;

/// Attachable volume limit, read from the environment at first access.
pub static MAX_VOLUMES: LazyLock<u64> = LazyLock::new(|| {
    max_volumes_from(std::env::var(ENV_MAX_BSU_VOLUMES).ok().as_deref())
});

fn max_volumes_from(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_VOLUMES)
}

/// Identity of the node the plugin runs on, as discovered from instance
/// metadata or given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMetadata {
    pub instance_id: String,
    pub region: String,
    pub zone: String,
}

#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Added to every created volume.
    pub extra_volume_tags: HashMap<String, String>,
    /// Added to every created snapshot.
    pub extra_snapshot_tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Passed to `cryptsetup luksOpen` verbatim.
    pub luks_open_flags: Vec<String>,
    pub max_volumes: u64,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            luks_open_flags: Vec::new(),
            max_volumes: *MAX_VOLUMES,
        }
    }
}
