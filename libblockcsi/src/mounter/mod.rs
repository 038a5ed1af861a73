//! Local mount, filesystem and LUKS operations.
//!
//! The node service never touches the host directly; everything goes
//! through the [`Mounter`] trait so it can run against [`LinuxMounter`] in
//! production and [`FakeMounter`] in tests.  The mount table is re-read on
//! every query.

pub mod fake;
pub mod linux;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::CsiError;

pub use fake::FakeMounter;
pub use linux::LinuxMounter;

pub const MAPPER_DIR: &str = "/dev/mapper";
/// Filesystem type `blkid` reports for a LUKS container.
pub const FS_TYPE_LUKS: &str = "crypto_LUKS";

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{program} exited with {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{op} {path}: {reason}")]
    Sys {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("cannot parse output of {program}: {output}")]
    Parse { program: String, output: String },
}

impl MountError {
    pub(crate) fn sys(op: &'static str, path: &str, reason: impl ToString) -> Self {
        Self::Sys {
            op,
            path: path.to_owned(),
            reason: reason.to_string(),
        }
    }
}

impl From<MountError> for CsiError {
    fn from(e: MountError) -> Self {
        match e {
            MountError::NotFound(what) => CsiError::NotFound(what),
            other => CsiError::internal(other),
        }
    }
}

/// One line of `/proc/self/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Parse the contents of `/proc/self/mounts`.  Malformed lines are skipped.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                source: unescape(source),
                target: unescape(target),
                fs_type: fs_type.to_owned(),
                options: options.split(',').map(str::to_owned).collect(),
            })
        })
        .collect()
}

/// Undo the kernel's octal escaping (`\040` for space and friends).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or_default();
            if let Ok(b) = u8::from_str_radix(octal, 8) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// LUKS creation parameters; `None` keeps the cryptsetup default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LuksOptions {
    pub cipher: Option<String>,
    pub hash: Option<String>,
    pub key_size: Option<String>,
}

/// Mapping name for a device: `<basename>_crypt`.
pub fn luks_mapper_name(device: &str) -> String {
    let base = Path::new(device)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(device);
    format!("{base}_crypt")
}

pub fn mapper_path(name: &str) -> String {
    format!("{MAPPER_DIR}/{name}")
}

/// Mapping name of a `/dev/mapper/<name>` path.
pub fn mapper_name(device: &str) -> Option<&str> {
    device
        .strip_prefix(MAPPER_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|n| !n.is_empty())
}

/// Filesystem usage of a mounted path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub used_inodes: u64,
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Current mount table, freshly read.
    async fn mount_entries(&self) -> Result<Vec<MountEntry>, MountError>;

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmount `target`.  Not being mounted is not an error.
    async fn unmount(&self, target: &str) -> Result<(), MountError>;

    async fn format(&self, device: &str, fs_type: &str) -> Result<(), MountError>;

    /// Filesystem signature on `device`, `None` for a blank device.
    async fn probe_fs_type(&self, device: &str) -> Result<Option<String>, MountError>;

    /// Size of a block device in bytes.
    async fn device_size(&self, device: &str) -> Result<u64, MountError>;

    /// Size of the filesystem on `device` (mounted at `mount_path`) in bytes.
    async fn filesystem_size(
        &self,
        device: &str,
        mount_path: &str,
        fs_type: &str,
    ) -> Result<u64, MountError>;

    /// Grow the filesystem to fill its device.
    async fn resize_fs(&self, device: &str, mount_path: &str, fs_type: &str)
        -> Result<(), MountError>;

    async fn is_luks(&self, device: &str) -> Result<bool, MountError>;

    async fn luks_format(
        &self,
        device: &str,
        passphrase: &str,
        opts: &LuksOptions,
    ) -> Result<(), MountError>;

    /// Whether `passphrase` unlocks `device`.
    async fn luks_check_passphrase(&self, device: &str, passphrase: &str)
        -> Result<bool, MountError>;

    /// Open `device` as `/dev/mapper/<name>`.  `extra_flags` go to
    /// `cryptsetup luksOpen` verbatim.
    async fn luks_open(
        &self,
        device: &str,
        name: &str,
        passphrase: &str,
        extra_flags: &[String],
    ) -> Result<(), MountError>;

    async fn luks_is_open(&self, name: &str) -> Result<bool, MountError>;

    /// Close a mapping.  An absent mapping is not an error.
    async fn luks_close(&self, name: &str) -> Result<(), MountError>;

    /// Resize an open mapping to its backing device.
    async fn luks_resize(&self, name: &str) -> Result<(), MountError>;

    async fn path_exists(&self, path: &str) -> Result<bool, MountError>;

    /// Create a directory and its parents.
    async fn make_dir(&self, path: &str) -> Result<(), MountError>;

    /// Create an empty file (and its parent directories) if absent.
    async fn make_file(&self, path: &str) -> Result<(), MountError>;

    /// Remove a file or empty directory.  Absence is not an error.
    async fn remove_path(&self, path: &str) -> Result<(), MountError>;

    /// Follow symlinks to the canonical device path, `None` if absent.
    async fn resolve_device(&self, path: &str) -> Result<Option<String>, MountError>;

    async fn is_block_device(&self, path: &str) -> Result<bool, MountError>;

    async fn volume_stats(&self, path: &str) -> Result<FsStats, MountError>;

    /// Mount entries whose target is `target`.
    async fn mounts_at(&self, target: &str) -> Result<Vec<MountEntry>, MountError> {
        Ok(self
            .mount_entries()
            .await?
            .into_iter()
            .filter(|m| m.target == target)
            .collect())
    }

    /// The most recent mount at `target`.
    async fn mount_at(&self, target: &str) -> Result<Option<MountEntry>, MountError> {
        Ok(self.mounts_at(target).await?.pop())
    }

    /// Targets other than `except` that mount `source`.
    async fn other_mounts_of(&self, source: &str, except: &str) -> Result<Vec<String>, MountError> {
        Ok(self
            .mount_entries()
            .await?
            .into_iter()
            .filter(|m| m.source == source && m.target != except)
            .map(|m| m.target)
            .collect())
    }
}
