//! [`Mounter`] backed by the host: nix mount syscalls plus the usual
//! userspace tools (`mkfs.*`, `blkid`, `blockdev`, `cryptsetup`,
//! `resize2fs`, `xfs_growfs`, `dumpe2fs`, `xfs_info`).

use std::os::unix::fs::FileTypeExt;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::MsFlags;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    mapper_path, parse_mounts, FsStats, LuksOptions, MountEntry, MountError, Mounter,
};

const PROC_MOUNTS: &str = "/proc/self/mounts";
const CRYPTSETUP: &str = "cryptsetup";

/// `blkid -p` exit status when the device carries no signature.
const BLKID_NOTHING_FOUND: i32 = 2;
/// `cryptsetup` exit status for a wrong passphrase.
const CRYPTSETUP_BAD_PASSPHRASE: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct LinuxMounter;

impl LinuxMounter {
    pub fn new() -> Self {
        Self
    }
}

async fn run(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, MountError> {
    debug!(program, ?args, "exec");
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    let mut child = cmd.spawn().map_err(|e| MountError::Spawn {
        program: program.to_owned(),
        reason: e.to_string(),
    })?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await.map_err(|e| MountError::Spawn {
            program: program.to_owned(),
            reason: format!("write stdin: {e}"),
        })?;
    }
    child.wait_with_output().await.map_err(|e| MountError::Spawn {
        program: program.to_owned(),
        reason: e.to_string(),
    })
}

/// Run and require a zero exit status.
async fn run_ok(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String, MountError> {
    let out = run(program, args, stdin).await?;
    if out.status.success() {
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    } else {
        Err(failure(program, &out))
    }
}

fn failure(program: &str, out: &Output) -> MountError {
    MountError::Command {
        program: program.to_owned(),
        code: out.status.code(),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
    }
}

/// Run a blocking syscall off the async workers.
async fn blocking<F>(op: &'static str, path: &str, f: F) -> Result<(), MountError>
where
    F: FnOnce() -> Result<(), Errno> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MountError::sys(op, path, e))?
        .map_err(|e| MountError::sys(op, path, e))
}

/// Split `ro`/`rw` out of a mount option list; the rest becomes mount data.
fn split_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" | "" => {}
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            other => data.push(other),
        }
    }
    let data = (!data.is_empty()).then(|| data.join(","));
    (flags, data)
}

fn mkfs_args<'a>(fs_type: &str, device: &'a str) -> Vec<&'a str> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => vec!["-F", "-m0", device],
        "xfs" => vec!["-f", device],
        _ => vec![device],
    }
}

/// `Block count` × `Block size` from `dumpe2fs -h`.
pub(crate) fn parse_dumpe2fs(output: &str) -> Option<u64> {
    let field = |name: &str| {
        output.lines().find_map(|l| {
            let (k, v) = l.split_once(':')?;
            (k.trim() == name).then(|| v.trim().parse::<u64>().ok())?
        })
    };
    Some(field("Block count")? * field("Block size")?)
}

/// `bsize` × `blocks` of the `data` section from `xfs_info`.
pub(crate) fn parse_xfs_info(output: &str) -> Option<u64> {
    let line = output
        .lines()
        .find(|l| l.trim_start().starts_with("data"))?;
    let value = |name: &str| {
        line.split_whitespace().find_map(|tok| {
            tok.strip_prefix(name)
                .and_then(|v| v.strip_prefix('='))
                .and_then(|v| v.trim_end_matches(',').parse::<u64>().ok())
        })
    };
    Some(value("bsize")? * value("blocks")?)
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn mount_entries(&self) -> Result<Vec<MountEntry>, MountError> {
        let content = tokio::fs::read_to_string(PROC_MOUNTS)
            .await
            .map_err(|e| MountError::sys("read", PROC_MOUNTS, e))?;
        Ok(parse_mounts(&content))
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let (flags, data) = split_options(options);
        let (src, tgt, fs) = (source.to_owned(), target.to_owned(), fs_type.to_owned());
        debug!(source, target, fs_type, ?options, "mount");
        blocking("mount", target, move || {
            nix::mount::mount(
                Some(src.as_str()),
                tgt.as_str(),
                Some(fs.as_str()),
                flags,
                data.as_deref(),
            )
        })
        .await
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
        options: &[String],
    ) -> Result<(), MountError> {
        let (extra, _) = split_options(options);
        let (src, tgt) = (source.to_owned(), target.to_owned());
        debug!(source, target, read_only, "bind mount");
        blocking("bind", target, {
            let tgt = tgt.clone();
            move || {
                nix::mount::mount(
                    Some(src.as_str()),
                    tgt.as_str(),
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
            }
        })
        .await?;

        // Flags on the initial bind are ignored; they only apply on remount.
        let mut flags = extra;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        if flags.is_empty() {
            return Ok(());
        }
        blocking("remount", target, move || {
            nix::mount::mount(
                None::<&str>,
                tgt.as_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
                None::<&str>,
            )
        })
        .await
    }

    async fn unmount(&self, target: &str) -> Result<(), MountError> {
        let tgt = target.to_owned();
        let result = tokio::task::spawn_blocking(move || nix::mount::umount(tgt.as_str()))
            .await
            .map_err(|e| MountError::sys("umount", target, e))?;
        match result {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(MountError::sys("umount", target, e)),
        }
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<(), MountError> {
        let program = format!("mkfs.{fs_type}");
        run_ok(&program, &mkfs_args(fs_type, device), None).await?;
        Ok(())
    }

    async fn probe_fs_type(&self, device: &str) -> Result<Option<String>, MountError> {
        let out = run("blkid", &["-p", "-s", "TYPE", "-o", "value", device], None).await?;
        match out.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&out.stdout).trim().to_owned();
                Ok((!fs.is_empty()).then_some(fs))
            }
            Some(BLKID_NOTHING_FOUND) => Ok(None),
            _ => Err(failure("blkid", &out)),
        }
    }

    async fn device_size(&self, device: &str) -> Result<u64, MountError> {
        let out = run_ok("blockdev", &["--getsize64", device], None).await?;
        out.trim().parse().map_err(|_| MountError::Parse {
            program: "blockdev".into(),
            output: out,
        })
    }

    async fn filesystem_size(
        &self,
        device: &str,
        mount_path: &str,
        fs_type: &str,
    ) -> Result<u64, MountError> {
        let (program, out, parsed) = if fs_type == "xfs" {
            let out = run_ok("xfs_info", &[mount_path], None).await?;
            let parsed = parse_xfs_info(&out);
            ("xfs_info", out, parsed)
        } else {
            let out = run_ok("dumpe2fs", &["-h", device], None).await?;
            let parsed = parse_dumpe2fs(&out);
            ("dumpe2fs", out, parsed)
        };
        parsed.ok_or_else(|| MountError::Parse {
            program: program.into(),
            output: out,
        })
    }

    async fn resize_fs(
        &self,
        device: &str,
        mount_path: &str,
        fs_type: &str,
    ) -> Result<(), MountError> {
        if fs_type == "xfs" {
            run_ok("xfs_growfs", &["-d", mount_path], None).await?;
        } else {
            run_ok("resize2fs", &[device], None).await?;
        }
        Ok(())
    }

    async fn is_luks(&self, device: &str) -> Result<bool, MountError> {
        let out = run(CRYPTSETUP, &["isLuks", device], None).await?;
        Ok(out.status.success())
    }

    async fn luks_format(
        &self,
        device: &str,
        passphrase: &str,
        opts: &LuksOptions,
    ) -> Result<(), MountError> {
        let mut args = vec!["luksFormat", "--type", "luks2", "--batch-mode"];
        if let Some(cipher) = &opts.cipher {
            args.extend(["--cipher", cipher.as_str()]);
        }
        if let Some(hash) = &opts.hash {
            args.extend(["--hash", hash.as_str()]);
        }
        if let Some(size) = &opts.key_size {
            args.extend(["--key-size", size.as_str()]);
        }
        args.extend(["--key-file=-", device]);
        run_ok(CRYPTSETUP, &args, Some(passphrase.as_bytes())).await?;
        Ok(())
    }

    async fn luks_check_passphrase(
        &self,
        device: &str,
        passphrase: &str,
    ) -> Result<bool, MountError> {
        let out = run(
            CRYPTSETUP,
            &["luksOpen", "--test-passphrase", "--key-file=-", device],
            Some(passphrase.as_bytes()),
        )
        .await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(CRYPTSETUP_BAD_PASSPHRASE) => Ok(false),
            _ => Err(failure(CRYPTSETUP, &out)),
        }
    }

    async fn luks_open(
        &self,
        device: &str,
        name: &str,
        passphrase: &str,
        extra_flags: &[String],
    ) -> Result<(), MountError> {
        let mut args = vec!["luksOpen"];
        args.extend(extra_flags.iter().map(String::as_str));
        args.extend(["--key-file=-", device, name]);
        run_ok(CRYPTSETUP, &args, Some(passphrase.as_bytes())).await?;
        Ok(())
    }

    async fn luks_is_open(&self, name: &str) -> Result<bool, MountError> {
        let path = mapper_path(name);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| MountError::sys("stat", &path, e))
    }

    async fn luks_close(&self, name: &str) -> Result<(), MountError> {
        if !self.luks_is_open(name).await? {
            return Ok(());
        }
        run_ok(CRYPTSETUP, &["luksClose", name], None).await?;
        Ok(())
    }

    async fn luks_resize(&self, name: &str) -> Result<(), MountError> {
        run_ok(CRYPTSETUP, &["resize", name], None).await?;
        Ok(())
    }

    async fn path_exists(&self, path: &str) -> Result<bool, MountError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| MountError::sys("stat", path, e))
    }

    async fn make_dir(&self, path: &str) -> Result<(), MountError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| MountError::sys("mkdir", path, e))
    }

    async fn make_file(&self, path: &str) -> Result<(), MountError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MountError::sys("mkdir", path, e))?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await
            .map(drop)
            .map_err(|e| MountError::sys("create", path, e))
    }

    async fn remove_path(&self, path: &str) -> Result<(), MountError> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MountError::sys("stat", path, e)),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MountError::sys("remove", path, e)),
        }
    }

    async fn resolve_device(&self, path: &str) -> Result<Option<String>, MountError> {
        match tokio::fs::canonicalize(path).await {
            Ok(p) => Ok(Some(p.to_string_lossy().into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MountError::sys("resolve", path, e)),
        }
    }

    async fn is_block_device(&self, path: &str) -> Result<bool, MountError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.file_type().is_block_device()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MountError::sys("stat", path, e)),
        }
    }

    async fn volume_stats(&self, path: &str) -> Result<FsStats, MountError> {
        let owned = path.to_owned();
        let st = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(owned.as_str()))
            .await
            .map_err(|e| MountError::sys("statvfs", path, e))?
            .map_err(|e| match e {
                Errno::ENOENT => MountError::NotFound(path.to_owned()),
                e => MountError::sys("statvfs", path, e),
            })?;
        let frsize = st.fragment_size() as u64;
        let total_bytes = st.blocks() as u64 * frsize;
        let available_bytes = st.blocks_available() as u64 * frsize;
        let free_bytes = st.blocks_free() as u64 * frsize;
        let total_inodes = st.files() as u64;
        let free_inodes = st.files_free() as u64;
        Ok(FsStats {
            total_bytes,
            available_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            total_inodes,
            free_inodes,
            used_inodes: total_inodes.saturating_sub(free_inodes),
        })
    }
}
