//! In-memory [`Mounter`] for tests.
//!
//! Devices carry an optional filesystem (with a flat file map) or a LUKS
//! container wrapping one.  Mounting a device or bind-mounting a mounted
//! path records an entry with the underlying device as its source, the same
//! way `/proc/self/mounts` reports bind mounts, so files written through any
//! mount of a device are visible through every other.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    mapper_name, mapper_path, FsStats, LuksOptions, MountEntry, MountError, Mounter, FS_TYPE_LUKS,
};

const FAKE_INODES: u64 = 65_536;
const DEVTMPFS: &str = "devtmpfs";

#[derive(Debug, Clone, Default)]
struct FakeFs {
    fs_type: String,
    size: u64,
    files: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct FakeLuks {
    passphrase: String,
    options: LuksOptions,
    inner: Option<FakeFs>,
}

#[derive(Debug, Clone, Default)]
struct FakeDisk {
    size: u64,
    fs: Option<FakeFs>,
    luks: Option<FakeLuks>,
}

#[derive(Debug, Default)]
struct State {
    disks: HashMap<String, FakeDisk>,
    symlinks: HashMap<String, String>,
    /// mapping name → backing device
    mappings: HashMap<String, String>,
    mounts: Vec<MountEntry>,
    paths: BTreeSet<String>,
    format_count: u32,
    luks_format_count: u32,
    luks_resize_count: u32,
    last_open_flags: Vec<String>,
}

impl State {
    fn resolve(&self, path: &str) -> String {
        let mut current = path.to_owned();
        for _ in 0..8 {
            match self.symlinks.get(&current) {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        current
    }

    fn is_device(&self, path: &str) -> bool {
        self.disks.contains_key(path)
            || mapper_name(path).is_some_and(|n| self.mappings.contains_key(n))
    }

    /// The filesystem slot of a device or open mapping.
    fn fs_slot(&mut self, device: &str) -> Result<&mut Option<FakeFs>, MountError> {
        let device = self.resolve(device);
        if let Some(name) = mapper_name(&device) {
            let backing = self
                .mappings
                .get(name)
                .cloned()
                .ok_or_else(|| MountError::NotFound(device.clone()))?;
            let disk = self
                .disks
                .get_mut(&backing)
                .ok_or_else(|| MountError::NotFound(backing.clone()))?;
            return disk
                .luks
                .as_mut()
                .map(|l| &mut l.inner)
                .ok_or_else(|| MountError::NotFound(device.clone()));
        }
        self.disks
            .get_mut(&device)
            .map(|d| &mut d.fs)
            .ok_or(MountError::NotFound(device))
    }

    fn size_of(&self, device: &str) -> Result<u64, MountError> {
        let device = self.resolve(device);
        let backing = match mapper_name(&device) {
            Some(name) => self
                .mappings
                .get(name)
                .cloned()
                .ok_or_else(|| MountError::NotFound(device.clone()))?,
            None => device.clone(),
        };
        self.disks
            .get(&backing)
            .map(|d| d.size)
            .ok_or(MountError::NotFound(device))
    }

    /// Device behind `path`: the path itself, or the device bind-mounted
    /// onto it.
    fn block_backing(&self, path: &str) -> Option<String> {
        let resolved = self.resolve(path);
        if self.is_device(&resolved) {
            return Some(resolved);
        }
        self.mounts
            .iter()
            .rev()
            .find(|m| m.target == path && m.fs_type == DEVTMPFS)
            .map(|m| m.source.clone())
    }

    fn mount_source(&self, target: &str) -> Option<String> {
        self.mounts
            .iter()
            .rev()
            .find(|m| m.target == target)
            .map(|m| m.source.clone())
    }

    fn fs_at(&mut self, mount_path: &str) -> Result<&mut FakeFs, MountError> {
        let source = self
            .mount_source(mount_path)
            .ok_or_else(|| MountError::NotFound(format!("mount at {mount_path}")))?;
        self.fs_slot(&source)?
            .as_mut()
            .ok_or(MountError::NotFound(format!("filesystem on {source}")))
    }

    fn require_path(&self, path: &str) -> Result<(), MountError> {
        if self.paths.contains(path) {
            Ok(())
        } else {
            Err(MountError::NotFound(path.to_owned()))
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<State>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a blank block device.
    pub fn add_device(&self, path: &str, size: u64) {
        self.lock().disks.insert(
            path.to_owned(),
            FakeDisk {
                size,
                ..Default::default()
            },
        );
    }

    pub fn add_symlink(&self, link: &str, target: &str) {
        self.lock()
            .symlinks
            .insert(link.to_owned(), target.to_owned());
    }

    /// Grow (or shrink) a device, as the provider does after a resize.
    pub fn set_device_size(&self, path: &str, size: u64) {
        if let Some(d) = self.lock().disks.get_mut(path) {
            d.size = size;
        }
    }

    /// Put a filesystem on a device directly.
    pub fn preformat(&self, path: &str, fs_type: &str) {
        let mut st = self.lock();
        if let Some(d) = st.disks.get_mut(path) {
            d.fs = Some(FakeFs {
                fs_type: fs_type.to_owned(),
                size: d.size,
                files: HashMap::new(),
            });
        }
    }

    pub fn write_file(&self, mount_path: &str, name: &str, data: &[u8]) -> Result<(), MountError> {
        let mut st = self.lock();
        let read_only = st
            .mounts
            .iter()
            .rev()
            .find(|m| m.target == mount_path)
            .is_some_and(MountEntry::is_read_only);
        if read_only {
            return Err(MountError::sys("write", mount_path, "read-only file system"));
        }
        st.fs_at(mount_path)?
            .files
            .insert(name.to_owned(), data.to_vec());
        Ok(())
    }

    pub fn read_file(&self, mount_path: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .fs_at(mount_path)
            .ok()
            .and_then(|fs| fs.files.get(name).cloned())
    }

    pub fn mount_table(&self) -> Vec<MountEntry> {
        self.lock().mounts.clone()
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.lock().paths.contains(path)
    }

    pub fn format_count(&self) -> u32 {
        self.lock().format_count
    }

    pub fn luks_format_count(&self) -> u32 {
        self.lock().luks_format_count
    }

    pub fn luks_resize_count(&self) -> u32 {
        self.lock().luks_resize_count
    }

    pub fn last_open_flags(&self) -> Vec<String> {
        self.lock().last_open_flags.clone()
    }

    pub fn open_mappings(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().mappings.keys().cloned().collect();
        names.sort();
        names
    }

    /// LUKS creation options recorded for a device, if it is one.
    pub fn luks_options(&self, device: &str) -> Option<LuksOptions> {
        self.lock()
            .disks
            .get(device)
            .and_then(|d| d.luks.as_ref())
            .map(|l| l.options.clone())
    }
}

fn bad_passphrase(device: &str) -> MountError {
    MountError::Command {
        program: "cryptsetup".into(),
        code: Some(2),
        stderr: format!("No key available with this passphrase for {device}."),
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount_entries(&self) -> Result<Vec<MountEntry>, MountError> {
        Ok(self.lock().mounts.clone())
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let mut st = self.lock();
        st.require_path(target)?;
        let device = st.resolve(source);
        let actual = st
            .fs_slot(&device)?
            .as_ref()
            .map(|fs| fs.fs_type.clone())
            .ok_or_else(|| MountError::sys("mount", target, "wrong fs type, bad superblock"))?;
        if !fs_type.is_empty() && actual != fs_type {
            return Err(MountError::sys("mount", target, "wrong fs type, bad superblock"));
        }
        let mut opts = vec!["rw".to_owned()];
        opts.extend(options.iter().filter(|o| !o.is_empty()).cloned());
        if opts.iter().any(|o| o == "ro") {
            opts.retain(|o| o != "rw");
        }
        st.mounts.push(MountEntry {
            source: device,
            target: target.to_owned(),
            fs_type: actual,
            options: opts,
        });
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
        options: &[String],
    ) -> Result<(), MountError> {
        let mut st = self.lock();
        st.require_path(target)?;
        let resolved = st.resolve(source);
        let (device, fs_type) = if st.is_device(&resolved) {
            (resolved, DEVTMPFS.to_owned())
        } else {
            let entry = st
                .mounts
                .iter()
                .rev()
                .find(|m| m.target == source)
                .cloned()
                .ok_or_else(|| MountError::sys("bind", target, "source is not mounted"))?;
            (entry.source, entry.fs_type)
        };
        let mut opts = vec![if read_only { "ro" } else { "rw" }.to_owned()];
        opts.extend(options.iter().filter(|o| !o.is_empty()).cloned());
        st.mounts.push(MountEntry {
            source: device,
            target: target.to_owned(),
            fs_type,
            options: opts,
        });
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), MountError> {
        let mut st = self.lock();
        if let Some(pos) = st.mounts.iter().rposition(|m| m.target == target) {
            st.mounts.remove(pos);
        }
        Ok(())
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<(), MountError> {
        let mut st = self.lock();
        let size = st.size_of(device)?;
        *st.fs_slot(device)? = Some(FakeFs {
            fs_type: fs_type.to_owned(),
            size,
            files: HashMap::new(),
        });
        st.format_count += 1;
        Ok(())
    }

    async fn probe_fs_type(&self, device: &str) -> Result<Option<String>, MountError> {
        let mut st = self.lock();
        let resolved = st.resolve(device);
        if let Some(d) = st.disks.get(&resolved) {
            if d.luks.is_some() {
                return Ok(Some(FS_TYPE_LUKS.to_owned()));
            }
        }
        Ok(st.fs_slot(&resolved)?.as_ref().map(|fs| fs.fs_type.clone()))
    }

    async fn device_size(&self, device: &str) -> Result<u64, MountError> {
        let st = self.lock();
        let backing = st.block_backing(device).unwrap_or_else(|| device.to_owned());
        st.size_of(&backing)
    }

    async fn filesystem_size(
        &self,
        device: &str,
        _mount_path: &str,
        _fs_type: &str,
    ) -> Result<u64, MountError> {
        let mut st = self.lock();
        st.fs_slot(device)?
            .as_ref()
            .map(|fs| fs.size)
            .ok_or_else(|| MountError::NotFound(format!("filesystem on {device}")))
    }

    async fn resize_fs(
        &self,
        device: &str,
        _mount_path: &str,
        _fs_type: &str,
    ) -> Result<(), MountError> {
        let mut st = self.lock();
        let size = st.size_of(device)?;
        match st.fs_slot(device)?.as_mut() {
            Some(fs) => {
                fs.size = size;
                Ok(())
            }
            None => Err(MountError::NotFound(format!("filesystem on {device}"))),
        }
    }

    async fn is_luks(&self, device: &str) -> Result<bool, MountError> {
        let st = self.lock();
        let resolved = st.resolve(device);
        st.disks
            .get(&resolved)
            .map(|d| d.luks.is_some())
            .ok_or(MountError::NotFound(resolved))
    }

    async fn luks_format(
        &self,
        device: &str,
        passphrase: &str,
        opts: &LuksOptions,
    ) -> Result<(), MountError> {
        let mut st = self.lock();
        let resolved = st.resolve(device);
        let disk = st
            .disks
            .get_mut(&resolved)
            .ok_or_else(|| MountError::NotFound(resolved.clone()))?;
        disk.fs = None;
        disk.luks = Some(FakeLuks {
            passphrase: passphrase.to_owned(),
            options: opts.clone(),
            inner: None,
        });
        st.luks_format_count += 1;
        Ok(())
    }

    async fn luks_check_passphrase(
        &self,
        device: &str,
        passphrase: &str,
    ) -> Result<bool, MountError> {
        let st = self.lock();
        let resolved = st.resolve(device);
        st.disks
            .get(&resolved)
            .and_then(|d| d.luks.as_ref())
            .map(|l| l.passphrase == passphrase)
            .ok_or(MountError::Command {
                program: "cryptsetup".into(),
                code: Some(1),
                stderr: format!("Device {resolved} is not a valid LUKS device."),
            })
    }

    async fn luks_open(
        &self,
        device: &str,
        name: &str,
        passphrase: &str,
        extra_flags: &[String],
    ) -> Result<(), MountError> {
        let mut st = self.lock();
        let resolved = st.resolve(device);
        let matches = st
            .disks
            .get(&resolved)
            .and_then(|d| d.luks.as_ref())
            .map(|l| l.passphrase == passphrase);
        match matches {
            Some(true) => {}
            Some(false) => return Err(bad_passphrase(&resolved)),
            None => return Err(MountError::NotFound(resolved)),
        }
        if st.mappings.contains_key(name) {
            return Err(MountError::Command {
                program: "cryptsetup".into(),
                code: Some(5),
                stderr: format!("Device {name} already exists."),
            });
        }
        st.mappings.insert(name.to_owned(), resolved);
        st.last_open_flags = extra_flags.to_vec();
        Ok(())
    }

    async fn luks_is_open(&self, name: &str) -> Result<bool, MountError> {
        Ok(self.lock().mappings.contains_key(name))
    }

    async fn luks_close(&self, name: &str) -> Result<(), MountError> {
        let mut st = self.lock();
        let path = mapper_path(name);
        if st.mounts.iter().any(|m| m.source == path) {
            return Err(MountError::Command {
                program: "cryptsetup".into(),
                code: Some(5),
                stderr: format!("Device {name} is still in use."),
            });
        }
        st.mappings.remove(name);
        Ok(())
    }

    async fn luks_resize(&self, name: &str) -> Result<(), MountError> {
        let mut st = self.lock();
        if !st.mappings.contains_key(name) {
            return Err(MountError::NotFound(mapper_path(name)));
        }
        st.luks_resize_count += 1;
        Ok(())
    }

    async fn path_exists(&self, path: &str) -> Result<bool, MountError> {
        let st = self.lock();
        let resolved = st.resolve(path);
        Ok(st.paths.contains(path) || st.is_device(&resolved))
    }

    async fn make_dir(&self, path: &str) -> Result<(), MountError> {
        self.lock().paths.insert(path.to_owned());
        Ok(())
    }

    async fn make_file(&self, path: &str) -> Result<(), MountError> {
        self.lock().paths.insert(path.to_owned());
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> Result<(), MountError> {
        let mut st = self.lock();
        if st.mounts.iter().any(|m| m.target == path) {
            return Err(MountError::sys("remove", path, "device or resource busy"));
        }
        st.paths.remove(path);
        Ok(())
    }

    async fn resolve_device(&self, path: &str) -> Result<Option<String>, MountError> {
        let st = self.lock();
        let resolved = st.resolve(path);
        Ok(st.is_device(&resolved).then_some(resolved))
    }

    async fn is_block_device(&self, path: &str) -> Result<bool, MountError> {
        Ok(self.lock().block_backing(path).is_some())
    }

    async fn volume_stats(&self, path: &str) -> Result<FsStats, MountError> {
        let mut st = self.lock();
        if !st.paths.contains(path) && !st.is_device(path) {
            return Err(MountError::NotFound(path.to_owned()));
        }
        let fs = st.fs_at(path)?;
        let used: u64 = fs.files.values().map(|f| f.len() as u64).sum();
        let used_inodes = fs.files.len() as u64;
        Ok(FsStats {
            total_bytes: fs.size,
            available_bytes: fs.size.saturating_sub(used),
            used_bytes: used,
            total_inodes: FAKE_INODES,
            free_inodes: FAKE_INODES.saturating_sub(used_inodes),
            used_inodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    #[tokio::test]
    async fn bind_mount_shares_device_contents() {
        let m = FakeMounter::new();
        m.add_device("/dev/xvdb", 4 * GIB);
        m.make_dir("/stage").await.unwrap();
        m.make_dir("/target").await.unwrap();

        assert_eq!(m.probe_fs_type("/dev/xvdb").await.unwrap(), None);
        m.format("/dev/xvdb", "xfs").await.unwrap();
        m.mount("/dev/xvdb", "/stage", "xfs", &[]).await.unwrap();
        m.bind_mount("/stage", "/target", false, &[]).await.unwrap();

        m.write_file("/target", "hello", b"world").unwrap();
        assert_eq!(m.read_file("/stage", "hello").as_deref(), Some(&b"world"[..]));

        let others = m.other_mounts_of("/dev/xvdb", "/stage").await.unwrap();
        assert_eq!(others, vec!["/target".to_owned()]);
    }

    #[tokio::test]
    async fn luks_roundtrip_through_mapping() {
        let m = FakeMounter::new();
        m.add_device("/dev/xvdc", GIB);
        m.make_dir("/stage").await.unwrap();

        m.luks_format("/dev/xvdc", "secret", &LuksOptions::default())
            .await
            .unwrap();
        assert!(m.is_luks("/dev/xvdc").await.unwrap());
        assert_eq!(
            m.probe_fs_type("/dev/xvdc").await.unwrap().as_deref(),
            Some(FS_TYPE_LUKS)
        );
        assert!(!m.luks_check_passphrase("/dev/xvdc", "wrong").await.unwrap());
        assert!(m.luks_open("/dev/xvdc", "xvdc_crypt", "wrong", &[]).await.is_err());

        m.luks_open("/dev/xvdc", "xvdc_crypt", "secret", &[]).await.unwrap();
        let mapper = mapper_path("xvdc_crypt");
        assert_eq!(m.probe_fs_type(&mapper).await.unwrap(), None);
        m.format(&mapper, "ext4").await.unwrap();
        m.mount(&mapper, "/stage", "ext4", &[]).await.unwrap();

        // Busy mapping refuses to close.
        assert!(m.luks_close("xvdc_crypt").await.is_err());
        m.unmount("/stage").await.unwrap();
        m.luks_close("xvdc_crypt").await.unwrap();
        assert!(!m.luks_is_open("xvdc_crypt").await.unwrap());
    }

    #[tokio::test]
    async fn mount_requires_matching_fs_and_target() {
        let m = FakeMounter::new();
        m.add_device("/dev/xvdb", GIB);
        m.preformat("/dev/xvdb", "ext4");

        assert!(m.mount("/dev/xvdb", "/missing", "ext4", &[]).await.is_err());
        m.make_dir("/stage").await.unwrap();
        assert!(m.mount("/dev/xvdb", "/stage", "xfs", &[]).await.is_err());
        m.mount("/dev/xvdb", "/stage", "", &[]).await.unwrap();
        assert_eq!(m.mount_at("/stage").await.unwrap().unwrap().fs_type, "ext4");
    }

    #[tokio::test]
    async fn symlinks_resolve_to_devices() {
        let m = FakeMounter::new();
        m.add_device("/dev/sdb", GIB);
        m.add_symlink("/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_sdb", "/dev/sdb");
        assert_eq!(
            m.resolve_device("/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_sdb")
                .await
                .unwrap()
                .as_deref(),
            Some("/dev/sdb")
        );
        assert!(m.resolve_device("/dev/xvdz").await.unwrap().is_none());
    }
}
