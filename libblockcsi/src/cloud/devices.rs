//! Device-name allocation for disk attachments.
//!
//! Names are `/dev/xvd<suffix>` with suffixes `b..z` then `aa..an`.  A name
//! is never handed out while it is in use on the VM or reserved by an attach
//! that has not finished yet.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use super::CloudError;

const DEVICE_PREFIX: &str = "/dev/xvd";

/// Every suffix the allocator may hand out, in order.
pub fn candidate_suffixes() -> Vec<String> {
    let mut out: Vec<String> = ('b'..='z').map(String::from).collect();
    out.extend(('a'..='n').map(|c| format!("a{c}")));
    out
}

/// Suffix of a device path (`/dev/xvdba` → `ba`), if it uses the prefix.
pub fn device_suffix(device: &str) -> Option<&str> {
    device.strip_prefix(DEVICE_PREFIX).filter(|s| !s.is_empty())
}

/// Per-VM reservations for names of in-flight attachments.
#[derive(Debug, Clone, Default)]
pub struct DeviceAllocator {
    reserved: Arc<DashMap<String, HashSet<String>>>,
}

impl DeviceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the first name free on `vm_id`, given the names the VM
    /// already uses.
    pub fn reserve<'a, I>(&self, vm_id: &str, in_use: I) -> Result<DeviceReservation, CloudError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let used: HashSet<&str> = in_use.into_iter().collect();
        let mut reserved = self.reserved.entry(vm_id.to_owned()).or_default();
        let name = candidate_suffixes()
            .into_iter()
            .map(|s| format!("{DEVICE_PREFIX}{s}"))
            .find(|name| !used.contains(name.as_str()) && !reserved.contains(name))
            .ok_or_else(|| CloudError::NoDeviceName(vm_id.to_owned()))?;
        reserved.insert(name.clone());
        Ok(DeviceReservation {
            reserved: Arc::clone(&self.reserved),
            vm_id: vm_id.to_owned(),
            name,
        })
    }

    pub fn reserved_count(&self, vm_id: &str) -> usize {
        self.reserved.get(vm_id).map(|s| s.len()).unwrap_or(0)
    }
}

/// A reserved name, released on drop.
#[derive(Debug)]
pub struct DeviceReservation {
    reserved: Arc<DashMap<String, HashSet<String>>>,
    vm_id: String,
    name: String,
}

impl DeviceReservation {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        if let Some(mut names) = self.reserved.get_mut(&self.vm_id) {
            names.remove(&self.name);
        }
        self.reserved.remove_if(&self.vm_id, |_, names| names.is_empty());
    }
}
