//! Per-resource operation lock registry.
//!
//! Every state-changing RPC acquires the key of the resource it targets
//! (volume id, snapshot id, or the creation name before an id exists).  A
//! second caller for the same key fails immediately with
//! [`CsiError::Aborted`] instead of queueing.  The returned
//! [`InFlightGuard`] frees the key when dropped, so the entry is released on
//! success, on error, on panic and when the request future is cancelled.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::debug;

use crate::error::CsiError;

/// Registry of keys with an operation in progress.  Cloning shares the
/// underlying set.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    keys: Arc<DashSet<String>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` busy, or fail with `Aborted` if it already is.
    pub fn try_acquire(&self, key: impl Into<String>) -> Result<InFlightGuard, CsiError> {
        let key = key.into();
        if !self.keys.insert(key.clone()) {
            debug!(%key, "operation already in flight");
            return Err(CsiError::Aborted(format!(
                "an operation for {key} is already in progress"
            )));
        }
        Ok(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key,
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Scoped hold on one registry key.
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
