//! Per-fingerprint shared/exclusive leases.
//!
//! Serving a request holds a shared (read) lease on its mirror; a
//! synchronization holds the exclusive slot; the eviction sweep only
//! removes a mirror whose exclusive slot it can take without waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

pub type ReadLease = OwnedRwLockReadGuard<()>;
pub type WriteLease = OwnedRwLockWriteGuard<()>;

#[derive(Default)]
pub struct LeaseTable {
    inner: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared lease for serving reads; waits behind an exclusive holder.
    pub async fn read(&self, key: &str) -> ReadLease {
        self.slot(key).read_owned().await
    }

    /// Exclusive lease for a synchronization.
    pub async fn write(&self, key: &str) -> WriteLease {
        self.slot(key).write_owned().await
    }

    /// Exclusive lease without waiting; `None` while readers or a writer
    /// are active. Used by the eviction sweep to skip busy mirrors.
    pub fn try_write(&self, key: &str) -> Option<WriteLease> {
        match self.slot(key).try_write_owned() {
            Ok(lease) => Some(lease),
            Err(_) => {
                debug!(%key, "lease busy");
                None
            }
        }
    }

    /// Drop the slot for an evicted mirror.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }
}
