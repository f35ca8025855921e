//! Status persistence boundary. The in-memory store also publishes an
//! `arc-swap` snapshot so observers read without locking the writers.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

use cueflow_core::{InstanceStatus, ObjectKey};

/// Load/save must be sequenced per key by the caller (the scheduler runs at
/// most one cycle per instance); that ordering is what keeps the
/// previous-inventory read ahead of the new-inventory write.
pub trait StatusStore: Send + Sync {
    fn load(&self, key: &ObjectKey) -> InstanceStatus;
    fn save(&self, key: &ObjectKey, status: InstanceStatus);
}

#[derive(Default)]
pub struct MemStatusStore {
    inner: Mutex<FxHashMap<ObjectKey, InstanceStatus>>,
    snapshot: ArcSwap<FxHashMap<ObjectKey, InstanceStatus>>,
}

impl MemStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time view for external observers.
    pub fn snapshot(&self) -> Arc<FxHashMap<ObjectKey, InstanceStatus>> {
        self.snapshot.load_full()
    }
}

impl StatusStore for MemStatusStore {
    fn load(&self, key: &ObjectKey) -> InstanceStatus {
        self.inner.lock().unwrap().get(key).cloned().unwrap_or_default()
    }

    fn save(&self, key: &ObjectKey, status: InstanceStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(key.clone(), status);
        self.snapshot.store(Arc::new(inner.clone()));
    }
}
