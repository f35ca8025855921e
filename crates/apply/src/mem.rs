//! In-memory cluster backend: a deterministic `ClusterHandle` for the test
//! suites and offline planning. Objects are keyed by inventory id; health
//! verdicts default to healthy and can be scripted per id.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use cueflow_core::instance::ClusterRef;
use cueflow_core::{ReconcileError, Resource, ResourceRef};

use crate::{Applier, ClusterHandle, ClusterProvider, HealthStatus, StatusPoller};

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Json>,
    health: FxHashMap<String, HealthStatus>,
    fail_apply_at: Option<usize>,
    fail_deletes: Vec<String>,
    applies: usize,
    applied_log: Vec<String>,
    deleted_log: Vec<String>,
}

#[derive(Default)]
pub struct MemCluster {
    state: Mutex<State>,
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the apply with zero-based index `n` (and every later one).
    pub fn fail_apply_at(&self, n: usize) {
        self.state.lock().unwrap().fail_apply_at = Some(n);
    }

    pub fn clear_failures(&self) {
        let mut s = self.state.lock().unwrap();
        s.fail_apply_at = None;
        s.fail_deletes.clear();
    }

    pub fn fail_delete_of(&self, id: &str) {
        self.state.lock().unwrap().fail_deletes.push(id.to_string());
    }

    pub fn set_health(&self, id: &str, status: HealthStatus) {
        self.state.lock().unwrap().health.insert(id.to_string(), status);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Ids in the order they were applied, across all cycles.
    pub fn applied_log(&self) -> Vec<String> {
        self.state.lock().unwrap().applied_log.clone()
    }

    pub fn deleted_log(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_log.clone()
    }
}

#[async_trait]
impl Applier for MemCluster {
    async fn apply(&self, manifest: &Resource, _manager: &str) -> Result<ResourceRef> {
        let r = manifest.to_ref();
        let mut s = self.state.lock().unwrap();
        if let Some(n) = s.fail_apply_at {
            if s.applies >= n {
                return Err(anyhow!("scripted apply failure at {}", s.applies));
            }
        }
        s.applies += 1;
        s.applied_log.push(r.id.clone());
        s.objects.insert(r.id.clone(), manifest.raw.clone());
        Ok(r)
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_deletes.iter().any(|id| id == &target.id) {
            return Err(anyhow!("scripted delete failure"));
        }
        // Not-found is success, as with the real backend.
        s.objects.remove(&target.id);
        s.deleted_log.push(target.id.clone());
        Ok(())
    }
}

#[async_trait]
impl StatusPoller for MemCluster {
    async fn poll(&self, target: &ResourceRef) -> Result<HealthStatus> {
        let s = self.state.lock().unwrap();
        Ok(s.health.get(&target.id).cloned().unwrap_or(HealthStatus::Healthy))
    }
}

/// Provider handing out one shared in-memory cluster for every ref.
#[derive(Clone)]
pub struct MemProvider(pub Arc<MemCluster>);

#[async_trait]
impl ClusterProvider for MemProvider {
    async fn resolve(
        &self,
        _cluster_ref: Option<&ClusterRef>,
    ) -> Result<Arc<dyn ClusterHandle>, ReconcileError> {
        Ok(self.0.clone())
    }
}
