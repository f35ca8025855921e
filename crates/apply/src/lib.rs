//! Apply executor: server-side upserts in dependency-safe order, pruning in
//! reverse order, with the cluster behind trait boundaries so the engine is
//! testable without a cluster.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{info, warn};

use cueflow_core::instance::ClusterRef;
use cueflow_core::{ReconcileError, Resource, ResourceRef};

pub mod health;
pub mod kube_cluster;
pub mod mem;

pub use health::{reduce_status, HealthStatus, ReadyVerdict};

/// Server-side upsert and delete against one cluster. Delete of a missing
/// object is success.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, manifest: &Resource, manager: &str) -> Result<ResourceRef>;
    async fn delete(&self, target: &ResourceRef) -> Result<()>;
}

/// Advisory readiness probe for one applied resource.
#[async_trait]
pub trait StatusPoller: Send + Sync {
    async fn poll(&self, target: &ResourceRef) -> Result<HealthStatus>;
}

/// A resolved cluster: applier + poller bundled behind one handle.
pub trait ClusterHandle: Applier + StatusPoller {}

impl<T: Applier + StatusPoller> ClusterHandle for T {}

/// Resolves credentials once per reconcile cycle; `None` means the local
/// cluster.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    async fn resolve(
        &self,
        cluster_ref: Option<&ClusterRef>,
    ) -> Result<Arc<dyn ClusterHandle>, ReconcileError>;
}

/// Apply the set in order. The first failure aborts the rest of the cycle:
/// the caller must not prune or update its inventory afterwards.
pub async fn apply_set(
    handle: &dyn ClusterHandle,
    manifests: &[Resource],
    manager: &str,
) -> Result<Vec<ResourceRef>, ReconcileError> {
    let t0 = std::time::Instant::now();
    let total = manifests.len();
    let mut applied = Vec::with_capacity(total);
    for m in manifests {
        counter!("cueflow_apply_attempts", 1u64);
        match handle.apply(m, manager).await {
            Ok(r) => {
                counter!("cueflow_apply_ok", 1u64);
                applied.push(r);
            }
            Err(e) => {
                counter!("cueflow_apply_err", 1u64);
                return Err(ReconcileError::Apply {
                    applied: applied.len(),
                    total,
                    message: format!("{}: {e:#}", m.to_ref().id),
                });
            }
        }
    }
    histogram!("cueflow_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(count = total, "apply set complete");
    Ok(applied)
}

/// Result of a prune pass. Refs that failed to delete stay owned: the
/// caller keeps them in the recorded inventory so the next cycle retries
/// them.
#[derive(Debug, Default)]
pub struct PruneOutcome {
    pub pruned: usize,
    pub failed: Vec<(ResourceRef, String)>,
}

impl PruneOutcome {
    pub fn error(&self) -> Option<ReconcileError> {
        if self.failed.is_empty() {
            return None;
        }
        let msgs: Vec<String> =
            self.failed.iter().map(|(r, e)| format!("{}: {e}", r.id)).collect();
        Some(ReconcileError::Prune(msgs.join("; ")))
    }
}

/// Delete previously-owned refs. Unlike apply, pruning keeps going after a
/// failure; resources already applied must not be held hostage by one stuck
/// delete.
pub async fn prune_set(handle: &dyn ClusterHandle, refs: &[ResourceRef]) -> PruneOutcome {
    let mut out = PruneOutcome::default();
    for r in refs {
        match handle.delete(r).await {
            Ok(()) => {
                counter!("cueflow_prune_ok", 1u64);
                out.pruned += 1;
            }
            Err(e) => {
                counter!("cueflow_prune_err", 1u64);
                warn!(id = %r.id, error = %e, "prune failed");
                out.failed.push((r.clone(), format!("{e:#}")));
            }
        }
    }
    out
}
