//! Diff & prune planning: given the previous inventory and the new candidate
//! set, decide what to apply, what to prune, and what the next inventory is.
//!
//! Ownership invariant: an instance only ever prunes ids recorded in its own
//! previous successful inventory. Apply is a server-side upsert, so unchanged
//! manifests are still sent.

#![forbid(unsafe_code)]

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cueflow_core::{Resource, ResourceInventory, ResourceRef};

/// Outcome of one planning pass.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Candidate manifests, in apply order.
    pub to_apply: Vec<Resource>,
    /// Previously-owned refs absent from the new set, in prune order.
    pub to_prune: Vec<ResourceRef>,
    /// Inventory to persist if the whole cycle succeeds.
    pub new_inventory: ResourceInventory,
}

/// Counts for events and logs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSummary {
    pub apply: usize,
    pub prune: usize,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary { apply: self.to_apply.len(), prune: self.to_prune.len() }
    }
}

/// Compute the plan. `previous` is the inventory of the last successful
/// apply, `None` on first reconcile. Pruning only happens when `prune` is
/// set, and only against `previous`.
pub fn plan(previous: Option<&ResourceInventory>, candidates: Vec<Resource>, prune: bool) -> Plan {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut entries = Vec::with_capacity(candidates.len());
    for m in &candidates {
        let r = m.to_ref();
        if seen.insert(r.id.clone()) {
            entries.push(r);
        } else {
            warn!(id = %r.id, "duplicate resource id in candidate set; first occurrence wins");
        }
    }
    let new_inventory = ResourceInventory::new(entries);

    let to_prune = match (prune, previous) {
        (true, Some(prev)) => sort_for_prune(prev.diff(&new_inventory)),
        _ => Vec::new(),
    };
    let to_apply = sort_for_apply(candidates);
    debug!(apply = to_apply.len(), prune = to_prune.len(), "plan computed");
    Plan { to_apply, to_prune, new_inventory }
}

fn apply_tier(r: &Resource) -> u8 {
    if r.is_namespace() {
        0
    } else if r.namespace.is_none() {
        1
    } else {
        2
    }
}

/// Dependency-safe apply order: Namespace objects, then cluster-scoped, then
/// namespaced; emission order preserved within each tier.
pub fn sort_for_apply(mut manifests: Vec<Resource>) -> Vec<Resource> {
    manifests.sort_by_key(apply_tier);
    manifests
}

/// Reverse dependency order for deletes: namespaced objects go before the
/// namespaces that contain them.
pub fn sort_for_prune(mut refs: Vec<ResourceRef>) -> Vec<ResourceRef> {
    refs.sort_by_key(|r| {
        if r.is_namespace() {
            2u8
        } else if r.parts().map(|p| p.namespace.is_none()).unwrap_or(false) {
            1
        } else {
            0
        }
    });
    refs
}
