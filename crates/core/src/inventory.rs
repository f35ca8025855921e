//! Persisted record of what an instance applied last time.
//!
//! The inventory is replaced wholesale on every successful apply; the
//! previous snapshot, not live cluster state, decides what may be pruned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Reference to an applied resource. `id` is
/// `<namespace>_<name>_<group>_<kind>` (namespace empty for cluster-scoped
/// objects); two refs denote the same resource iff `id` matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    pub id: String,
    #[serde(rename = "v")]
    pub version: String,
}

/// Decomposed form of a ref id. Namespace and name cannot contain `_`
/// (DNS-1123), so the four fields split unambiguously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefParts {
    pub namespace: Option<String>,
    pub name: String,
    pub group: String,
    pub kind: String,
}

impl ResourceRef {
    pub fn parts(&self) -> Option<RefParts> {
        let mut it = self.id.splitn(4, '_');
        let ns = it.next()?;
        let name = it.next()?;
        let group = it.next()?;
        let kind = it.next()?;
        Some(RefParts {
            namespace: (!ns.is_empty()).then(|| ns.to_string()),
            name: name.to_string(),
            group: group.to_string(),
            kind: kind.to_string(),
        })
    }

    pub fn is_namespace(&self) -> bool {
        self.parts()
            .map(|p| p.group.is_empty() && p.kind == "Namespace")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceInventory {
    pub entries: Vec<ResourceRef>,
}

impl ResourceInventory {
    pub fn new(entries: Vec<ResourceRef>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn ids(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    /// Entries of `self` whose id does not appear in `other`, preserving
    /// `self`'s order. This is the prune candidate set when `other` is the
    /// new inventory.
    pub fn diff(&self, other: &ResourceInventory) -> Vec<ResourceRef> {
        let keep = other.ids();
        self.entries
            .iter()
            .filter(|e| !keep.contains(e.id.as_str()))
            .cloned()
            .collect()
    }
}
