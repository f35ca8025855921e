//! Dependency graph: source index, topological scheduling order, and cycle
//! detection via sort failure rather than recursion limits.

use rustc_hash::{FxHashMap, FxHashSet};

use cueflow_core::{InstanceSpec, ObjectKey};

/// Order `keys` so that every instance comes after the entries of its
/// `depends_on` that are also in `keys`. Edges leaving the set are ignored:
/// those dependencies are not being scheduled in this batch.
///
/// `Err` carries every instance caught in a cycle, so each can be reported
/// against.
pub fn schedule_order(
    keys: &[ObjectKey],
    specs: &FxHashMap<ObjectKey, InstanceSpec>,
) -> Result<Vec<ObjectKey>, Vec<ObjectKey>> {
    let in_set: FxHashSet<&ObjectKey> = keys.iter().collect();
    let mut indegree: FxHashMap<&ObjectKey, usize> = keys.iter().map(|k| (k, 0)).collect();
    let mut dependents: FxHashMap<&ObjectKey, Vec<&ObjectKey>> = FxHashMap::default();
    for k in keys {
        let Some(spec) = specs.get(k) else { continue };
        for dep in &spec.depends_on {
            if let Some(dep) = in_set.get(dep) {
                *indegree.get_mut(k).unwrap() += 1;
                dependents.entry(*dep).or_default().push(k);
            }
        }
    }

    // Kahn's algorithm, stable with respect to the input order.
    let mut order = Vec::with_capacity(keys.len());
    let mut ready: Vec<&ObjectKey> = keys.iter().filter(|k| indegree[k] == 0).collect();
    while let Some(k) = ready.first().copied() {
        ready.remove(0);
        order.push(k.clone());
        for d in dependents.remove(&k).unwrap_or_default() {
            let e = indegree.get_mut(d).unwrap();
            *e -= 1;
            if *e == 0 {
                ready.push(d);
            }
        }
    }

    if order.len() == keys.len() {
        Ok(order)
    } else {
        let mut cycle: Vec<ObjectKey> =
            keys.iter().filter(|k| indegree[k] > 0).cloned().collect();
        cycle.sort();
        Err(cycle)
    }
}

/// Instances watching the given source, the analogue of the controller's
/// field index on source references.
pub fn watchers_of_source(
    specs: &FxHashMap<ObjectKey, InstanceSpec>,
    source: &ObjectKey,
) -> Vec<ObjectKey> {
    let mut out: Vec<ObjectKey> = specs
        .iter()
        .filter(|(k, s)| &s.source_ref.key_in(&k.namespace) == source)
        .map(|(k, _)| k.clone())
        .collect();
    out.sort();
    out
}
