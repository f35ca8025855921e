//! The reconciliation state machine: drives one instance from its current
//! applied inventory to the desired inventory for a new source revision.
//!
//! Status writes happen at exactly two checkpoints: the attempted revision
//! before any build step, and the applied revision + inventory together at
//! reporting. A cycle aborted anywhere in between leaves status at its
//! pre-cycle value, which is what makes retries and pruning safe.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use cueflow_apply::{apply_set, prune_set, ClusterProvider, ReadyVerdict};
use cueflow_core::condition::{reason, remove_condition, set_condition, ConditionStatus};
use cueflow_core::{
    Event, EventKind, EventSink, InstanceSpec, ObjectKey, ReconcileError, READY, RECONCILING,
};
use cueflow_module::{build_manifests, filter_gated, validate, Evaluator, ModuleInput};

pub mod deps;
pub mod sched;
pub mod status;
pub mod track;

pub use status::{MemStatusStore, StatusStore};
pub use track::Decision;

/// A fetched artifact: the extracted source tree plus its revision string.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub dir: PathBuf,
    pub revision: String,
}

/// External artifact transport, consumed at its interface boundary only.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source: &ObjectKey) -> Result<Artifact, ReconcileError>;
}

/// Engine tunables; env overrides below for deployment-time tweaking.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub controller_name: String,
    /// Requeue used while a `depends_on` entry is not yet ready.
    pub requeue_dependency: Duration,
    /// Backoff for transient fetch/credential failures.
    pub retry_backoff: Duration,
    /// Throttle between attempts for one instance; zero disables.
    pub min_interval: Duration,
    /// Deny source/dependency references outside the instance namespace.
    pub no_cross_namespace_refs: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            controller_name: "cueflow".into(),
            requeue_dependency: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(30),
            min_interval: Duration::ZERO,
            no_cross_namespace_refs: false,
        }
    }
}

impl EngineOptions {
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Some(secs) = env_u64("CUEFLOW_REQUEUE_DEPENDENCY_SECS") {
            o.requeue_dependency = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CUEFLOW_RETRY_BACKOFF_SECS") {
            o.retry_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CUEFLOW_MIN_INTERVAL_SECS") {
            o.min_interval = Duration::from_secs(secs);
        }
        o
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Registered instance specs, shared between the engine and the scheduler.
#[derive(Default)]
pub struct InstanceSet {
    inner: Mutex<FxHashMap<ObjectKey, InstanceSpec>>,
}

impl InstanceSet {
    pub fn upsert(&self, key: ObjectKey, spec: InstanceSpec) {
        self.inner.lock().unwrap().insert(key, spec);
    }

    pub fn remove(&self, key: &ObjectKey) {
        self.inner.lock().unwrap().remove(key);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<InstanceSpec> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn all(&self) -> FxHashMap<ObjectKey, InstanceSpec> {
        self.inner.lock().unwrap().clone()
    }
}

/// Result of one cycle: when to come back, and the error if the cycle did
/// not fully converge. Prune failures are reported here without blocking
/// the revision update.
pub struct Outcome {
    pub requeue_after: Duration,
    pub error: Option<ReconcileError>,
}

pub struct Engine {
    pub instances: Arc<InstanceSet>,
    evaluator: Arc<dyn Evaluator>,
    fetcher: Arc<dyn Fetcher>,
    clusters: Arc<dyn ClusterProvider>,
    status: Arc<dyn StatusStore>,
    events: Arc<dyn EventSink>,
    opts: EngineOptions,
    last_attempt: Mutex<FxHashMap<ObjectKey, Instant>>,
}

impl Engine {
    pub fn new(
        instances: Arc<InstanceSet>,
        evaluator: Arc<dyn Evaluator>,
        fetcher: Arc<dyn Fetcher>,
        clusters: Arc<dyn ClusterProvider>,
        status: Arc<dyn StatusStore>,
        events: Arc<dyn EventSink>,
        opts: EngineOptions,
    ) -> Self {
        Self {
            instances,
            evaluator,
            fetcher,
            clusters,
            status,
            events,
            opts,
            last_attempt: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn status_store(&self) -> &Arc<dyn StatusStore> {
        &self.status
    }

    /// Field-ownership identity for server-side apply; stable per instance
    /// so re-application supersedes our own fields only.
    fn manager(&self, key: &ObjectKey) -> String {
        format!("{}/{}", self.opts.controller_name, key)
    }

    fn event(&self, key: &ObjectKey, kind: EventKind, message: impl Into<String>) {
        self.events.record(Event { kind, instance: key.clone(), message: message.into() });
    }

    /// Run one reconcile cycle for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Outcome {
        let t0 = Instant::now();
        counter!("cueflow_reconcile_total", 1u64);
        let out = self.cycle(key).await;
        histogram!("cueflow_reconcile_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if out.error.is_some() {
            counter!("cueflow_reconcile_errors", 1u64);
        }
        out
    }

    async fn cycle(&self, key: &ObjectKey) -> Outcome {
        let Some(spec) = self.instances.get(key) else {
            debug!(instance = %key, "instance no longer registered");
            return Outcome { requeue_after: Duration::ZERO, error: None };
        };

        if let Err(e) = self.check_references(key, &spec) {
            return self.fail(key, &spec, e);
        }

        if let Some(holdoff) = self.dependencies_not_ready(key, &spec) {
            let mut status = self.status.load(key);
            set_condition(
                &mut status.conditions,
                READY,
                ConditionStatus::False,
                reason::DEPENDENCY_NOT_READY,
                &holdoff,
            );
            self.status.save(key, status);
            self.event(key, EventKind::DependencyNotReady, holdoff);
            return Outcome { requeue_after: self.opts.requeue_dependency, error: None };
        }

        let source = spec.source_ref.key_in(&key.namespace);
        let artifact = match self.fetcher.fetch(&source).await {
            Ok(a) => a,
            Err(e) => return self.fail(key, &spec, e),
        };

        let mut status = self.status.load(key);
        let elapsed = self.last_attempt.lock().unwrap().get(key).map(|t| t.elapsed());
        match track::decide(
            &artifact.revision,
            status.last_attempted_revision.as_deref(),
            spec.suspend,
            elapsed,
            spec.interval,
            self.opts.min_interval,
        ) {
            Decision::Proceed => {}
            Decision::SkipSuspended => {
                debug!(instance = %key, "suspended; skipping");
                return Outcome { requeue_after: Duration::ZERO, error: None };
            }
            Decision::SkipUpToDate { retry_in } | Decision::SkipTooSoon { retry_in } => {
                return Outcome { requeue_after: retry_in, error: None };
            }
        }

        // Checkpoint: the attempted revision lands before any build step, so
        // a crash mid-build is distinguishable from "never attempted".
        self.last_attempt.lock().unwrap().insert(key.clone(), Instant::now());
        status.last_attempted_revision = Some(artifact.revision.clone());
        set_condition(
            &mut status.conditions,
            RECONCILING,
            ConditionStatus::True,
            reason::PROGRESSING,
            &format!("reconciling revision {}", artifact.revision),
        );
        self.status.save(key, status.clone());
        info!(instance = %key, revision = %artifact.revision, "reconciling");

        // Build, gate, validate. No cluster mutation yet; any error here
        // aborts with the inventory untouched.
        let input = ModuleInput {
            dir: artifact.dir.clone(),
            root: spec.root.clone(),
            path: spec.path.clone(),
            package: spec.package.clone(),
            tags: spec.tags.clone(),
        };
        let validated = match self.build(&spec, &input) {
            Ok(v) => v,
            Err(e) => return self.fail(key, &spec, e),
        };
        for w in &validated.warnings {
            self.event(key, EventKind::ValidationWarning, w.clone());
        }

        let plan = cueflow_plan::plan(status.inventory.as_ref(), validated.manifests, spec.prune);
        let summary = plan.summary();

        let handle = match self.clusters.resolve(spec.cluster_ref.as_ref()).await {
            Ok(h) => h,
            Err(e) => return self.fail(key, &spec, e),
        };

        if let Err(e) = apply_set(handle.as_ref(), &plan.to_apply, &self.manager(key)).await {
            // Inventory stays at last known-good; next cycle retries from it.
            return self.fail(key, &spec, e);
        }
        self.event(key, EventKind::ApplySucceeded, format!("applied {} resources", summary.apply));

        let prune = prune_set(handle.as_ref(), &plan.to_prune).await;
        if prune.pruned > 0 {
            self.event(key, EventKind::PruneSucceeded, format!("pruned {} resources", prune.pruned));
        }
        let prune_error = prune.error();
        if let Some(e) = &prune_error {
            warn!(instance = %key, error = %e, "prune incomplete; will retry next cycle");
        }

        let verdict =
            cueflow_apply::health::wait_ready(handle.as_ref(), &plan.new_inventory.entries, spec.timeout)
                .await;

        // Reporting: applied revision and inventory move together, and only
        // because apply fully succeeded. Health is advisory on top. Refs
        // that failed to prune stay recorded as owned so the next cycle
        // retries their deletion.
        let mut inventory = plan.new_inventory;
        for (r, _) in prune.failed {
            if !inventory.contains_id(&r.id) {
                inventory.entries.push(r);
            }
        }
        status.last_applied_revision = Some(artifact.revision.clone());
        status.inventory = Some(inventory);
        remove_condition(&mut status.conditions, RECONCILING);
        match &verdict {
            ReadyVerdict::Ready => {
                set_condition(
                    &mut status.conditions,
                    READY,
                    ConditionStatus::True,
                    reason::RECONCILIATION_SUCCEEDED,
                    &format!("applied revision {}", artifact.revision),
                );
                self.event(key, EventKind::Ready, format!("revision {} ready", artifact.revision));
            }
            ReadyVerdict::Failed { id, message } => {
                set_condition(
                    &mut status.conditions,
                    READY,
                    ConditionStatus::False,
                    reason::HEALTH_CHECK_FAILED,
                    &format!("{id}: {message}"),
                );
                self.event(key, EventKind::HealthTimeout, format!("{id} failed: {message}"));
            }
            ReadyVerdict::TimedOut { pending } => {
                set_condition(
                    &mut status.conditions,
                    READY,
                    ConditionStatus::False,
                    reason::HEALTH_CHECK_FAILED,
                    &format!("timeout waiting for: {}", pending.join(", ")),
                );
                self.event(
                    key,
                    EventKind::HealthTimeout,
                    format!("health check timed out for {} resources", pending.len()),
                );
            }
        }
        self.status.save(key, status);
        info!(instance = %key, revision = %artifact.revision, ready = matches!(verdict, ReadyVerdict::Ready), "cycle complete");

        Outcome { requeue_after: spec.interval, error: prune_error }
    }

    fn build(
        &self,
        spec: &InstanceSpec,
        input: &ModuleInput,
    ) -> Result<cueflow_module::Validated, ReconcileError> {
        let ctx = self.evaluator.evaluate(input)?;
        let manifests = build_manifests(ctx.as_ref(), &spec.exprs)?;
        let gated = filter_gated(ctx.as_ref(), &spec.gates, manifests)?;
        validate(ctx.as_ref(), spec.validate.as_ref(), gated)
    }

    fn check_references(&self, key: &ObjectKey, spec: &InstanceSpec) -> Result<(), ReconcileError> {
        if !self.opts.no_cross_namespace_refs {
            return Ok(());
        }
        let source = spec.source_ref.key_in(&key.namespace);
        if source.namespace != key.namespace {
            return Err(ReconcileError::access_denied(format!(
                "source {source} is outside namespace {}",
                key.namespace
            )));
        }
        for dep in &spec.depends_on {
            if dep.namespace != key.namespace {
                return Err(ReconcileError::access_denied(format!(
                    "dependency {dep} is outside namespace {}",
                    key.namespace
                )));
            }
        }
        Ok(())
    }

    /// Hold off while any `depends_on` entry is missing or not ready;
    /// returns the reason message when blocked.
    fn dependencies_not_ready(&self, _key: &ObjectKey, spec: &InstanceSpec) -> Option<String> {
        for dep in &spec.depends_on {
            if self.instances.get(dep).is_none() {
                return Some(format!("dependency {dep} is not registered"));
            }
            let dep_status = self.status.load(dep);
            if !dep_status.is_ready() {
                return Some(format!("dependency {dep} is not ready"));
            }
            if dep_status.last_applied_revision.is_none() {
                return Some(format!("dependency {dep} has not applied any revision"));
            }
        }
        None
    }

    fn fail(&self, key: &ObjectKey, spec: &InstanceSpec, err: ReconcileError) -> Outcome {
        warn!(instance = %key, error = %err, reason = err.reason(), "reconcile failed");
        let mut status = self.status.load(key);
        remove_condition(&mut status.conditions, RECONCILING);
        set_condition(
            &mut status.conditions,
            READY,
            ConditionStatus::False,
            err.reason(),
            &err.to_string(),
        );
        self.status.save(key, status);
        if matches!(err, ReconcileError::Build(_) | ReconcileError::Validation(_)) {
            self.event(key, EventKind::BuildFailed, err.to_string());
        }
        let requeue_after = if err.is_fatal() {
            // Config errors wait for a spec change.
            Duration::ZERO
        } else if err.is_transient() {
            self.opts.retry_backoff
        } else {
            spec.interval
        };
        Outcome { requeue_after, error: Some(err) }
    }

    /// Mark every member of a dependency cycle as a config error. Called by
    /// the scheduler when ordering dependents fails.
    pub fn report_cycle(&self, cycle: &[ObjectKey]) {
        let names: Vec<String> = cycle.iter().map(|k| k.to_string()).collect();
        for key in cycle {
            let err = ReconcileError::dependency_cycle(&names);
            let mut status = self.status.load(key);
            set_condition(
                &mut status.conditions,
                READY,
                ConditionStatus::False,
                reason::DEPENDENCY_CYCLE,
                &err.to_string(),
            );
            self.status.save(key, status);
            self.event(key, EventKind::DependencyCycle, err.to_string());
        }
    }
}

#[cfg(test)]
mod tests;
