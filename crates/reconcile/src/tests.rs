use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as Json};

use cueflow_apply::mem::{MemCluster, MemProvider};
use cueflow_apply::HealthStatus;
use cueflow_core::condition::reason;
use cueflow_core::instance::{GateExpr, SourceRef, TagVar, Validation, ValidationEncoding, ValidationMode};
use cueflow_core::{Event, EventKind, EventSink, InstanceSpec, ObjectKey, ReconcileError};
use cueflow_module::script::{ScriptedEvaluator, ScriptedModule};

use crate::sched::Scheduler;
use crate::{Artifact, Engine, EngineOptions, Fetcher, InstanceSet, MemStatusStore, StatusStore};

struct ScriptedFetcher {
    revision: Mutex<String>,
}

impl ScriptedFetcher {
    fn new(revision: &str) -> Self {
        Self { revision: Mutex::new(revision.to_string()) }
    }

    fn set_revision(&self, revision: &str) {
        *self.revision.lock().unwrap() = revision.to_string();
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, _source: &ObjectKey) -> Result<Artifact, ReconcileError> {
        Ok(Artifact {
            dir: PathBuf::from("/tmp/artifact"),
            revision: self.revision.lock().unwrap().clone(),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

struct Rig {
    engine: Arc<Engine>,
    instances: Arc<InstanceSet>,
    status: Arc<MemStatusStore>,
    cluster: Arc<MemCluster>,
    fetcher: Arc<ScriptedFetcher>,
    events: Arc<RecordingSink>,
}

fn rig_with(evaluator: ScriptedEvaluator, opts: EngineOptions) -> Rig {
    let instances = Arc::new(InstanceSet::default());
    let status = Arc::new(MemStatusStore::new());
    let cluster = Arc::new(MemCluster::new());
    let fetcher = Arc::new(ScriptedFetcher::new("main/abc123"));
    let events = Arc::new(RecordingSink::default());
    let engine = Arc::new(Engine::new(
        instances.clone(),
        Arc::new(evaluator),
        fetcher.clone(),
        Arc::new(MemProvider(cluster.clone())),
        status.clone(),
        events.clone(),
        opts,
    ));
    Rig { engine, instances, status, cluster, fetcher, events }
}

fn rig(evaluator: ScriptedEvaluator) -> Rig {
    rig_with(evaluator, EngineOptions::default())
}

fn spec(tags: &[(&str, &str)]) -> InstanceSpec {
    InstanceSpec {
        source_ref: SourceRef { kind: "GitRepository".into(), name: "repo".into(), namespace: None },
        root: "./app".into(),
        path: String::new(),
        package: String::new(),
        exprs: vec!["out".into()],
        tags: tags
            .iter()
            .map(|(n, v)| TagVar { name: (*n).into(), value: (*v).into() })
            .collect(),
        gates: vec![],
        validate: None,
        interval: Duration::ZERO,
        timeout: Duration::ZERO,
        suspend: false,
        prune: true,
        depends_on: vec![],
        cluster_ref: None,
    }
}

fn deployment(ns: &str, name: &str) -> Json {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": ns},
        "spec": {"replicas": 1}
    })
}

fn configmap(ns: &str, name: &str) -> Json {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": ns},
        "data": {}
    })
}

fn tag_named_deployment() -> ScriptedEvaluator {
    ScriptedEvaluator::new(|i| {
        let name = i.tag("name").unwrap_or("unnamed").to_string();
        Ok(ScriptedModule::new().expr("out", deployment("apps", &name)))
    })
}

#[tokio::test]
async fn first_reconcile_applies_and_reports_revision() {
    let r = rig(tag_named_deployment());
    let key = ObjectKey::new("ns", "inst");
    r.instances.upsert(key.clone(), spec(&[("name", "app1")]));

    let out = r.engine.reconcile(&key).await;
    assert!(out.error.is_none());

    let status = r.status.load(&key);
    assert_eq!(status.last_attempted_revision.as_deref(), Some("main/abc123"));
    assert_eq!(status.last_applied_revision.as_deref(), Some("main/abc123"));
    let inv = status.inventory.clone().unwrap();
    assert_eq!(inv.entries.len(), 1);
    assert_eq!(inv.entries[0].id, "apps_app1_apps_Deployment");
    assert!(status.is_ready());
    assert!(r.cluster.contains("apps_app1_apps_Deployment"));
    assert!(r.events.kinds().contains(&EventKind::Ready));
}

#[tokio::test]
async fn same_revision_twice_is_idempotent() {
    let r = rig(tag_named_deployment());
    let key = ObjectKey::new("ns", "inst");
    r.instances.upsert(key.clone(), spec(&[("name", "app1")]));

    r.engine.reconcile(&key).await;
    let inv1 = r.status.load(&key).inventory.unwrap();
    r.engine.reconcile(&key).await;
    let inv2 = r.status.load(&key).inventory.unwrap();

    assert_eq!(inv1, inv2);
    assert!(r.cluster.deleted_log().is_empty(), "no prunes on an unchanged revision");
}

#[tokio::test]
async fn partial_apply_failure_leaves_inventory_at_last_known_good() {
    let module = Arc::new(Mutex::new(
        ScriptedModule::new().expr("out", json!([configmap("ns", "a"), configmap("ns", "b")])),
    ));
    let script = module.clone();
    let r = rig(ScriptedEvaluator::new(move |_| Ok(script.lock().unwrap().clone())));
    let key = ObjectKey::new("ns", "inst");
    r.instances.upsert(key.clone(), spec(&[]));

    r.engine.reconcile(&key).await;
    let good = r.status.load(&key).inventory.unwrap();
    assert_eq!(good.entries.len(), 2);

    // New revision renders c and d; the second apply of the cycle fails.
    *module.lock().unwrap() =
        ScriptedModule::new().expr("out", json!([configmap("ns", "c"), configmap("ns", "d")]));
    r.fetcher.set_revision("main/def456");
    r.cluster.fail_apply_at(3);

    let out = r.engine.reconcile(&key).await;
    match out.error {
        Some(ReconcileError::Apply { applied, total, .. }) => {
            assert_eq!((applied, total), (1, 2));
        }
        other => panic!("expected apply error, got {other:?}"),
    }

    let status = r.status.load(&key);
    assert_eq!(status.last_attempted_revision.as_deref(), Some("main/def456"));
    assert_eq!(status.last_applied_revision.as_deref(), Some("main/abc123"));
    assert_eq!(status.inventory.clone().unwrap(), good, "inventory must not reflect a partial apply");
    assert!(!status.is_ready());
    assert_eq!(status.condition("Ready").unwrap().reason, reason::APPLY_FAILED);
    // No prune ran: a and b survive until a cycle fully succeeds.
    assert!(r.cluster.deleted_log().is_empty());
    assert!(r.cluster.contains("ns_a__ConfigMap"));
}

#[tokio::test]
async fn gate_flip_adds_then_prunes_the_gated_resource() {
    let ev = ScriptedEvaluator::new(|i| {
        Ok(ScriptedModule::new()
            .expr("out", configmap("cue-gate", i.tag("name").unwrap_or("cm")))
            .gate("tagGate", i.tag("gate") == Some("dummy")))
    });
    let r = rig(ev);
    let key = ObjectKey::new("ns", "inst");
    let mut s = spec(&[("gate", "tummy"), ("name", "podinfo")]);
    s.gates = vec![GateExpr { name: "deploy".into(), expr: "tagGate".into() }];
    r.instances.upsert(key.clone(), s.clone());

    r.engine.reconcile(&key).await;
    assert!(!r.cluster.contains("cue-gate_podinfo__ConfigMap"));
    assert!(r.status.load(&key).inventory.unwrap().is_empty());

    // Only the tag changes; the gate opens and the resource appears.
    s.tags[0].value = "dummy".into();
    r.instances.upsert(key.clone(), s.clone());
    r.engine.reconcile(&key).await;
    assert!(r.cluster.contains("cue-gate_podinfo__ConfigMap"));

    // Closing it again prunes the resource out of the inventory.
    s.tags[0].value = "tummy".into();
    r.instances.upsert(key.clone(), s);
    r.engine.reconcile(&key).await;
    assert!(!r.cluster.contains("cue-gate_podinfo__ConfigMap"));
    assert!(r.status.load(&key).inventory.unwrap().is_empty());
}

#[tokio::test]
async fn drop_policy_applies_only_conforming_manifests() {
    let ev = ScriptedEvaluator::new(|_| {
        let good = {
            let mut m = configmap("default", "test-good");
            m["metadata"]["labels"] = json!({"owner": "platform"});
            m
        };
        let also_good = {
            let mut m = configmap("default", "test-ok");
            m["metadata"]["labels"] = json!({"owner": "platform"});
            m
        };
        Ok(ScriptedModule::new()
            .expr("out", json!([good, configmap("default", "test-bad"), also_good]))
            .schema("#HasOwnerLabel", |m: &Json| {
                m.pointer("/metadata/labels/owner")
                    .is_none()
                    .then(|| "missing label \"owner\"".to_string())
            }))
    });
    let r = rig(ev);
    let key = ObjectKey::new("ns", "inst");
    let mut s = spec(&[]);
    s.validate = Some(Validation {
        mode: ValidationMode::Drop,
        schema: "#HasOwnerLabel".into(),
        encoding: ValidationEncoding::Yaml,
    });
    r.instances.upsert(key.clone(), s);

    let out = r.engine.reconcile(&key).await;
    assert!(out.error.is_none());
    let inv = r.status.load(&key).inventory.unwrap();
    assert_eq!(inv.entries.len(), 2);
    assert!(r.cluster.contains("default_test-good__ConfigMap"));
    assert!(!r.cluster.contains("default_test-bad__ConfigMap"));
    assert!(r.events.kinds().contains(&EventKind::ValidationWarning));
}

#[tokio::test]
async fn build_failure_marks_attempted_but_not_applied() {
    let r = rig(ScriptedEvaluator::new(|_| Err("cue: field \"out\" not allowed".into())));
    let key = ObjectKey::new("ns", "inst");
    let mut s = spec(&[]);
    s.interval = Duration::from_secs(60);
    r.instances.upsert(key.clone(), s);

    let out = r.engine.reconcile(&key).await;
    assert_eq!(out.requeue_after, Duration::from_secs(60));
    assert_eq!(out.error.unwrap().reason(), "BuildFailed");

    let status = r.status.load(&key);
    assert_eq!(status.last_attempted_revision.as_deref(), Some("main/abc123"));
    assert!(status.last_applied_revision.is_none());
    assert!(status.inventory.is_none());
    assert_eq!(status.condition("Ready").unwrap().reason, reason::BUILD_FAILED);
    assert!(r.events.kinds().contains(&EventKind::BuildFailed));
    assert!(r.cluster.is_empty());
}

#[tokio::test]
async fn undefined_gate_is_fatal_and_not_requeued() {
    let ev = ScriptedEvaluator::new(|_| {
        let mut m = configmap("ns", "cm");
        m["metadata"]["annotations"] = json!({"cueflow.dev/gates": "missing"});
        Ok(ScriptedModule::new().expr("out", m))
    });
    let r = rig(ev);
    let key = ObjectKey::new("ns", "inst");
    r.instances.upsert(key.clone(), spec(&[]));

    let out = r.engine.reconcile(&key).await;
    assert_eq!(out.requeue_after, Duration::ZERO);
    let err = out.error.unwrap();
    assert!(err.is_fatal());
    assert_eq!(err.reason(), "UndefinedGate");
}

#[tokio::test]
async fn dependency_holdoff_until_dependency_reports_ready() {
    let mut opts = EngineOptions::default();
    opts.requeue_dependency = Duration::from_millis(10);
    let r = rig_with(tag_named_deployment(), opts);
    let a = ObjectKey::new("ns", "a");
    let b = ObjectKey::new("ns", "b");
    r.instances.upsert(a.clone(), spec(&[("name", "a")]));
    let mut sb = spec(&[("name", "b")]);
    sb.depends_on = vec![a.clone()];
    r.instances.upsert(b.clone(), sb);

    let out = r.engine.reconcile(&b).await;
    assert_eq!(out.requeue_after, Duration::from_millis(10));
    assert!(!r.cluster.contains("apps_b_apps_Deployment"));
    assert_eq!(
        r.status.load(&b).condition("Ready").unwrap().reason,
        reason::DEPENDENCY_NOT_READY
    );
    assert!(r.events.kinds().contains(&EventKind::DependencyNotReady));

    r.engine.reconcile(&a).await;
    assert!(r.status.load(&a).is_ready());
    r.engine.reconcile(&b).await;
    assert!(r.cluster.contains("apps_b_apps_Deployment"));
}

#[tokio::test]
async fn cross_namespace_source_is_denied_when_configured() {
    let mut opts = EngineOptions::default();
    opts.no_cross_namespace_refs = true;
    let r = rig_with(tag_named_deployment(), opts);
    let key = ObjectKey::new("ns", "inst");
    let mut s = spec(&[("name", "x")]);
    s.source_ref.namespace = Some("other".into());
    r.instances.upsert(key.clone(), s);

    let out = r.engine.reconcile(&key).await;
    assert_eq!(out.requeue_after, Duration::ZERO);
    let err = out.error.unwrap();
    assert!(err.is_fatal());
    assert_eq!(err.reason(), "AccessDenied");
}

#[tokio::test]
async fn health_timeout_is_reported_but_apply_stays_committed() {
    std::env::set_var("CUEFLOW_HEALTH_POLL_MS", "5");
    let r = rig(tag_named_deployment());
    let key = ObjectKey::new("ns", "inst");
    r.instances.upsert(key.clone(), spec(&[("name", "slow")]));
    r.cluster.set_health("apps_slow_apps_Deployment", HealthStatus::InProgress);

    let out = r.engine.reconcile(&key).await;
    assert!(out.error.is_none(), "health timeout is advisory");

    let status = r.status.load(&key);
    assert_eq!(status.last_applied_revision.as_deref(), Some("main/abc123"));
    assert!(status.inventory.is_some());
    assert!(!status.is_ready());
    assert_eq!(status.condition("Ready").unwrap().reason, reason::HEALTH_CHECK_FAILED);
    assert!(r.events.kinds().contains(&EventKind::HealthTimeout));
}

#[tokio::test]
async fn suspended_instance_is_skipped_untouched() {
    let r = rig(tag_named_deployment());
    let key = ObjectKey::new("ns", "inst");
    let mut s = spec(&[("name", "x")]);
    s.suspend = true;
    r.instances.upsert(key.clone(), s);

    let out = r.engine.reconcile(&key).await;
    assert_eq!(out.requeue_after, Duration::ZERO);
    assert!(out.error.is_none());
    assert!(r.status.load(&key).last_attempted_revision.is_none());
    assert!(r.cluster.is_empty());
}

#[tokio::test]
async fn prune_failure_does_not_block_revision_update() {
    let module = Arc::new(Mutex::new(
        ScriptedModule::new().expr("out", json!([configmap("ns", "a"), configmap("ns", "b")])),
    ));
    let script = module.clone();
    let r = rig(ScriptedEvaluator::new(move |_| Ok(script.lock().unwrap().clone())));
    let key = ObjectKey::new("ns", "inst");
    r.instances.upsert(key.clone(), spec(&[]));
    r.engine.reconcile(&key).await;

    *module.lock().unwrap() = ScriptedModule::new().expr("out", json!([configmap("ns", "b")]));
    r.fetcher.set_revision("main/def456");
    r.cluster.fail_delete_of("ns_a__ConfigMap");

    let out = r.engine.reconcile(&key).await;
    assert_eq!(out.error.as_ref().map(|e| e.reason()), Some("PruneFailed"));

    let status = r.status.load(&key);
    // Applies committed, so the revision moves forward; the ref that failed
    // to delete stays recorded as owned.
    assert_eq!(status.last_applied_revision.as_deref(), Some("main/def456"));
    let inv = status.inventory.unwrap();
    assert_eq!(inv.entries.len(), 2);
    assert!(inv.contains_id("ns_a__ConfigMap"));
    assert!(r.cluster.contains("ns_a__ConfigMap"));

    r.cluster.clear_failures();
    r.fetcher.set_revision("main/ghi789");
    let out = r.engine.reconcile(&key).await;
    assert!(out.error.is_none());
    // Retried on the next cycle and gone for good.
    assert!(!r.cluster.contains("ns_a__ConfigMap"));
    assert!(r.cluster.contains("ns_b__ConfigMap"));
    assert_eq!(r.status.load(&key).inventory.unwrap().entries.len(), 1);
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn scheduler_runs_dependents_in_dependency_order() {
    let mut opts = EngineOptions::default();
    opts.requeue_dependency = Duration::from_millis(10);
    let r = rig_with(tag_named_deployment(), opts);
    let a = ObjectKey::new("ns", "a");
    let b = ObjectKey::new("ns", "b");
    let c = ObjectKey::new("ns", "c");
    r.instances.upsert(a.clone(), spec(&[("name", "a")]));
    let mut sb = spec(&[("name", "b")]);
    sb.depends_on = vec![a.clone()];
    r.instances.upsert(b.clone(), sb);
    let mut sc = spec(&[("name", "c")]);
    sc.depends_on = vec![b.clone()];
    r.instances.upsert(c.clone(), sc);

    let sched = Scheduler::spawn(r.engine.clone(), 1);
    sched.notify_source(&ObjectKey::new("ns", "repo"), None);

    let status = r.status.clone();
    wait_until(move || {
        [&ObjectKey::new("ns", "a"), &ObjectKey::new("ns", "b"), &ObjectKey::new("ns", "c")]
            .iter()
            .all(|k| status.load(k).is_ready())
    })
    .await;
    sched.stop();

    let log = r.cluster.applied_log();
    let pos = |id: &str| log.iter().position(|x| x == id).unwrap();
    assert!(pos("apps_a_apps_Deployment") < pos("apps_b_apps_Deployment"));
    assert!(pos("apps_b_apps_Deployment") < pos("apps_c_apps_Deployment"));
}

#[tokio::test]
async fn dependency_cycle_schedules_nothing_and_marks_all_members() {
    let r = rig(tag_named_deployment());
    let a = ObjectKey::new("ns", "a");
    let b = ObjectKey::new("ns", "b");
    let mut sa = spec(&[("name", "a")]);
    sa.depends_on = vec![b.clone()];
    r.instances.upsert(a.clone(), sa);
    let mut sb = spec(&[("name", "b")]);
    sb.depends_on = vec![a.clone()];
    r.instances.upsert(b.clone(), sb);

    let sched = Scheduler::spawn(r.engine.clone(), 2);
    sched.notify_source(&ObjectKey::new("ns", "repo"), None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    sched.stop();

    assert!(r.cluster.is_empty(), "no member of a cycle may be scheduled");
    for k in [&a, &b] {
        assert_eq!(
            r.status.load(k).condition("Ready").unwrap().reason,
            reason::DEPENDENCY_CYCLE
        );
    }
    assert_eq!(
        r.events.kinds().iter().filter(|k| **k == EventKind::DependencyCycle).count(),
        2
    );
}
