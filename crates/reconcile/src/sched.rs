//! Bounded scheduler: at most one in-flight cycle per instance, a worker
//! pool across instances, interval requeues, and dependency fan-out on
//! ready transitions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use cueflow_core::ObjectKey;

use crate::deps::{schedule_order, watchers_of_source};
use crate::Engine;

fn queue_cap() -> usize {
    std::env::var("CUEFLOW_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(256)
}

pub fn default_workers() -> usize {
    std::env::var("CUEFLOW_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(4)
}

#[derive(Default)]
struct DispatchState {
    inflight: FxHashSet<ObjectKey>,
    rerun: FxHashSet<ObjectKey>,
}

/// Handle to a running scheduler.
#[derive(Clone)]
pub struct Scheduler {
    engine: Arc<Engine>,
    tx: mpsc::Sender<ObjectKey>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    /// Spawn the dispatch loop with `workers` concurrent cycles.
    pub fn spawn(engine: Arc<Engine>, workers: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ObjectKey>(queue_cap());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sched = Self { engine: engine.clone(), tx: tx.clone(), shutdown: Arc::new(shutdown) };
        let state = Arc::new(Mutex::new(DispatchState::default()));
        let permits = Arc::new(Semaphore::new(workers.max(1)));

        let dispatcher = sched.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(key) => dispatcher.dispatch(key, &state, &permits, &shutdown_rx),
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        });
        sched
    }

    /// Queue an instance for reconciliation.
    pub fn enqueue(&self, key: ObjectKey) {
        if self.tx.try_send(key.clone()).is_err() {
            warn!(instance = %key, "reconcile queue full or closed; dropping enqueue");
        }
    }

    /// Source revision changed: schedule every instance watching it, in
    /// dependency order, skipping those that already attempted `revision`.
    /// A `depends_on` cycle schedules none of its members and reports the
    /// config error against each.
    pub fn notify_source(&self, source: &ObjectKey, revision: Option<&str>) {
        let specs = self.engine.instances.all();
        let mut keys = watchers_of_source(&specs, source);
        if let Some(rev) = revision {
            keys.retain(|k| {
                self.engine.status_store().load(k).last_attempted_revision.as_deref() != Some(rev)
            });
        }
        match schedule_order(&keys, &specs) {
            Ok(ordered) => {
                for k in ordered {
                    self.enqueue(k);
                }
            }
            Err(cycle) => self.engine.report_cycle(&cycle),
        }
    }

    /// Stop accepting work and abort in-flight cycles at their next await
    /// point; aborted cycles leave status untouched unless they already
    /// reported.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn dispatch(
        &self,
        key: ObjectKey,
        state: &Arc<Mutex<DispatchState>>,
        permits: &Arc<Semaphore>,
        shutdown_rx: &watch::Receiver<bool>,
    ) {
        {
            let mut s = state.lock().unwrap();
            if s.inflight.contains(&key) {
                // Coalesce: run once more after the current cycle finishes.
                s.rerun.insert(key);
                return;
            }
            s.inflight.insert(key.clone());
        }
        let this = self.clone();
        let state = state.clone();
        let permits = permits.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else { return };
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(instance = %key, "cycle aborted by shutdown");
                }
                outcome = this.run_cycle(&key) => {
                    if outcome > Duration::ZERO {
                        this.requeue_later(key.clone(), outcome);
                    }
                }
            }
            let rerun = {
                let mut s = state.lock().unwrap();
                s.inflight.remove(&key);
                s.rerun.remove(&key)
            };
            if rerun {
                this.enqueue(key);
            }
        });
    }

    async fn run_cycle(&self, key: &ObjectKey) -> Duration {
        let before = self.engine.status_store().load(key);
        let outcome = self.engine.reconcile(key).await;
        let after = self.engine.status_store().load(key);

        // Ready transition with a newly applied revision wakes up direct
        // dependents; they are never scheduled before this point.
        let newly_applied = after.last_applied_revision.is_some()
            && after.last_applied_revision != before.last_applied_revision;
        if after.is_ready() && newly_applied {
            self.notify_dependents(key, after.last_applied_revision.as_deref());
        }
        outcome.requeue_after
    }

    fn notify_dependents(&self, key: &ObjectKey, revision: Option<&str>) {
        let specs = self.engine.instances.all();
        let mut keys: Vec<ObjectKey> = specs
            .iter()
            .filter(|(_, s)| s.depends_on.contains(key))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        if let Some(rev) = revision {
            keys.retain(|k| {
                self.engine.status_store().load(k).last_attempted_revision.as_deref() != Some(rev)
            });
        }
        match schedule_order(&keys, &specs) {
            Ok(ordered) => {
                for k in ordered {
                    debug!(instance = %k, dependency = %key, "scheduling dependent");
                    self.enqueue(k);
                }
            }
            Err(cycle) => self.engine.report_cycle(&cycle),
        }
    }

    fn requeue_later(&self, key: ObjectKey, after: Duration) {
        let tx = self.tx.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(key).await;
                }
                _ = shutdown_rx.changed() => {}
            }
        });
    }
}
