//! Health gate: reduce a resource's reported status to a verdict and poll
//! the applied set up to a timeout. Polling is advisory; it never mutates
//! and never rolls anything back.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use cueflow_core::ResourceRef;

use crate::{ClusterHandle, StatusPoller};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    InProgress,
    Failed(String),
}

/// Verdict for one applied set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyVerdict {
    Ready,
    /// A resource reported a terminal failure.
    Failed { id: String, message: String },
    /// The timeout elapsed with these ids still in progress.
    TimedOut { pending: Vec<String> },
}

fn condition<'a>(status: &'a Json, type_: &str) -> Option<&'a Json> {
    status
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
}

fn condition_true(status: &Json, type_: &str) -> Option<bool> {
    condition(status, type_)
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
        .map(|s| s == "True")
}

/// Reduce a live object to a health verdict.
///
/// Rules, in order: terminal conditions (`Stalled`, `Degraded`, `Failed`)
/// win; a stale `observedGeneration` means in-progress; `Ready`/`Available`
/// conditions are authoritative when present; replica counts are compared
/// when both sides report them; objects exposing no status are immediately
/// healthy.
pub fn reduce_status(raw: &Json) -> HealthStatus {
    let Some(status) = raw.get("status") else {
        return HealthStatus::Healthy;
    };

    for terminal in ["Stalled", "Degraded", "Failed"] {
        if condition_true(status, terminal) == Some(true) {
            let msg = condition(status, terminal)
                .and_then(|c| c.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("terminal condition")
                .to_string();
            return HealthStatus::Failed(msg);
        }
    }

    if let (Some(observed), Some(generation)) = (
        status.get("observedGeneration").and_then(|v| v.as_i64()),
        raw.pointer("/metadata/generation").and_then(|v| v.as_i64()),
    ) {
        if observed < generation {
            return HealthStatus::InProgress;
        }
    }

    for ready_like in ["Ready", "Available"] {
        if let Some(v) = condition_true(status, ready_like) {
            return if v { HealthStatus::Healthy } else { HealthStatus::InProgress };
        }
    }

    if let (Some(desired), Some(ready)) = (
        raw.pointer("/spec/replicas").and_then(|v| v.as_i64()),
        status.get("readyReplicas").and_then(|v| v.as_i64()),
    ) {
        return if ready >= desired { HealthStatus::Healthy } else { HealthStatus::InProgress };
    }

    HealthStatus::Healthy
}

fn poll_interval() -> Duration {
    let ms = std::env::var("CUEFLOW_HEALTH_POLL_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2_000);
    Duration::from_millis(ms)
}

/// Poll every ref until all are healthy, one fails terminally, or `timeout`
/// elapses. Poll errors count as still-in-progress; readiness is advisory.
pub async fn wait_ready(
    poller: &dyn ClusterHandle,
    refs: &[ResourceRef],
    timeout: Duration,
) -> ReadyVerdict {
    if refs.is_empty() {
        return ReadyVerdict::Ready;
    }
    let interval = poll_interval();
    let deadline = Instant::now() + timeout;
    loop {
        let mut pending = Vec::new();
        for r in refs {
            match poller.poll(r).await {
                Ok(HealthStatus::Healthy) => {}
                Ok(HealthStatus::InProgress) => pending.push(r.id.clone()),
                Ok(HealthStatus::Failed(message)) => {
                    return ReadyVerdict::Failed { id: r.id.clone(), message };
                }
                Err(e) => {
                    warn!(id = %r.id, error = %e, "health poll failed; treating as in-progress");
                    pending.push(r.id.clone());
                }
            }
        }
        if pending.is_empty() {
            return ReadyVerdict::Ready;
        }
        debug!(pending = pending.len(), "waiting for readiness");
        let now = Instant::now();
        if now >= deadline {
            return ReadyVerdict::TimedOut { pending };
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
