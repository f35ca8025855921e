//! Structured events emitted per reconcile cycle.

use serde::{Deserialize, Serialize};

use crate::instance::ObjectKey;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    BuildFailed,
    ValidationWarning,
    ApplySucceeded,
    PruneSucceeded,
    HealthTimeout,
    Ready,
    DependencyCycle,
    DependencyNotReady,
}

impl EventKind {
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EventKind::BuildFailed
                | EventKind::ValidationWarning
                | EventKind::HealthTimeout
                | EventKind::DependencyCycle
                | EventKind::DependencyNotReady
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub instance: ObjectKey,
    pub message: String,
}

/// Sink for cycle events; the engine never depends on delivery.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Discards everything; useful in tests that don't assert on events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: Event) {}
}
