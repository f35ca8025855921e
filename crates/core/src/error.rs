//! Error taxonomy for the reconcile cycle.
//!
//! Only config errors are fatal (they require a spec change); everything
//! else is retried at the instance interval or a shorter backoff.

use crate::condition::reason;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Malformed spec: undefined gate, dependency cycle, denied reference.
    #[error("config: {message}")]
    Config { reason: &'static str, message: String },

    #[error("fetch: {0}")]
    Fetch(String),

    #[error("credential: {0}")]
    Credential(String),

    /// CUE evaluation failure; never yields a partial manifest set.
    #[error("build: {0}")]
    Build(String),

    /// Only raised under the `Fail` validation policy.
    #[error("validation: {0}")]
    Validation(String),

    /// Apply aborted after `applied` of `total` manifests; the inventory is
    /// left at its last known-good value.
    #[error("applied {applied}/{total} manifests: {message}")]
    Apply { applied: usize, total: usize, message: String },

    /// Non-blocking: resources were already applied when pruning failed.
    #[error("prune: {0}")]
    Prune(String),
}

impl ReconcileError {
    pub fn undefined_gate(name: &str) -> Self {
        Self::Config {
            reason: reason::UNDEFINED_GATE,
            message: format!("gate {name:?} is not declared in spec.gates"),
        }
    }

    pub fn dependency_cycle(cycle: &[String]) -> Self {
        Self::Config {
            reason: reason::DEPENDENCY_CYCLE,
            message: format!("dependency cycle: {}", cycle.join(" -> ")),
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::Config { reason: reason::ACCESS_DENIED, message: message.into() }
    }

    /// Stable reason string for status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config { reason, .. } => reason,
            Self::Fetch(_) => reason::ARTIFACT_UNAVAILABLE,
            Self::Credential(_) => reason::CREDENTIAL_UNAVAILABLE,
            Self::Build(_) => reason::BUILD_FAILED,
            Self::Validation(_) => reason::VALIDATION_FAILED,
            Self::Apply { .. } => reason::APPLY_FAILED,
            Self::Prune(_) => reason::PRUNE_FAILED,
        }
    }

    /// Fatal errors suppress automatic retries until the spec changes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Transient failures retried on a shorter backoff than the interval.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Credential(_))
    }
}
