//! Instance spec (user-supplied, read-only here) and status (owned by the
//! reconciler, written only at well-defined checkpoints).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::condition::Condition;
use crate::inventory::ResourceInventory;

/// `namespace/name` key for instances and sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to the artifact-producing source object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
    /// Defaults to the instance's own namespace when empty.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl SourceRef {
    /// Resolve the source key, defaulting to the instance namespace.
    pub fn key_in(&self, instance_ns: &str) -> ObjectKey {
        ObjectKey::new(
            self.namespace.clone().unwrap_or_else(|| instance_ns.to_string()),
            self.name.clone(),
        )
    }
}

/// Remote-cluster credential reference; absent means the local cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterRef {
    pub secret_name: String,
}

/// Build-time variable injected into the module; later entries with the same
/// name override earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagVar {
    pub name: String,
    pub value: String,
}

/// Named boolean expression evaluated in module context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateExpr {
    pub name: String,
    pub expr: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationMode {
    Fail,
    Warn,
    Drop,
}

/// Encoding the manifest is presented in for the schema check; does not
/// change pass/fail logic.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationEncoding {
    #[default]
    Structured,
    Yaml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validation {
    pub mode: ValidationMode,
    pub schema: String,
    #[serde(rename = "type", default)]
    pub encoding: ValidationEncoding,
}

fn default_true() -> bool {
    true
}

/// Desired state of one instance, immutable per reconcile cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpec {
    pub source_ref: SourceRef,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub package: String,
    pub exprs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<TagVar>,
    #[serde(default)]
    pub gates: Vec<GateExpr>,
    #[serde(default)]
    pub validate: Option<Validation>,
    #[serde(with = "secs")]
    pub interval: Duration,
    #[serde(with = "secs", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default = "default_true")]
    pub prune: bool,
    #[serde(default)]
    pub depends_on: Vec<ObjectKey>,
    #[serde(default)]
    pub cluster_ref: Option<ClusterRef>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Observed state, created empty on first reconcile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceStatus {
    #[serde(default)]
    pub last_attempted_revision: Option<String>,
    #[serde(default)]
    pub last_applied_revision: Option<String>,
    #[serde(default)]
    pub inventory: Option<ResourceInventory>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl InstanceStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_ready(&self) -> bool {
        self.condition(crate::condition::READY)
            .map(|c| c.status == crate::condition::ConditionStatus::True)
            .unwrap_or(false)
    }
}

/// Duration <-> integer seconds for spec round-trips.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
