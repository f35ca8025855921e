//! Dynamic resource manifests, independent of any concrete API type.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::inventory::ResourceRef;

/// Annotation listing the gate names a manifest requires, comma-separated.
/// Manifests without it are gated by every gate declared for the build pass.
pub const GATES_ANNOTATION: &str = "cueflow.dev/gates";

/// A fully-keyed manifest document: group/version/kind plus metadata,
/// carrying the raw body for server-side apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub raw: Json,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest missing {0}")]
    MissingField(&'static str),
    #[error("manifest field {0} is not a string")]
    NotAString(&'static str),
}

impl Resource {
    /// Parse a manifest document. `apiVersion`, `kind` and `metadata.name`
    /// are required; namespace is optional (cluster-scoped objects omit it).
    pub fn from_manifest(raw: Json) -> Result<Self, ManifestError> {
        let api_version = str_field(&raw, "apiVersion")?;
        let kind = str_field(&raw, "kind")?;
        let meta = raw
            .get("metadata")
            .ok_or(ManifestError::MissingField("metadata"))?;
        let name = meta
            .get("name")
            .ok_or(ManifestError::MissingField("metadata.name"))?
            .as_str()
            .ok_or(ManifestError::NotAString("metadata.name"))?
            .to_string();
        let namespace = meta
            .get("namespace")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version),
        };
        Ok(Self { group, version, kind, namespace, name, raw })
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Core-group Namespace objects apply before everything else.
    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.kind == "Namespace"
    }

    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef {
            id: format!(
                "{}_{}_{}_{}",
                self.namespace.as_deref().unwrap_or(""),
                self.name,
                self.group,
                self.kind
            ),
            version: self.api_version(),
        }
    }

    /// Gate names this manifest requires, if pinned via annotation.
    pub fn gate_names(&self) -> Option<Vec<String>> {
        let v = self
            .raw
            .get("metadata")?
            .get("annotations")?
            .get(GATES_ANNOTATION)?
            .as_str()?;
        Some(
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}

fn str_field(v: &Json, key: &'static str) -> Result<String, ManifestError> {
    v.get(key)
        .ok_or(ManifestError::MissingField(key))?
        .as_str()
        .ok_or(ManifestError::NotAString(key))
        .map(|s| s.to_string())
}
