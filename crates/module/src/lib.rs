//! Module boundary: the CUE evaluator is an external oracle behind a trait,
//! so the control flow stays testable with scripted manifest sets.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

use cueflow_core::instance::{GateExpr, TagVar, Validation, ValidationEncoding, ValidationMode};
use cueflow_core::{ReconcileError, Resource};

pub mod script;

/// Inputs for one module evaluation: the extracted artifact directory plus
/// the spec's location selectors and tag variables.
#[derive(Debug, Clone)]
pub struct ModuleInput {
    pub dir: PathBuf,
    pub root: String,
    pub path: String,
    pub package: String,
    pub tags: Vec<TagVar>,
}

impl ModuleInput {
    /// Tag lookup with last-write-wins override precedence.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.iter().rev().find(|t| t.name == name).map(|t| t.value.as_str())
    }

    /// Tags deduplicated by name, later entries winning, original order of
    /// first appearance preserved. This is what gets bound into the module.
    pub fn resolved_tags(&self) -> Vec<TagVar> {
        let mut out: Vec<TagVar> = Vec::new();
        for t in &self.tags {
            match out.iter_mut().find(|o| o.name == t.name) {
                Some(o) => o.value = t.value.clone(),
                None => out.push(t.clone()),
            }
        }
        out
    }
}

/// An evaluated module snapshot. All methods are pure given the same
/// snapshot; errors are plain strings aggregated by the caller.
pub trait ModuleContext: Send + Sync {
    /// Evaluate a named field to a value.
    fn expr(&self, name: &str) -> Result<Json, String>;

    /// Evaluate a boolean gate expression.
    fn gate(&self, expr: &str) -> Result<bool, String>;

    /// Check a manifest against a named schema definition. `Ok(None)` means
    /// conforming; `Ok(Some(msg))` carries the violation.
    fn conforms(
        &self,
        schema: &str,
        encoding: ValidationEncoding,
        manifest: &Json,
    ) -> Result<Option<String>, String>;
}

/// The external CUE oracle: directory + inputs in, module snapshot out.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, input: &ModuleInput) -> Result<Box<dyn ModuleContext>, ReconcileError>;
}

/// Extract `exprs` from the module and flatten each into manifest documents:
/// a list yields one document per element, a struct yields one document,
/// anything else is a build error. Evaluation failures aggregate into a
/// single build error; a failed build yields no partial manifest set.
pub fn build_manifests(
    ctx: &dyn ModuleContext,
    exprs: &[String],
) -> Result<Vec<Resource>, ReconcileError> {
    let mut out = Vec::new();
    let mut errors = Vec::new();
    for name in exprs {
        let value = match ctx.expr(name) {
            Ok(v) => v,
            Err(e) => {
                errors.push(format!("{name}: {e}"));
                continue;
            }
        };
        let docs: Vec<Json> = match value {
            Json::Array(items) => items,
            v @ Json::Object(_) => vec![v],
            _ => {
                errors.push(format!("{name}: expression does not yield renderable output"));
                continue;
            }
        };
        for doc in docs {
            match Resource::from_manifest(doc) {
                Ok(r) => out.push(r),
                Err(e) => errors.push(format!("{name}: {e}")),
            }
        }
    }
    if !errors.is_empty() {
        return Err(ReconcileError::Build(errors.join("; ")));
    }
    debug!(manifests = out.len(), "module build complete");
    Ok(out)
}

/// Retain each manifest iff every gate it references evaluates true.
///
/// A manifest may pin its gate set with the `cueflow.dev/gates` annotation;
/// without it, every gate declared for the pass applies. Referencing an
/// undeclared gate name is a config error.
pub fn filter_gated(
    ctx: &dyn ModuleContext,
    gates: &[GateExpr],
    manifests: Vec<Resource>,
) -> Result<Vec<Resource>, ReconcileError> {
    if gates.is_empty() && manifests.iter().all(|m| m.gate_names().is_none()) {
        return Ok(manifests);
    }
    let exprs: FxHashMap<&str, &str> =
        gates.iter().map(|g| (g.name.as_str(), g.expr.as_str())).collect();
    let all_names: Vec<String> = gates.iter().map(|g| g.name.clone()).collect();
    let mut verdicts: FxHashMap<String, bool> = FxHashMap::default();

    let mut kept = Vec::new();
    for m in manifests {
        let required = m.gate_names().unwrap_or_else(|| all_names.clone());
        let mut open = true;
        for name in &required {
            let expr = *exprs
                .get(name.as_str())
                .ok_or_else(|| ReconcileError::undefined_gate(name))?;
            let verdict = match verdicts.get(name) {
                Some(v) => *v,
                None => {
                    let v = ctx
                        .gate(expr)
                        .map_err(|e| ReconcileError::Build(format!("gate {name}: {e}")))?;
                    verdicts.insert(name.clone(), v);
                    v
                }
            };
            if !verdict {
                open = false;
            }
        }
        if open {
            kept.push(m);
        } else {
            debug!(resource = %m.to_ref().id, "manifest held back by gate");
        }
    }
    Ok(kept)
}

/// Outcome of the validation pass: the surviving manifests plus warning
/// messages for non-conforming ones kept or dropped.
#[derive(Debug, Default)]
pub struct Validated {
    pub manifests: Vec<Resource>,
    pub warnings: Vec<String>,
}

/// Check manifests against the named schema under the configured policy.
pub fn validate(
    ctx: &dyn ModuleContext,
    policy: Option<&Validation>,
    manifests: Vec<Resource>,
) -> Result<Validated, ReconcileError> {
    let Some(policy) = policy else {
        return Ok(Validated { manifests, warnings: Vec::new() });
    };
    let mut out = Validated::default();
    for m in manifests {
        let verdict = ctx
            .conforms(&policy.schema, policy.encoding, &m.raw)
            .map_err(|e| ReconcileError::Build(format!("schema {}: {e}", policy.schema)))?;
        match verdict {
            None => out.manifests.push(m),
            Some(violation) => {
                let msg = format!("{}: {}", m.to_ref().id, violation);
                match policy.mode {
                    ValidationMode::Fail => return Err(ReconcileError::Validation(msg)),
                    ValidationMode::Warn => {
                        out.warnings.push(msg);
                        out.manifests.push(m);
                    }
                    ValidationMode::Drop => out.warnings.push(msg),
                }
            }
        }
    }
    Ok(out)
}
