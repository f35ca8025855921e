//! Scripted evaluator: a deterministic, in-memory module oracle for tests
//! and offline planning. The script maps evaluation inputs to a fixed set of
//! expression values, gate verdicts, and schema predicates.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use cueflow_core::instance::ValidationEncoding;
use cueflow_core::ReconcileError;

use crate::{Evaluator, ModuleContext, ModuleInput};

type SchemaFn = Arc<dyn Fn(&Json) -> Option<String> + Send + Sync>;

/// One scripted module snapshot.
#[derive(Default, Clone)]
pub struct ScriptedModule {
    exprs: BTreeMap<String, Json>,
    gates: BTreeMap<String, bool>,
    schemas: BTreeMap<String, SchemaFn>,
}

impl ScriptedModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expr(mut self, name: impl Into<String>, value: Json) -> Self {
        self.exprs.insert(name.into(), value);
        self
    }

    pub fn gate(mut self, expr: impl Into<String>, verdict: bool) -> Self {
        self.gates.insert(expr.into(), verdict);
        self
    }

    pub fn schema(
        mut self,
        name: impl Into<String>,
        check: impl Fn(&Json) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.schemas.insert(name.into(), Arc::new(check));
        self
    }
}

impl ModuleContext for ScriptedModule {
    fn expr(&self, name: &str) -> Result<Json, String> {
        self.exprs
            .get(name)
            .cloned()
            .ok_or_else(|| format!("field {name:?} not found in module"))
    }

    fn gate(&self, expr: &str) -> Result<bool, String> {
        self.gates
            .get(expr)
            .copied()
            .ok_or_else(|| format!("expression {expr:?} not found in module"))
    }

    fn conforms(
        &self,
        schema: &str,
        _encoding: ValidationEncoding,
        manifest: &Json,
    ) -> Result<Option<String>, String> {
        let check = self
            .schemas
            .get(schema)
            .ok_or_else(|| format!("definition {schema:?} not found in module"))?;
        Ok(check(manifest))
    }
}

type ScriptFn = dyn Fn(&ModuleInput) -> Result<ScriptedModule, String> + Send + Sync;

/// Evaluator driven by a script closure; returning `Err` models a failed
/// CUE build.
pub struct ScriptedEvaluator {
    script: Box<ScriptFn>,
}

impl ScriptedEvaluator {
    pub fn new(
        script: impl Fn(&ModuleInput) -> Result<ScriptedModule, String> + Send + Sync + 'static,
    ) -> Self {
        Self { script: Box::new(script) }
    }

    /// Evaluator that always yields the same module, regardless of inputs.
    pub fn fixed(module: ScriptedModule) -> Self {
        Self::new(move |_| Ok(module.clone()))
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, input: &ModuleInput) -> Result<Box<dyn ModuleContext>, ReconcileError> {
        match (self.script)(input) {
            Ok(m) => Ok(Box::new(m)),
            Err(e) => Err(ReconcileError::Build(e)),
        }
    }
}
