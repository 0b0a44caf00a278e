//! Typed parsing of the pipeline definition and parameter documents.
//!
//! The pipeline document is parsed into an explicit schema — unknown fields
//! and missing required fields are rejected with a named error before any
//! hashing begins. Stage declaration order is preserved; it is the
//! topological tie-breaker later.

use std::path::Path;

use serde::{Deserialize, Serialize};

use cairn_types::{CairnError, Result};

/// One declared stage: an opaque command plus its declared inputs, outputs,
/// parameter references, and metric files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    /// Shell command executed with the working tree as cwd.
    pub cmd: String,
    /// Dependency paths (files or directories), repo-relative.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Output paths this stage produces.
    #[serde(default)]
    pub outs: Vec<String>,
    /// Dotted keys into the parameter document.
    #[serde(default)]
    pub params: Vec<String>,
    /// Machine-readable metric files this stage writes.
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// The whole pipeline definition, stages in declaration order.
#[derive(Debug, Clone, Default)]
pub struct PipelineDef {
    pub stages: Vec<(String, StageDef)>,
}

impl PipelineDef {
    /// Parse a YAML pipeline document.
    ///
    /// Goes through `serde_yaml::Value` first so mapping order (= declaration
    /// order) survives, then deserializes each stage through the typed
    /// schema so unknown fields are rejected with the offending stage named.
    pub fn parse(source: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(source)?;
        let mapping = doc
            .as_mapping()
            .ok_or_else(|| CairnError::Definition("document is not a mapping".into()))?;
        let stages_value = mapping
            .get("stages")
            .ok_or_else(|| CairnError::Definition("missing required 'stages' key".into()))?;
        let stages_map = stages_value
            .as_mapping()
            .ok_or_else(|| CairnError::Definition("'stages' is not a mapping".into()))?;

        let mut stages = Vec::with_capacity(stages_map.len());
        for (name, body) in stages_map {
            let name = name
                .as_str()
                .ok_or_else(|| CairnError::Definition("stage name is not a string".into()))?
                .to_string();
            let def: StageDef = serde_yaml::from_value(body.clone()).map_err(|e| {
                CairnError::Definition(format!("stage '{name}': {e}"))
            })?;
            if def.cmd.trim().is_empty() {
                return Err(CairnError::EmptyCommand { stage: name });
            }
            stages.push((name, def));
        }
        Ok(Self { stages })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.stages
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, def)| def)
    }
}

// ---------------------------------------------------------------------------
// Parameter document
// ---------------------------------------------------------------------------

/// The nested parameter document. Only keys referenced by at least one stage
/// affect any fingerprint; unreferenced keys are inert by design.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    doc: serde_yaml::Value,
}

impl Params {
    /// An empty document; every lookup misses.
    pub fn empty() -> Self {
        Self {
            doc: serde_yaml::Value::Null,
        }
    }

    pub fn parse(source: &str) -> Result<Self> {
        Ok(Self {
            doc: serde_yaml::from_str(source)?,
        })
    }

    /// Load the parameter document; a missing file is an empty document so
    /// pipelines without parameters need no params.yaml.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn raw(&self) -> &serde_yaml::Value {
        &self.doc
    }

    /// Look up a dotted key ("train.n_estimators"), returning its value in
    /// canonical JSON form. Comparison by value means reformatting the YAML
    /// never dirties a stage.
    pub fn lookup(&self, dotted: &str) -> Option<serde_json::Value> {
        let mut current = &self.doc;
        for part in dotted.split('.') {
            current = current.as_mapping()?.get(part)?;
        }
        Some(yaml_to_json(current))
    }
}

/// Convert a YAML value to canonical JSON: map keys stringified, everything
/// else mapped structurally. Non-string mapping keys are rendered with
/// `to_string`-style formatting, which is stable for the scalar keys YAML
/// params realistically use.
pub fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                serde_json::Number::from_f64(n.as_f64().unwrap_or(f64::NAN))
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => {
            serde_json::Value::Array(seq.iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                };
                out.insert(key, yaml_to_json(v));
            }
            serde_json::Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
