//! Experiment overlay: snapshots of lock state plus parameters that can be
//! reproduced against, compared, applied over the primary state, or
//! discarded.
//!
//! An experiment never touches the primary lock document until `apply`.
//! Removing an experiment makes any cache object referenced only by it
//! eligible for garbage collection.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_pipeline::{LockFile, StageGraph};
use cairn_types::{atomic_write, CairnError, Repo, Result};

/// One experiment snapshot, persisted as a single JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    /// The experiment this one was branched from, if any.
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Lock state as of the branch point, later overwritten by a scoped
    /// reproduction.
    pub lock: LockFile,
    /// Raw parameter document text, applied verbatim on `apply`.
    pub params: String,
    /// Metric file path -> parsed value (`null` when absent or unparseable).
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl Experiment {
    /// Every cache object hash this experiment's lock state references.
    pub fn referenced_hashes(&self) -> Vec<String> {
        self.lock.all_output_hashes()
    }
}

// ---------------------------------------------------------------------------
// Metric collection
// ---------------------------------------------------------------------------

/// Read every declared metric file and parse it, JSON first and YAML as the
/// fallback. A missing or unparseable file records `null` rather than
/// failing, so listing experiments never breaks on a bad metric.
pub fn collect_metrics(repo: &Repo, graph: &StageGraph) -> BTreeMap<String, serde_json::Value> {
    let mut metrics = BTreeMap::new();
    for (_, stage) in graph.stages() {
        for path in &stage.metrics {
            let value = read_metric(&repo.workspace_path(path));
            metrics.insert(path.clone(), value);
        }
    }
    metrics
}

fn read_metric(path: &std::path::Path) -> serde_json::Value {
    let Ok(text) = std::fs::read_to_string(path) else {
        return serde_json::Value::Null;
    };
    if let Ok(value) = serde_json::from_str(&text) {
        return value;
    }
    match serde_yaml::from_str::<serde_json::Value>(&text) {
        Ok(value) => value,
        Err(_) => serde_json::Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Filesystem-backed experiment store under the repository control
/// directory, one JSON document per experiment.
pub struct ExperimentStore {
    repo: Repo,
}

impl ExperimentStore {
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.repo.experiments_dir().join(format!("{id}.json"))
    }

    /// Capture the current lock state, parameter document, and metric values
    /// as a new experiment. The primary state is not modified.
    pub fn branch(&self, lock: &LockFile, graph: &StageGraph, parent: Option<String>) -> Result<Experiment> {
        let params = match std::fs::read_to_string(self.repo.params_path()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let experiment = Experiment {
            id: uuid::Uuid::new_v4().to_string(),
            parent,
            created_at: Utc::now(),
            lock: lock.clone(),
            params,
            metrics: collect_metrics(&self.repo, graph),
        };
        self.save(&experiment)?;
        tracing::info!(id = %experiment.id, "branched experiment");
        Ok(experiment)
    }

    /// Persist an experiment document atomically.
    pub fn save(&self, experiment: &Experiment) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(experiment)?;
        bytes.push(b'\n');
        atomic_write(&self.path_for(&experiment.id), &bytes)
    }

    /// Load one experiment. `id` may be a unique prefix of the full id.
    pub fn get(&self, id: &str) -> Result<Experiment> {
        let path = self.path_for(id);
        if path.is_file() {
            let bytes = std::fs::read(path)?;
            return Ok(serde_json::from_slice(&bytes)?);
        }
        // Unique-prefix lookup.
        let matches: Vec<Experiment> = self
            .list()?
            .into_iter()
            .filter(|e| e.id.starts_with(id))
            .collect();
        match matches.len() {
            1 => Ok(matches.into_iter().next().ok_or_else(|| {
                CairnError::ExperimentNotFound { id: id.to_string() }
            })?),
            _ => Err(CairnError::ExperimentNotFound { id: id.to_string() }),
        }
    }

    /// All experiments, oldest first.
    pub fn list(&self) -> Result<Vec<Experiment>> {
        let dir = self.repo.experiments_dir();
        let mut experiments = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(experiments),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Skip in-progress temp files and anything unreadable as an
            // experiment document.
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(experiment) = serde_json::from_slice::<Experiment>(&bytes) {
                    experiments.push(experiment);
                }
            }
        }
        experiments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(experiments)
    }

    /// Copy an experiment's lock state and parameter document over the
    /// primary state. The primary becomes exactly that experiment's result.
    pub fn apply(&self, id: &str) -> Result<Experiment> {
        let experiment = self.get(id)?;
        experiment.lock.save(&self.repo.lock_path())?;
        atomic_write(&self.repo.params_path(), experiment.params.as_bytes())?;
        tracing::info!(id = %experiment.id, "applied experiment to primary state");
        Ok(experiment)
    }

    /// Discard an experiment. Objects referenced only by it become eligible
    /// for garbage collection on the next sweep.
    pub fn remove(&self, id: &str) -> Result<()> {
        let experiment = self.get(id)?;
        std::fs::remove_file(self.path_for(&experiment.id))?;
        tracing::info!(id = %experiment.id, "removed experiment");
        Ok(())
    }

    /// Hashes referenced by any retained experiment, for the GC live set.
    pub fn referenced_hashes(&self) -> Result<Vec<String>> {
        let mut hashes: Vec<String> = self
            .list()?
            .iter()
            .flat_map(|e| e.referenced_hashes())
            .collect();
        hashes.sort();
        hashes.dedup();
        Ok(hashes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
