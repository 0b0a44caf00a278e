//! Change detection: classify every stage as fresh, stale, or blocked.
//!
//! Staleness propagates forward through the DAG transitively and
//! monotonically: a stage can only become stale because of its own state or
//! an ancestor's staleness, never because of a descendant. This is the
//! central correctness property of the engine — no stage ever consumes an
//! input whose producer has unreflected changes.

use cairn_hash::ContentHasher;
use cairn_types::{CairnError, Repo, Result};

use crate::definition::Params;
use crate::fingerprint::stage_fingerprint;
use crate::graph::StageGraph;
use crate::lock::LockFile;

/// Why a stage needs re-execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// No lock entry exists (never successfully run).
    NoLockEntry,
    /// The live fingerprint differs from the recorded one.
    FingerprintChanged,
    /// A declared output is missing from the working tree.
    MissingOutput(String),
    /// A producer of one of this stage's dependencies is stale.
    UpstreamStale(String),
}

/// Classification of one stage for this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    /// Up to date; will not execute.
    Fresh,
    /// Will execute, in dependency order.
    Stale(StaleReason),
    /// A class (b) dependency error: this stage and its descendants are
    /// skipped, siblings are unaffected.
    Blocked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRow {
    pub name: String,
    pub state: StageState,
}

/// The detector's verdict for every stage, in topological order.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub rows: Vec<PlanRow>,
}

impl Plan {
    pub fn row(&self, name: &str) -> Option<&PlanRow> {
        self.rows.iter().find(|r| r.name == name)
    }

    /// Names of stages that will execute, in topological order.
    pub fn stale(&self) -> Vec<&str> {
        self.rows
            .iter()
            .filter(|r| matches!(r.state, StageState::Stale(_)))
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn blocked(&self) -> Vec<(&str, &str)> {
        self.rows
            .iter()
            .filter_map(|r| match &r.state {
                StageState::Blocked(msg) => Some((r.name.as_str(), msg.as_str())),
                _ => None,
            })
            .collect()
    }

    /// `true` when nothing is stale or blocked: reproduction is a no-op.
    pub fn is_clean(&self) -> bool {
        self.rows
            .iter()
            .all(|r| matches!(r.state, StageState::Fresh))
    }
}

/// Compares live content hashes and parameter values against the lock state.
pub struct ChangeDetector<'a> {
    repo: &'a Repo,
    graph: &'a StageGraph,
    params: &'a Params,
    lock: &'a LockFile,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(
        repo: &'a Repo,
        graph: &'a StageGraph,
        params: &'a Params,
        lock: &'a LockFile,
    ) -> Self {
        Self {
            repo,
            graph,
            params,
            lock,
        }
    }

    /// Classify every stage in topological order.
    ///
    /// Definition errors (a parameter key referenced by a stage but absent
    /// from the document) abort detection entirely; dependency errors are
    /// recorded as [`StageState::Blocked`] and scoped to the affected
    /// subtree.
    pub fn plan(&self, hasher: &mut ContentHasher) -> Result<Plan> {
        let mut plan = Plan::default();

        for name in self.graph.topo_names() {
            let state = self.classify(name, &plan, hasher)?;
            plan.rows.push(PlanRow {
                name: name.to_string(),
                state,
            });
        }
        Ok(plan)
    }

    fn classify(&self, name: &str, plan: &Plan, hasher: &mut ContentHasher) -> Result<StageState> {
        // Upstream first: staleness and blockage propagate forward. Rows for
        // all predecessors exist already because we walk in topological order.
        for pred in self.graph.predecessors(name) {
            match plan.row(pred).map(|r| &r.state) {
                Some(StageState::Stale(_)) => {
                    return Ok(StageState::Stale(StaleReason::UpstreamStale(
                        pred.to_string(),
                    )))
                }
                Some(StageState::Blocked(_)) => {
                    return Ok(StageState::Blocked(format!(
                        "upstream stage '{pred}' is blocked"
                    )))
                }
                _ => {}
            }
        }

        let stage = self
            .graph
            .stage(name)
            .ok_or_else(|| CairnError::Definition(format!("unknown stage '{name}'")))?;

        // Parameter values; a missing referenced key is a definition error.
        let mut param_values = Vec::with_capacity(stage.params.len());
        for key in &stage.params {
            let value = self.params.lookup(key).ok_or_else(|| {
                CairnError::ParamNotFound {
                    stage: name.to_string(),
                    key: key.clone(),
                }
            })?;
            param_values.push((key.clone(), value));
        }

        // Live dependency hashes; failures here block only this subtree.
        let mut dep_hashes = Vec::with_capacity(stage.deps.len());
        for dep in &stage.deps {
            let path = self.repo.workspace_path(dep);
            match hasher.hash_path(&path) {
                Ok(hash) => dep_hashes.push((dep.clone(), hash)),
                Err(CairnError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    let err = CairnError::DependencyMissing {
                        stage: name.to_string(),
                        path: dep.clone(),
                    };
                    return Ok(StageState::Blocked(err.to_string()));
                }
                Err(CairnError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    let err = CairnError::DependencyUnreadable {
                        stage: name.to_string(),
                        path: dep.clone(),
                        message: e.to_string(),
                    };
                    return Ok(StageState::Blocked(err.to_string()));
                }
                Err(other) => return Err(other),
            }
        }

        let fingerprint = stage_fingerprint(stage, &dep_hashes, &param_values)?;

        let entry = match self.lock.entry(name) {
            Some(entry) => entry,
            None => return Ok(StageState::Stale(StaleReason::NoLockEntry)),
        };
        if entry.fingerprint != fingerprint {
            return Ok(StageState::Stale(StaleReason::FingerprintChanged));
        }
        for out in &stage.outs {
            if !self.repo.workspace_path(out).exists() {
                return Ok(StageState::Stale(StaleReason::MissingOutput(out.clone())));
            }
        }
        Ok(StageState::Fresh)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
