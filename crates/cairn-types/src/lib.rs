//! Shared types for the Cairn reproduction engine.
//!
//! This crate provides the foundations used across all other Cairn crates:
//! - `CairnError` — unified error taxonomy
//! - `Repo` — explicit repository context owning every control path
//!
//! Every component receives a [`Repo`] rather than discovering hidden state
//! directories ambiently, and every fallible operation returns
//! [`Result`] so the CLI can map error classes to exit codes.

use std::path::{Path, PathBuf};

/// Unified error type for all Cairn subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CairnError {
    // === Definition errors (class a): detected before any execution ===
    #[error("Duplicate stage name '{stage}' in pipeline definition")]
    DuplicateStage { stage: String },

    #[error("Output '{path}' is claimed by both stage '{first}' and stage '{second}'")]
    OutputConflict {
        path: String,
        first: String,
        second: String,
    },

    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Stage '{stage}' has an empty command")]
    EmptyCommand { stage: String },

    #[error("Malformed pipeline definition: {0}")]
    Definition(String),

    #[error("Parameter key '{key}' referenced by stage '{stage}' not found in parameter document")]
    ParamNotFound { stage: String, key: String },

    // === Dependency errors (class b): scoped to the stage that needs the path ===
    #[error("Stage '{stage}' dependency unavailable: '{path}' does not exist")]
    DependencyMissing { stage: String, path: String },

    #[error("Stage '{stage}' dependency unreadable: '{path}': {message}")]
    DependencyUnreadable {
        stage: String,
        path: String,
        message: String,
    },

    // === Execution errors (class c): abort the remaining schedule ===
    #[error("Stage '{stage}' failed with exit code {exit_code}")]
    StageFailed {
        stage: String,
        exit_code: i32,
        output: String,
    },

    #[error("Stage '{stage}' could not be launched: {message}")]
    LaunchFailed { stage: String, message: String },

    // === Storage errors (class d): fatal to the run, never corrupt lock state ===
    #[error("Object {hash} missing from cache")]
    ObjectMissing { hash: String },

    #[error("Cache storage error: {0}")]
    Storage(String),

    // === Transfer errors (class e): retried per-object before surfacing ===
    #[error("Transfer of object {hash} failed after {attempts} attempts: {message}")]
    TransferFailed {
        hash: String,
        attempts: usize,
        message: String,
    },

    #[error("Remote store error: {message}")]
    Remote { message: String, retryable: bool },

    // === Concurrency ===
    #[error("Repository busy: another reproduction holds the lock")]
    RepositoryBusy,

    // === Experiments ===
    #[error("Experiment '{id}' not found")]
    ExperimentNotFound { id: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CairnError {
    /// Returns `true` if the error is transient and the operation may
    /// succeed on retry. The synchronizer's backoff policy is a pure
    /// function of this classification.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CairnError::Remote {
                retryable: true,
                ..
            }
        )
    }

    /// Returns `true` for errors that invalidate the whole invocation, as
    /// opposed to errors scoped to a single stage or object.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CairnError::DuplicateStage { .. }
                | CairnError::OutputConflict { .. }
                | CairnError::CycleDetected { .. }
                | CairnError::EmptyCommand { .. }
                | CairnError::Definition(_)
                | CairnError::RepositoryBusy
                | CairnError::Storage(_)
        )
    }

    /// Returns `true` for class (b) errors, which block only the affected
    /// stage and its descendants.
    pub fn is_dependency_error(&self) -> bool {
        matches!(
            self,
            CairnError::DependencyMissing { .. } | CairnError::DependencyUnreadable { .. }
        )
    }
}

/// A convenience alias for `Result<T, CairnError>`.
pub type Result<T> = std::result::Result<T, CairnError>;

// ---------------------------------------------------------------------------
// Repo — explicit repository context
// ---------------------------------------------------------------------------

/// Control directory name under the working-tree root.
pub const CONTROL_DIR: &str = ".cairn";

/// Repository context: the working tree root plus derived control paths.
///
/// Owns the location of the lock state, cache store, experiments directory,
/// and the advisory run lock. Passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct Repo {
    root: PathBuf,
}

impl Repo {
    /// Create a context rooted at `root`. No filesystem access occurs here;
    /// call [`ensure_layout`](Repo::ensure_layout) before writing state.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Working-tree root. All stage commands run with this as their cwd and
    /// all declared paths are relative to it.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.cairn` control directory.
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// Lock State document.
    pub fn lock_path(&self) -> PathBuf {
        self.control_dir().join("lock.json")
    }

    /// Cache store root (objects sharded by hash prefix below this).
    pub fn cache_dir(&self) -> PathBuf {
        self.control_dir().join("cache")
    }

    /// Experiment snapshot directory.
    pub fn experiments_dir(&self) -> PathBuf {
        self.control_dir().join("experiments")
    }

    /// Advisory lock sentinel guarding concurrent reproductions.
    pub fn runlock_path(&self) -> PathBuf {
        self.control_dir().join("runlock")
    }

    /// Hasher side cache ((path, size, mtime) -> hash).
    pub fn hash_cache_path(&self) -> PathBuf {
        self.control_dir().join("hashes.json")
    }

    /// Pipeline definition document.
    pub fn pipeline_path(&self) -> PathBuf {
        self.root.join("pipeline.yaml")
    }

    /// Parameter document.
    pub fn params_path(&self) -> PathBuf {
        self.root.join("params.yaml")
    }

    /// Resolve a declared (repo-relative) path against the working tree.
    pub fn workspace_path(&self, declared: &str) -> PathBuf {
        self.root.join(declared)
    }

    /// Create the control directory tree if it does not exist.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.cache_dir())?;
        std::fs::create_dir_all(self.experiments_dir())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Atomic persistence helper
// ---------------------------------------------------------------------------

/// Write `bytes` to `path` atomically: write to a sibling temp file, then
/// rename over the destination. A crash mid-write never yields a partial
/// file at `path`.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CairnError::Storage(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cairn".to_string()),
        std::process::id()
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
