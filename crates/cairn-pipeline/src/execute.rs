//! Stage execution: a control loop orchestrating a bounded worker pool.
//!
//! Stale stages run strictly in dependency order: a stage starts only after
//! every stale producer of its dependencies has committed a new lock entry.
//! Independent stale stages run concurrently up to the worker bound. On the
//! first failure no further stage starts; stages already in flight finish
//! and commit, so a partially successful reproduction is a valid persisted
//! state rather than something to roll back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};

use cairn_cache::CacheStore;
use cairn_hash::ContentHasher;
use cairn_types::{CairnError, Repo, Result};

use crate::definition::Params;
use crate::detect::{Plan, StageState};
use crate::fingerprint::stage_fingerprint;
use crate::graph::StageGraph;
use crate::lock::{LockEntry, LockFile};

/// Tuning knobs for one reproduction.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Upper bound on concurrently running stage processes.
    pub max_workers: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// What one reproduction did.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Stages that executed and committed, in completion order.
    pub executed: Vec<String>,
    /// Stages already up to date.
    pub fresh: Vec<String>,
    /// Stages blocked by dependency errors, with the reason.
    pub blocked: Vec<(String, String)>,
    /// Stale stages never started because an earlier stage failed.
    pub skipped: Vec<String>,
    /// The first failure, if any. Completed stages keep their lock entries.
    pub failure: Option<CairnError>,
}

impl RunSummary {
    /// Full success: every stale stage executed and committed, nothing
    /// blocked or failed.
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.blocked.is_empty()
    }
}

/// Requests in-flight stage processes be terminated and no new ones started.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Worker messages
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Outcome {
    /// Process exited; status code and combined captured output.
    Finished { exit_code: i32, output: String },
    /// The command could not be spawned or waited on.
    Launch(String),
    /// Terminated because the run was cancelled.
    Cancelled,
}

#[derive(Debug)]
struct Completion {
    stage: String,
    outcome: Outcome,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs the stale subgraph of one plan against the working tree.
pub struct Executor {
    repo: Repo,
    options: ExecOptions,
    lock_path: std::path::PathBuf,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl Executor {
    pub fn new(repo: Repo, options: ExecOptions) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let lock_path = repo.lock_path();
        Self {
            repo,
            options,
            lock_path,
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    /// Commit lock entries somewhere other than the primary document, for
    /// reproductions scoped to an experiment.
    pub fn with_lock_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    /// A handle that aborts the run from another task (e.g. on ctrl-c).
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Execute every stale stage of `plan`, committing each stage's lock
    /// entry (and persisting the whole document) as it completes.
    pub async fn run(
        &self,
        graph: &StageGraph,
        params: &Params,
        plan: &Plan,
        lock: &mut LockFile,
        hasher: &mut ContentHasher,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for row in &plan.rows {
            match &row.state {
                StageState::Fresh => summary.fresh.push(row.name.clone()),
                StageState::Blocked(msg) => {
                    summary.blocked.push((row.name.clone(), msg.clone()))
                }
                StageState::Stale(_) => {}
            }
        }

        let stale: Vec<String> = plan.stale().iter().map(|s| s.to_string()).collect();
        if stale.is_empty() {
            tracing::info!("nothing to reproduce, all stages fresh");
            return Ok(summary);
        }
        let stale_set: HashSet<&str> = stale.iter().map(|s| s.as_str()).collect();

        // Gate each stale stage on its stale direct predecessors only; fresh
        // predecessors already have committed entries.
        let mut remaining: HashMap<String, usize> = HashMap::new();
        for name in &stale {
            let count = graph
                .predecessors(name)
                .iter()
                .filter(|p| stale_set.contains(*p))
                .count();
            remaining.insert(name.clone(), count);
        }

        let mut ready: VecDeque<String> = stale
            .iter()
            .filter(|n| remaining[n.as_str()] == 0)
            .cloned()
            .collect();

        let cache = CacheStore::new(self.repo.cache_dir());
        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight = 0usize;
        let mut started: HashSet<String> = HashSet::new();

        loop {
            // Launch everything ready, unless a failure or cancellation has
            // stopped the schedule.
            while summary.failure.is_none() && !*self.cancel_tx.borrow() {
                let Some(name) = ready.pop_front() else { break };
                let stage = graph
                    .stage(&name)
                    .ok_or_else(|| CairnError::Definition(format!("unknown stage '{name}'")))?;
                tracing::info!(stage = %name, cmd = %stage.cmd, "starting stage");
                started.insert(name.clone());
                in_flight += 1;
                tokio::spawn(run_stage(
                    name,
                    stage.cmd.clone(),
                    self.repo.root().to_path_buf(),
                    Arc::clone(&semaphore),
                    self.cancel_tx.subscribe(),
                    tx.clone(),
                ));
            }

            if in_flight == 0 {
                break;
            }

            let Some(completion) = rx.recv().await else { break };
            in_flight -= 1;

            match completion.outcome {
                Outcome::Finished { exit_code: 0, .. } => {
                    match self.commit(graph, params, &cache, hasher, lock, &completion.stage) {
                        Ok(()) => {
                            tracing::info!(stage = %completion.stage, "stage committed");
                            summary.executed.push(completion.stage.clone());
                            // Unblock dependents.
                            for succ in graph.successors(&completion.stage) {
                                if let Some(count) = remaining.get_mut(succ) {
                                    *count -= 1;
                                    if *count == 0 {
                                        ready.push_back(succ.to_string());
                                    }
                                }
                            }
                        }
                        Err(e) if summary.failure.is_none() => {
                            tracing::error!(stage = %completion.stage, error = %e, "commit failed");
                            summary.failure = Some(e);
                        }
                        Err(e) => {
                            tracing::error!(stage = %completion.stage, error = %e, "commit failed");
                        }
                    }
                }
                Outcome::Finished { exit_code, output } => {
                    tracing::error!(stage = %completion.stage, exit_code, "stage failed");
                    let err = CairnError::StageFailed {
                        stage: completion.stage.clone(),
                        exit_code,
                        output,
                    };
                    if summary.failure.is_none() {
                        summary.failure = Some(err);
                    }
                }
                Outcome::Launch(message) => {
                    let err = CairnError::LaunchFailed {
                        stage: completion.stage.clone(),
                        message,
                    };
                    if summary.failure.is_none() {
                        summary.failure = Some(err);
                    }
                }
                Outcome::Cancelled => {
                    tracing::warn!(stage = %completion.stage, "stage terminated by cancellation");
                    if summary.failure.is_none() {
                        summary.failure = Some(CairnError::LaunchFailed {
                            stage: completion.stage.clone(),
                            message: "terminated: run cancelled".into(),
                        });
                    }
                }
            }
        }

        // Stale stages that never started.
        summary.skipped = stale
            .iter()
            .filter(|n| !started.contains(n.as_str()))
            .cloned()
            .collect();

        hasher.persist()?;
        Ok(summary)
    }

    /// Record a completed stage: hash its live inputs and outputs, store the
    /// outputs in the cache, and persist the updated lock document.
    ///
    /// The fingerprint is computed now, after every producer has run, so it
    /// reflects the dependency bytes this stage actually consumed.
    fn commit(
        &self,
        graph: &StageGraph,
        params: &Params,
        cache: &CacheStore,
        hasher: &mut ContentHasher,
        lock: &mut LockFile,
        name: &str,
    ) -> Result<()> {
        let stage = graph
            .stage(name)
            .ok_or_else(|| CairnError::Definition(format!("unknown stage '{name}'")))?;

        let mut dep_hashes = Vec::with_capacity(stage.deps.len());
        for dep in &stage.deps {
            let hash = hasher.hash_path(&self.repo.workspace_path(dep))?;
            dep_hashes.push((dep.clone(), hash));
        }
        let mut param_values = Vec::with_capacity(stage.params.len());
        for key in &stage.params {
            let value = params.lookup(key).ok_or_else(|| CairnError::ParamNotFound {
                stage: name.to_string(),
                key: key.clone(),
            })?;
            param_values.push((key.clone(), value));
        }
        let fingerprint = stage_fingerprint(stage, &dep_hashes, &param_values)?;

        let mut outs = std::collections::BTreeMap::new();
        for out in &stage.outs {
            let path = self.repo.workspace_path(out);
            if !path.exists() {
                return Err(CairnError::StageFailed {
                    stage: name.to_string(),
                    exit_code: 0,
                    output: format!("declared output '{out}' was not produced"),
                });
            }
            let hash = cache.put_path(&path, hasher)?;
            outs.insert(out.clone(), hash);
        }

        lock.stages
            .insert(name.to_string(), LockEntry { fingerprint, outs });
        lock.save(&self.lock_path)
    }
}

/// One worker: wait for a pool slot, run the command, report the outcome.
///
/// The command runs through `bash -c` in its own process group so
/// cancellation can signal the whole group, with the working tree root as
/// cwd. Stdout and stderr are captured and combined for diagnostics.
async fn run_stage(
    name: String,
    cmd: String,
    root: std::path::PathBuf,
    semaphore: Arc<Semaphore>,
    mut cancel_rx: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<Completion>,
) {
    let outcome = async {
        let _permit = match semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return Outcome::Launch("worker pool closed".into()),
        };

        let mut command = tokio::process::Command::new("bash");
        command
            .arg("-c")
            .arg(&cmd)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Outcome::Launch(e.to_string()),
        };
        let pid = child.id();

        let wait = child.wait_with_output();
        tokio::pin!(wait);
        let mut cancelled = false;
        loop {
            tokio::select! {
                result = &mut wait => {
                    return match result {
                        Ok(_) if cancelled => Outcome::Cancelled,
                        Ok(output) => {
                            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                            if !output.stderr.is_empty() {
                                if !text.is_empty() {
                                    text.push('\n');
                                }
                                text.push_str(&String::from_utf8_lossy(&output.stderr));
                            }
                            Outcome::Finished {
                                exit_code: output.status.code().unwrap_or(-1),
                                output: text,
                            }
                        }
                        Err(e) => Outcome::Launch(e.to_string()),
                    };
                }
                changed = cancel_rx.changed(), if !cancelled => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        cancelled = true;
                        #[cfg(unix)]
                        if let Some(pid) = pid {
                            // Signal the whole process group.
                            unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
                        }
                        #[cfg(not(unix))]
                        let _ = pid;
                    }
                }
            }
        }
    }
    .await;

    let _ = tx.send(Completion {
        stage: name,
        outcome,
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PipelineDef;
    use crate::detect::ChangeDetector;
    use std::path::Path;

    const CHAIN: &str = r#"
stages:
  ingest:
    cmd: cp source.csv raw.csv
    deps: [source.csv]
    outs: [raw.csv]
  preprocess:
    cmd: "tr 'a-z' 'A-Z' < raw.csv > features.csv"
    deps: [raw.csv]
    outs: [features.csv]
  train:
    cmd: "cat features.csv > model.txt && echo trained >> model.txt"
    deps: [features.csv]
    outs: [model.txt]
    params: [train.n]
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: Repo,
        graph: StageGraph,
        params: Params,
    }

    fn fixture(pipeline: &str, params_yaml: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::new(dir.path());
        repo.ensure_layout().unwrap();
        std::fs::write(dir.path().join("source.csv"), "alpha\nbeta\n").unwrap();

        let def = PipelineDef::parse(pipeline).unwrap();
        let graph = StageGraph::build(&def).unwrap();
        let params = Params::parse(params_yaml).unwrap();
        Fixture {
            _dir: dir,
            repo,
            graph,
            params,
        }
    }

    async fn reproduce(fix: &Fixture, lock: &mut LockFile) -> RunSummary {
        let mut hasher = ContentHasher::new();
        let plan = ChangeDetector::new(&fix.repo, &fix.graph, &fix.params, lock)
            .plan(&mut hasher)
            .unwrap();
        Executor::new(fix.repo.clone(), ExecOptions::default())
            .run(&fix.graph, &fix.params, &plan, lock, &mut hasher)
            .await
            .unwrap()
    }

    fn write(root: &Path, rel: &str, content: &str) {
        std::fs::write(root.join(rel), content).unwrap();
    }

    #[tokio::test]
    async fn full_chain_runs_in_dependency_order() {
        let fix = fixture(CHAIN, "train:\n  n: 100\n");
        let mut lock = LockFile::default();

        let summary = reproduce(&fix, &mut lock).await;
        assert!(summary.is_success(), "failure: {:?}", summary.failure);
        assert_eq!(summary.executed, vec!["ingest", "preprocess", "train"]);

        // Outputs exist and every stage has a lock entry with output hashes.
        assert!(fix.repo.workspace_path("model.txt").exists());
        for name in ["ingest", "preprocess", "train"] {
            let entry = lock.entry(name).unwrap();
            assert!(!entry.fingerprint.is_empty());
            assert!(!entry.outs.is_empty());
        }

        // The lock document was persisted.
        let persisted = LockFile::load(&fix.repo.lock_path()).unwrap();
        assert_eq!(persisted, lock);
    }

    #[tokio::test]
    async fn second_run_executes_nothing() {
        let fix = fixture(CHAIN, "train:\n  n: 100\n");
        let mut lock = LockFile::default();
        reproduce(&fix, &mut lock).await;

        let summary = reproduce(&fix, &mut lock).await;
        assert!(summary.executed.is_empty(), "ran: {:?}", summary.executed);
        assert_eq!(summary.fresh.len(), 3);
    }

    #[tokio::test]
    async fn parameter_change_reruns_only_the_consumer() {
        let mut fix = fixture(CHAIN, "train:\n  n: 100\n");
        let mut lock = LockFile::default();
        reproduce(&fix, &mut lock).await;

        fix.params = Params::parse("train:\n  n: 500\n").unwrap();
        let summary = reproduce(&fix, &mut lock).await;
        assert_eq!(summary.executed, vec!["train"]);
    }

    #[tokio::test]
    async fn source_change_reruns_whole_chain() {
        let fix = fixture(CHAIN, "train:\n  n: 100\n");
        let mut lock = LockFile::default();
        reproduce(&fix, &mut lock).await;

        write(fix.repo.root(), "source.csv", "alpha\nbeta\ngamma\n");
        let summary = reproduce(&fix, &mut lock).await;
        assert_eq!(summary.executed, vec!["ingest", "preprocess", "train"]);
    }

    #[tokio::test]
    async fn mid_chain_failure_preserves_completed_entries() {
        const FAILING: &str = r#"
stages:
  ingest:
    cmd: cp source.csv raw.csv
    deps: [source.csv]
    outs: [raw.csv]
  preprocess:
    cmd: "echo preprocessing went sideways >&2; exit 3"
    deps: [raw.csv]
    outs: [features.csv]
  train:
    cmd: cat features.csv > model.txt
    deps: [features.csv]
    outs: [model.txt]
"#;
        let fix = fixture(FAILING, "");
        let mut lock = LockFile::default();
        let summary = reproduce(&fix, &mut lock).await;

        assert_eq!(summary.executed, vec!["ingest"]);
        assert!(summary.skipped.contains(&"train".to_string()));
        match summary.failure {
            Some(CairnError::StageFailed {
                ref stage,
                exit_code,
                ref output,
            }) => {
                assert_eq!(stage, "preprocess");
                assert_eq!(exit_code, 3);
                assert!(output.contains("went sideways"));
            }
            ref other => panic!("expected StageFailed, got: {other:?}"),
        }

        // The persisted document reflects the partial success.
        let persisted = LockFile::load(&fix.repo.lock_path()).unwrap();
        assert!(persisted.entry("ingest").is_some());
        assert!(persisted.entry("preprocess").is_none());
        assert!(persisted.entry("train").is_none());
    }

    #[tokio::test]
    async fn independent_stages_both_execute() {
        const PARALLEL: &str = r#"
stages:
  left:
    cmd: echo L > left.out
    outs: [left.out]
  right:
    cmd: echo R > right.out
    outs: [right.out]
"#;
        let fix = fixture(PARALLEL, "");
        let mut lock = LockFile::default();
        let summary = reproduce(&fix, &mut lock).await;

        assert!(summary.is_success());
        assert_eq!(summary.executed.len(), 2);
        assert!(fix.repo.workspace_path("left.out").exists());
        assert!(fix.repo.workspace_path("right.out").exists());
    }

    #[tokio::test]
    async fn blocked_stage_is_skipped_without_failing_siblings() {
        const MIXED: &str = r#"
stages:
  broken:
    cmd: cat absent.csv > broken.out
    deps: [absent.csv]
    outs: [broken.out]
  fine:
    cmd: cp source.csv fine.out
    deps: [source.csv]
    outs: [fine.out]
"#;
        let fix = fixture(MIXED, "");
        let mut lock = LockFile::default();
        let summary = reproduce(&fix, &mut lock).await;

        assert_eq!(summary.executed, vec!["fine"]);
        assert_eq!(summary.blocked.len(), 1);
        assert_eq!(summary.blocked[0].0, "broken");
        assert!(!summary.is_success());
        assert!(lock.entry("broken").is_none());
    }

    #[tokio::test]
    async fn undeclared_output_fails_the_stage() {
        const LIAR: &str = r#"
stages:
  liar:
    cmd: "true"
    outs: [never_written.txt]
"#;
        let fix = fixture(LIAR, "");
        let mut lock = LockFile::default();
        let summary = reproduce(&fix, &mut lock).await;

        assert!(summary.executed.is_empty());
        assert!(matches!(
            summary.failure,
            Some(CairnError::StageFailed { ref stage, .. }) if stage == "liar"
        ));
    }

    #[tokio::test]
    async fn cancellation_terminates_in_flight_without_lock_entry() {
        // "slow" touches a marker the moment it starts, then sleeps far
        // longer than the test; cancelling once the marker appears must
        // SIGTERM it and leave only "quick"'s committed entry behind.
        const SLOW: &str = r#"
stages:
  quick:
    cmd: cp source.csv quick.out
    deps: [source.csv]
    outs: [quick.out]
  slow:
    cmd: "touch slow.started && sleep 600 && echo done > slow.out"
    deps: [quick.out]
    outs: [slow.out]
"#;
        let fix = fixture(SLOW, "");
        let mut lock = LockFile::default();
        let mut hasher = ContentHasher::new();
        let plan = ChangeDetector::new(&fix.repo, &fix.graph, &fix.params, &lock)
            .plan(&mut hasher)
            .unwrap();

        let executor = Executor::new(fix.repo.clone(), ExecOptions::default());
        let cancel = executor.cancel_handle();
        let marker = fix.repo.workspace_path("slow.started");
        tokio::spawn(async move {
            while !marker.exists() {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            cancel.cancel();
        });

        let summary = executor
            .run(&fix.graph, &fix.params, &plan, &mut lock, &mut hasher)
            .await
            .unwrap();

        assert_eq!(summary.executed, vec!["quick"]);
        assert!(summary.failure.is_some());
        assert!(lock.entry("quick").is_some());
        assert!(lock.entry("slow").is_none());

        // The persisted document matches: the interrupted stage left no
        // trace, the completed one kept its entry.
        let persisted = LockFile::load(&fix.repo.lock_path()).unwrap();
        assert!(persisted.entry("quick").is_some());
        assert!(persisted.entry("slow").is_none());
    }

    #[tokio::test]
    async fn outputs_land_in_the_cache() {
        let fix = fixture(CHAIN, "train:\n  n: 100\n");
        let mut lock = LockFile::default();
        reproduce(&fix, &mut lock).await;

        let cache = CacheStore::new(fix.repo.cache_dir());
        for hash in lock.all_output_hashes() {
            assert!(cache.contains(&hash), "missing object {hash}");
        }
    }
}
