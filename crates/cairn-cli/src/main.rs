//! CLI binary for the Cairn reproducible pipeline manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use cairn_cache::CacheStore;
use cairn_exp::{collect_metrics, ExperimentStore};
use cairn_hash::ContentHasher;
use cairn_pipeline::{
    render, ChangeDetector, ExecOptions, Executor, LockFile, Params, PipelineDef, RunLock,
    StageGraph,
};
use cairn_remote::{HttpObjectStore, LocalObjectStore, ObjectStore, Synchronizer, TransferReport};
use cairn_types::{CairnError, Repo};

#[derive(Parser)]
#[command(name = "cairn", version, about = "Reproducible data/model pipeline manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Repository root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-execute the stale subgraph of the pipeline
    Repro {
        /// Run scoped to an experiment instead of the primary state
        #[arg(long)]
        experiment: Option<String>,

        /// Maximum number of concurrently running stages
        #[arg(short, long, default_value = "4")]
        jobs: usize,
    },

    /// Show each stage's freshness without executing anything
    Status,

    /// Render the stage graph (read-only)
    Dag,

    /// Upload cache objects referenced by the lock state to a remote
    Push {
        /// Remote location: an http(s) URL or a filesystem path
        remote: String,
    },

    /// Download referenced cache objects from a remote and restore outputs
    Pull {
        /// Remote location: an http(s) URL or a filesystem path
        remote: String,
    },

    /// Remove cache objects not referenced by the lock state or any experiment
    Gc,

    /// Experiment operations
    Exp {
        #[command(subcommand)]
        command: ExpCommands,
    },
}

#[derive(Subcommand)]
enum ExpCommands {
    /// Snapshot the current lock state and parameters as a new experiment
    Branch {
        /// Parent experiment id, when branching from another experiment
        #[arg(long)]
        parent: Option<String>,
    },

    /// Copy an experiment's lock state and parameters over the primary state
    Apply { id: String },

    /// Discard an experiment
    Remove { id: String },

    /// List experiments with their parameter and metric snapshots
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let repo = Repo::new(&cli.repo);
    match cli.command {
        Commands::Repro { experiment, jobs } => {
            cmd_repro(&repo, experiment.as_deref(), jobs).await?;
        }
        Commands::Status => cmd_status(&repo)?,
        Commands::Dag => cmd_dag(&repo)?,
        Commands::Push { remote } => cmd_push(&repo, &remote).await?,
        Commands::Pull { remote } => cmd_pull(&repo, &remote).await?,
        Commands::Gc => cmd_gc(&repo)?,
        Commands::Exp { command } => match command {
            ExpCommands::Branch { parent } => cmd_exp_branch(&repo, parent)?,
            ExpCommands::Apply { id } => cmd_exp_apply(&repo, &id)?,
            ExpCommands::Remove { id } => cmd_exp_remove(&repo, &id)?,
            ExpCommands::List => cmd_exp_list(&repo)?,
        },
    }
    Ok(())
}

fn load_graph(repo: &Repo) -> anyhow::Result<StageGraph> {
    let def = PipelineDef::load(&repo.pipeline_path())?;
    Ok(StageGraph::build(&def)?)
}

// ---------------------------------------------------------------------------
// repro
// ---------------------------------------------------------------------------

async fn cmd_repro(repo: &Repo, experiment: Option<&str>, jobs: usize) -> anyhow::Result<()> {
    repo.ensure_layout()?;
    let _runlock = RunLock::acquire(repo)?;

    let graph = load_graph(repo)?;
    let params = Params::load(&repo.params_path())?;

    // An experiment-scoped run starts from the experiment's lock state and
    // commits back into it, leaving the primary document untouched.
    let exp_store = ExperimentStore::new(repo.clone());
    let (mut lock, lock_path, scoped) = match experiment {
        Some(id) => {
            let exp = exp_store.get(id)?;
            let scratch = repo.experiments_dir().join(format!("{}.lock.json", exp.id));
            (exp.lock.clone(), scratch, Some(exp))
        }
        None => (LockFile::load(&repo.lock_path())?, repo.lock_path(), None),
    };

    let mut hasher = ContentHasher::with_side_cache(repo.hash_cache_path());
    let plan = ChangeDetector::new(repo, &graph, &params, &lock).plan(&mut hasher)?;

    let executor =
        Executor::new(repo.clone(), ExecOptions { max_workers: jobs }).with_lock_path(&lock_path);
    let cancel = executor.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let summary = executor
        .run(&graph, &params, &plan, &mut lock, &mut hasher)
        .await?;

    if let Some(mut exp) = scoped {
        exp.lock = lock;
        exp.params = std::fs::read_to_string(repo.params_path()).unwrap_or_default();
        exp.metrics = collect_metrics(repo, &graph);
        exp_store.save(&exp)?;
        let _ = std::fs::remove_file(&lock_path);
        println!("experiment {} updated", exp.id);
    }

    for name in &summary.executed {
        println!("executed: {name}");
    }
    for name in &summary.fresh {
        println!("fresh:    {name}");
    }
    for (name, reason) in &summary.blocked {
        eprintln!("blocked:  {name} ({reason})");
    }
    for name in &summary.skipped {
        eprintln!("skipped:  {name}");
    }

    if let Some(failure) = &summary.failure {
        if let CairnError::StageFailed { stage, output, .. } = failure {
            eprintln!("stage '{stage}' failed");
            if !output.is_empty() {
                eprintln!("{output}");
            }
        }
        eprintln!("error: {failure}");
        std::process::exit(1);
    }
    if !summary.blocked.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status / dag
// ---------------------------------------------------------------------------

fn cmd_status(repo: &Repo) -> anyhow::Result<()> {
    let graph = load_graph(repo)?;
    let params = Params::load(&repo.params_path())?;
    let lock = LockFile::load(&repo.lock_path())?;
    let mut hasher = ContentHasher::with_side_cache(repo.hash_cache_path());

    let plan = ChangeDetector::new(repo, &graph, &params, &lock).plan(&mut hasher)?;
    print!("{}", render::render_status(&plan));
    hasher.persist()?;
    Ok(())
}

fn cmd_dag(repo: &Repo) -> anyhow::Result<()> {
    let graph = load_graph(repo)?;
    print!("{}", render::render_dag(&graph));
    Ok(())
}

// ---------------------------------------------------------------------------
// push / pull / gc
// ---------------------------------------------------------------------------

fn open_remote(location: &str) -> Arc<dyn ObjectStore> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Arc::new(HttpObjectStore::new(location))
    } else {
        Arc::new(LocalObjectStore::new(Path::new(location)))
    }
}

/// Root hashes referenced by the primary lock state and every experiment.
fn referenced_roots(repo: &Repo) -> anyhow::Result<Vec<String>> {
    let lock = LockFile::load(&repo.lock_path())?;
    let mut roots = lock.all_output_hashes();
    roots.extend(ExperimentStore::new(repo.clone()).referenced_hashes()?);
    roots.sort();
    roots.dedup();
    Ok(roots)
}

fn report_transfers(verb: &str, report: &TransferReport) {
    println!(
        "{verb}: {} transferred, {} already present, {} failed",
        report.transferred.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for (hash, err) in &report.failed {
        eprintln!("failed {hash}: {err}");
    }
}

async fn cmd_push(repo: &Repo, remote: &str) -> anyhow::Result<()> {
    let cache = CacheStore::new(repo.cache_dir());
    let roots = referenced_roots(repo)?;
    let mut hashes: Vec<String> = cache.closure(roots)?.into_iter().collect();
    hashes.sort();

    let sync = Synchronizer::new(cache, open_remote(remote));
    let report = sync.push(hashes).await;
    report_transfers("push", &report);
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_pull(repo: &Repo, remote: &str) -> anyhow::Result<()> {
    repo.ensure_layout()?;
    let cache = CacheStore::new(repo.cache_dir());
    let sync = Synchronizer::new(cache.clone(), open_remote(remote));

    // Tree children are only known once the tree objects are local, so pull
    // the roots first, then the remainder of the closure.
    let roots = referenced_roots(repo)?;
    let mut report = sync.pull(roots.clone()).await;
    let mut rest: Vec<String> = cache
        .closure(roots)?
        .into_iter()
        .filter(|h| !cache.contains(h))
        .collect();
    rest.sort();
    let children = sync.pull(rest).await;
    report.transferred.extend(children.transferred);
    report.skipped.extend(children.skipped);
    report.failed.extend(children.failed);

    report_transfers("pull", &report);
    if !report.is_success() {
        std::process::exit(1);
    }

    // Restore any declared output missing from the working tree.
    let lock = LockFile::load(&repo.lock_path())?;
    for entry in lock.stages.values() {
        for (path, hash) in &entry.outs {
            let dest = repo.workspace_path(path);
            if !dest.exists() && cache.contains(hash) {
                cache.materialize(hash, &dest)?;
                println!("restored: {path}");
            }
        }
    }
    Ok(())
}

fn cmd_gc(repo: &Repo) -> anyhow::Result<()> {
    let cache = CacheStore::new(repo.cache_dir());
    let live = cache.closure(referenced_roots(repo)?)?;
    let report = cache.garbage_collect(&live)?;
    println!("gc: removed {}, kept {}", report.removed, report.kept);
    Ok(())
}

// ---------------------------------------------------------------------------
// experiments
// ---------------------------------------------------------------------------

fn cmd_exp_branch(repo: &Repo, parent: Option<String>) -> anyhow::Result<()> {
    repo.ensure_layout()?;
    let graph = load_graph(repo)?;
    let lock = LockFile::load(&repo.lock_path())?;
    let exp = ExperimentStore::new(repo.clone()).branch(&lock, &graph, parent)?;
    println!("{}", exp.id);
    Ok(())
}

fn cmd_exp_apply(repo: &Repo, id: &str) -> anyhow::Result<()> {
    let exp = ExperimentStore::new(repo.clone()).apply(id)?;
    println!("applied {}", exp.id);
    Ok(())
}

fn cmd_exp_remove(repo: &Repo, id: &str) -> anyhow::Result<()> {
    ExperimentStore::new(repo.clone()).remove(id)?;
    println!("removed {id}");
    Ok(())
}

fn cmd_exp_list(repo: &Repo) -> anyhow::Result<()> {
    for exp in ExperimentStore::new(repo.clone()).list()? {
        println!(
            "{}  {}  parent: {}",
            exp.id,
            exp.created_at.format("%Y-%m-%d %H:%M:%S"),
            exp.parent.as_deref().unwrap_or("-")
        );
        let params = exp.params.trim();
        if !params.is_empty() {
            for line in params.lines() {
                println!("    param  {line}");
            }
        }
        for (path, value) in &exp.metrics {
            println!("    metric {path}: {value}");
        }
    }
    Ok(())
}
