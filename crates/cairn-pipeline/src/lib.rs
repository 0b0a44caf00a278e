//! Stage graph construction, change detection, lock state, and the
//! reproduction scheduler.
//!
//! The flow of one reproduction: [`definition`] parses the pipeline and
//! parameter documents into typed structures, [`graph`] builds and validates
//! the stage DAG, [`detect`] classifies every stage as fresh, stale, or
//! blocked against the [`lock`] state, and [`execute`] runs the stale
//! subgraph in dependency order, committing a new lock entry per completed
//! stage.

pub mod definition;
pub mod detect;
pub mod execute;
pub mod fingerprint;
pub mod graph;
pub mod lock;
pub mod render;

pub use definition::{Params, PipelineDef, StageDef};
pub use detect::{ChangeDetector, Plan, PlanRow, StageState, StaleReason};
pub use execute::{CancelHandle, ExecOptions, Executor, RunSummary};
pub use graph::StageGraph;
pub use lock::{LockEntry, LockFile, RunLock};
