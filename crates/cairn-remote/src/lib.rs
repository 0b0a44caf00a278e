//! Remote synchronization: push/pull cache objects to an object store by hash.
//!
//! The remote is a collaborator behind the [`ObjectStore`] trait
//! (`exists`/`put`/`get`, all idempotent). The [`Synchronizer`] transfers only
//! the objects the other side lacks, retries transient failures per object
//! with bounded exponential backoff, and reports per-object failures without
//! aborting unrelated transfers.

mod store;
mod sync;

pub use store::{HttpObjectStore, LocalObjectStore, ObjectStore};
pub use sync::{BackoffPolicy, Synchronizer, TransferReport};
