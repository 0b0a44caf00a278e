//! Lock State: the last-known-good fingerprint and output hashes per stage.
//!
//! The lock document is the single persisted source of truth for staleness
//! decisions. Entries are written only when a stage completes successfully,
//! and the whole document is persisted atomically (temp-then-rename), so a
//! crash mid-write never yields a corrupt or partially applied entry.
//! BTreeMap ordering makes the serialized form byte-for-byte stable given
//! identical inputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cairn_types::{atomic_write, CairnError, Repo, Result};

/// One stage's record: the fingerprint it completed with and the content
/// hash of each declared output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub fingerprint: String,
    #[serde(default)]
    pub outs: BTreeMap<String, String>,
}

/// The whole lock document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    #[serde(default)]
    pub stages: BTreeMap<String, LockEntry>,
}

impl LockFile {
    /// Load the lock document; a missing file is an empty lock (first run).
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize to the stable on-disk form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Persist atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.to_bytes()?)
    }

    pub fn entry(&self, stage: &str) -> Option<&LockEntry> {
        self.stages.get(stage)
    }

    /// Every output hash recorded anywhere in the document, for computing
    /// the live set during garbage collection and for push batches.
    pub fn all_output_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .stages
            .values()
            .flat_map(|e| e.outs.values().cloned())
            .collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }
}

// ---------------------------------------------------------------------------
// Advisory run lock
// ---------------------------------------------------------------------------

/// Exclusive advisory lock held for the duration of one reproduction.
///
/// A second invocation against the same repository fails fast with
/// [`CairnError::RepositoryBusy`] instead of interleaving. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(repo: &Repo) -> Result<Self> {
        let path = repo.runlock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                    return Err(CairnError::RepositoryBusy);
                }
                return Err(err.into());
            }
        }

        tracing::debug!(path = %path.display(), "acquired run lock");
        Ok(Self { _file: file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock; the sentinel file stays.
        tracing::debug!(path = %self.path.display(), "released run lock");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
