//! Content hashing for files and directory trees.
//!
//! A regular file hashes to the SHA-256 of its bytes. A directory hashes to
//! the SHA-256 of its *tree manifest*: the canonical JSON array of
//! `(relative-path, child-hash)` pairs sorted by path. The manifest makes the
//! hash independent of filesystem enumeration order while remaining sensitive
//! to any rename, addition, removal, or byte change below the directory.
//!
//! To avoid rehashing unchanged large files on every invocation, the hasher
//! keeps a side cache keyed by `(absolute path, size, mtime)`; any mismatch
//! forces a full rehash.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cairn_types::{atomic_write, CairnError, Result};

/// SHA-256 of a byte slice, lowercase hex.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's content, streamed in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Tree manifests
// ---------------------------------------------------------------------------

/// One file inside a hashed directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    /// Content hash of the file at that path.
    pub hash: String,
}

/// Sorted listing of every file under a directory with its content hash.
///
/// The manifest's canonical JSON bytes are what a directory's hash is
/// computed from, and what the cache stores as the tree object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeManifest {
    pub entries: Vec<TreeEntry>,
}

impl TreeManifest {
    /// Canonical byte form: compact JSON of the sorted entry list.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Entries are kept sorted by path; serde_json emits them in order.
        serde_json::to_vec(&self.entries).unwrap_or_default()
    }

    /// The tree hash: SHA-256 of the canonical manifest bytes.
    pub fn hash(&self) -> String {
        sha256_bytes(&self.canonical_bytes())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<TreeEntry> = serde_json::from_slice(bytes)?;
        Ok(Self { entries })
    }
}

// ---------------------------------------------------------------------------
// Side cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SideEntry {
    size: u64,
    mtime_ns: u128,
    hash: String,
}

fn file_signature(path: &Path) -> Result<(u64, u128)> {
    let meta = std::fs::metadata(path)?;
    let mtime_ns = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok((meta.len(), mtime_ns))
}

/// Content hasher with an optional persisted `(path, size, mtime)` side cache.
pub struct ContentHasher {
    cache: BTreeMap<String, SideEntry>,
    cache_path: Option<PathBuf>,
    dirty: bool,
}

impl ContentHasher {
    /// A hasher with no side cache; every call rehashes.
    pub fn new() -> Self {
        Self {
            cache: BTreeMap::new(),
            cache_path: None,
            dirty: false,
        }
    }

    /// A hasher backed by a side cache file. A missing or corrupt cache
    /// file starts empty rather than failing.
    pub fn with_side_cache(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            cache,
            cache_path: Some(path),
            dirty: false,
        }
    }

    /// Hash a path: file bytes for a regular file, tree manifest hash for a
    /// directory.
    pub fn hash_path(&mut self, path: &Path) -> Result<String> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            Ok(self.manifest_for_dir(path)?.hash())
        } else {
            self.hash_file(path)
        }
    }

    /// Hash a regular file, consulting the side cache first.
    pub fn hash_file(&mut self, path: &Path) -> Result<String> {
        let key = path.to_string_lossy().into_owned();
        let (size, mtime_ns) = file_signature(path)?;

        if let Some(entry) = self.cache.get(&key) {
            if entry.size == size && entry.mtime_ns == mtime_ns {
                return Ok(entry.hash.clone());
            }
        }

        let hash = sha256_file(path)?;
        tracing::trace!(path = %path.display(), %hash, "hashed file");
        self.cache.insert(
            key,
            SideEntry {
                size,
                mtime_ns,
                hash: hash.clone(),
            },
        );
        self.dirty = true;
        Ok(hash)
    }

    /// Build the sorted tree manifest for a directory.
    ///
    /// Walks every regular file below `root`; entries are sorted by their
    /// `/`-separated relative path so enumeration order never matters.
    pub fn manifest_for_dir(&mut self, root: &Path) -> Result<TreeManifest> {
        let mut entries = Vec::new();
        for item in walkdir::WalkDir::new(root).follow_links(false) {
            let item = item.map_err(|e| {
                CairnError::Storage(format!("walking {}: {e}", root.display()))
            })?;
            if !item.file_type().is_file() {
                continue;
            }
            let rel = item
                .path()
                .strip_prefix(root)
                .map_err(|e| CairnError::Storage(e.to_string()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let hash = self.hash_file(item.path())?;
            entries.push(TreeEntry { path: rel, hash });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(TreeManifest { entries })
    }

    /// Persist the side cache if it changed and a cache path was configured.
    pub fn persist(&mut self) -> Result<()> {
        if let (true, Some(path)) = (self.dirty, self.cache_path.as_ref()) {
            atomic_write(path, &serde_json::to_vec(&self.cache)?)?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn file_hash_matches_byte_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");

        let mut hasher = ContentHasher::new();
        let h = hasher.hash_path(&dir.path().join("a.txt")).unwrap();
        assert_eq!(h, sha256_bytes(b"hello"));
    }

    #[test]
    fn directory_hash_is_enumeration_order_independent() {
        // Build the same logical tree twice with different creation order;
        // the manifest sorts by relative path, so the hashes must agree.
        let first = tempfile::tempdir().unwrap();
        write(first.path(), "b/two.txt", "2");
        write(first.path(), "a/one.txt", "1");

        let second = tempfile::tempdir().unwrap();
        write(second.path(), "a/one.txt", "1");
        write(second.path(), "b/two.txt", "2");

        let mut hasher = ContentHasher::new();
        let h1 = hasher.hash_path(first.path()).unwrap();
        let h2 = hasher.hash_path(second.path()).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn directory_hash_changes_on_rename_and_content() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "1");

        let mut hasher = ContentHasher::new();
        let base = hasher.hash_path(dir.path()).unwrap();

        // Byte change
        write(dir.path(), "a.txt", "2");
        let changed = hasher.hash_path(dir.path()).unwrap();
        assert_ne!(base, changed);

        // Rename back to original content under a new name
        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        write(dir.path(), "renamed.txt", "1");
        let renamed = hasher.hash_path(dir.path()).unwrap();
        assert_ne!(base, renamed);
    }

    #[test]
    fn missing_path_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut hasher = ContentHasher::new();
        let err = hasher.hash_path(&dir.path().join("nope")).unwrap_err();
        match err {
            CairnError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected Io error, got: {other:?}"),
        }
    }

    #[test]
    fn side_cache_round_trips_and_detects_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("hashes.json");
        write(dir.path(), "data.txt", "payload");
        let target = dir.path().join("data.txt");

        let mut hasher = ContentHasher::with_side_cache(&cache_file);
        let h1 = hasher.hash_file(&target).unwrap();
        hasher.persist().unwrap();
        assert!(cache_file.exists());

        // A fresh hasher loads the cache and returns the same hash.
        let mut reloaded = ContentHasher::with_side_cache(&cache_file);
        assert_eq!(reloaded.hash_file(&target).unwrap(), h1);

        // Changing size forces a rehash with the new content hash.
        std::fs::write(&target, "different payload").unwrap();
        let h2 = reloaded.hash_file(&target).unwrap();
        assert_eq!(h2, sha256_bytes(b"different payload"));
        assert_ne!(h1, h2);
    }

    #[test]
    fn corrupt_side_cache_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("hashes.json");
        std::fs::write(&cache_file, "{not json").unwrap();
        write(dir.path(), "x.txt", "x");

        let mut hasher = ContentHasher::with_side_cache(&cache_file);
        assert_eq!(
            hasher.hash_file(&dir.path().join("x.txt")).unwrap(),
            sha256_bytes(b"x")
        );
    }

    #[test]
    fn manifest_hash_matches_canonical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "1");
        write(dir.path(), "b.txt", "2");

        let mut hasher = ContentHasher::new();
        let manifest = hasher.manifest_for_dir(dir.path()).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.hash(), sha256_bytes(&manifest.canonical_bytes()));

        let parsed = TreeManifest::parse(&manifest.canonical_bytes()).unwrap();
        assert_eq!(parsed, manifest);
    }
}
