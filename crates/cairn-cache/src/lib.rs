//! Content-addressable cache store.
//!
//! Objects are keyed by content hash and sharded by the first two hex
//! characters to keep per-directory entry counts bounded. Files are stored
//! as raw bytes; directories are stored as a *tree object*: the canonical
//! manifest bytes under the key `<hash>.dir`, with each child file stored as
//! its own object. Objects are immutable once written; `put` of existing
//! content is a no-op, so concurrent duplicate writes need no locking beyond
//! the atomicity of the final rename.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use cairn_hash::{sha256_bytes, ContentHasher, TreeManifest};
use cairn_types::{atomic_write, CairnError, Result};

/// Suffix distinguishing tree-manifest objects from plain file objects.
pub const DIR_SUFFIX: &str = ".dir";

/// Returns `true` if `hash` names a tree object rather than a file object.
pub fn is_tree_hash(hash: &str) -> bool {
    hash.ends_with(DIR_SUFFIX)
}

/// Result of a garbage collection pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed: usize,
    pub kept: usize,
}

/// Local content-addressable object store.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Shard an object key into `<root>/<first two chars>/<rest>`.
    fn object_path(&self, hash: &str) -> PathBuf {
        let (prefix, rest) = hash.split_at(2.min(hash.len()));
        self.root.join(prefix).join(rest)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).is_file()
    }

    /// Store raw bytes, returning their hash. No-op if already present.
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<String> {
        let hash = sha256_bytes(bytes);
        self.put_keyed(&hash, bytes)?;
        Ok(hash)
    }

    /// Store bytes under an explicit key (used for tree objects and by the
    /// synchronizer when pulling). Idempotent.
    pub fn put_keyed(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(hash);
        if path.is_file() {
            return Ok(());
        }
        atomic_write(&path, bytes)?;
        tracing::debug!(%hash, size = bytes.len(), "cached object");
        Ok(())
    }

    /// Retrieve a previously stored object.
    pub fn get_bytes(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        if !path.is_file() {
            return Err(CairnError::ObjectMissing {
                hash: hash.to_string(),
            });
        }
        Ok(std::fs::read(path)?)
    }

    /// Store a working-tree path (file or directory), returning its hash.
    ///
    /// Directories store each child file as its own object plus the tree
    /// manifest under `<hash>.dir`; the returned key carries that suffix.
    pub fn put_path(&self, path: &Path, hasher: &mut ContentHasher) -> Result<String> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            let manifest = hasher.manifest_for_dir(path)?;
            for entry in &manifest.entries {
                self.import_file(&path.join(&entry.path), &entry.hash)?;
            }
            let key = format!("{}{}", manifest.hash(), DIR_SUFFIX);
            self.put_keyed(&key, &manifest.canonical_bytes())?;
            Ok(key)
        } else {
            let hash = hasher.hash_file(path)?;
            self.import_file(path, &hash)?;
            Ok(hash)
        }
    }

    /// Copy a working file into the store under its known hash.
    ///
    /// Always a copy, never a link: a linked object would share an inode
    /// with a mutable working file, and a later in-place rewrite of that
    /// file would change the bytes stored under the old hash.
    fn import_file(&self, src: &Path, hash: &str) -> Result<()> {
        let dest = self.object_path(hash);
        if dest.is_file() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Temp-then-rename; the suffix is appended so "x" and "x.dir"
        // never share a temp path.
        let tmp = PathBuf::from(format!("{}.tmp-{}", dest.display(), std::process::id()));
        std::fs::copy(src, &tmp)?;
        std::fs::rename(&tmp, &dest)?;
        Ok(())
    }

    /// Place an object's content at `dest` in the working tree.
    ///
    /// Tree objects are expanded recursively; file objects are copied into
    /// place, so a stage later rewriting the path cannot reach back into
    /// the store. Existing content at `dest` is replaced.
    pub fn materialize(&self, hash: &str, dest: &Path) -> Result<()> {
        if is_tree_hash(hash) {
            let manifest = TreeManifest::parse(&self.get_bytes(hash)?)?;
            if dest.exists() {
                std::fs::remove_dir_all(dest).or_else(|_| std::fs::remove_file(dest))?;
            }
            std::fs::create_dir_all(dest)?;
            for entry in &manifest.entries {
                self.materialize_file(&entry.hash, &dest.join(&entry.path))?;
            }
            Ok(())
        } else {
            self.materialize_file(hash, dest)
        }
    }

    fn materialize_file(&self, hash: &str, dest: &Path) -> Result<()> {
        let src = self.object_path(hash);
        if !src.is_file() {
            return Err(CairnError::ObjectMissing {
                hash: hash.to_string(),
            });
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        std::fs::copy(&src, dest)?;
        Ok(())
    }

    /// Every object key currently stored.
    pub fn all_hashes(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        if !self.root.exists() {
            return Ok(hashes);
        }
        for shard in std::fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for obj in std::fs::read_dir(shard.path())? {
                let obj = obj?;
                hashes.push(format!("{prefix}{}", obj.file_name().to_string_lossy()));
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Expand a set of root hashes to include every file referenced by the
    /// tree objects among them.
    pub fn closure(&self, roots: impl IntoIterator<Item = String>) -> Result<HashSet<String>> {
        let mut live = HashSet::new();
        for hash in roots {
            if is_tree_hash(&hash) {
                // A missing tree object contributes only itself; gc keeps
                // what it can prove live.
                if let Ok(bytes) = self.get_bytes(&hash) {
                    let manifest = TreeManifest::parse(&bytes)?;
                    for entry in manifest.entries {
                        live.insert(entry.hash);
                    }
                }
            }
            live.insert(hash);
        }
        Ok(live)
    }

    /// Remove every stored object whose key is not in `live`.
    ///
    /// `live` must already be a closure (tree children included); use
    /// [`closure`](CacheStore::closure) to expand lock-entry roots.
    pub fn garbage_collect(&self, live: &HashSet<String>) -> Result<GcReport> {
        let mut report = GcReport::default();
        for hash in self.all_hashes()? {
            if live.contains(&hash) {
                report.kept += 1;
            } else {
                std::fs::remove_file(self.object_path(&hash))?;
                tracing::debug!(%hash, "collected unreferenced object");
                report.removed += 1;
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));
        (dir, store)
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = store();
        let hash = store.put_bytes(b"content").unwrap();
        assert!(store.contains(&hash));
        assert_eq!(store.get_bytes(&hash).unwrap(), b"content");
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let h1 = store.put_bytes(b"same").unwrap();
        let h2 = store.put_bytes(b"same").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.all_hashes().unwrap().len(), 1);
    }

    #[test]
    fn get_missing_object_errors() {
        let (_dir, store) = store();
        let err = store.get_bytes("deadbeef").unwrap_err();
        assert!(matches!(err, CairnError::ObjectMissing { .. }));
    }

    #[test]
    fn objects_shard_by_prefix() {
        let (_dir, store) = store();
        let hash = store.put_bytes(b"sharded").unwrap();
        let expected = store
            .root
            .join(&hash[..2])
            .join(&hash[2..]);
        assert!(expected.is_file());
    }

    #[test]
    fn put_path_stores_directory_as_tree() {
        let (dir, store) = store();
        let tree = dir.path().join("data");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("a.txt"), "A").unwrap();
        std::fs::write(tree.join("sub/b.txt"), "B").unwrap();

        let mut hasher = ContentHasher::new();
        let key = store.put_path(&tree, &mut hasher).unwrap();
        assert!(is_tree_hash(&key));
        // Tree object + two file objects
        assert_eq!(store.all_hashes().unwrap().len(), 3);

        // Materialize into a fresh location reproduces the bytes
        let out = dir.path().join("restored");
        store.materialize(&key, &out).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "A");
        assert_eq!(
            std::fs::read_to_string(out.join("sub/b.txt")).unwrap(),
            "B"
        );
    }

    #[test]
    fn stored_object_survives_working_file_rewrite() {
        // A stale stage re-running rewrites its output in place; the bytes
        // stored under the old hash must not change with it.
        let (dir, store) = store();
        let working = dir.path().join("model.txt");
        std::fs::write(&working, "version one").unwrap();

        let mut hasher = ContentHasher::new();
        let hash = store.put_path(&working, &mut hasher).unwrap();

        std::fs::write(&working, "version two").unwrap();
        assert_eq!(store.get_bytes(&hash).unwrap(), b"version one");
    }

    #[test]
    fn materialized_file_is_independent_of_the_store() {
        let (dir, store) = store();
        let hash = store.put_bytes(b"pristine").unwrap();
        let dest = dir.path().join("restored.txt");
        store.materialize(&hash, &dest).unwrap();

        std::fs::write(&dest, "scribbled over").unwrap();
        assert_eq!(store.get_bytes(&hash).unwrap(), b"pristine");
    }

    #[test]
    fn materialize_replaces_existing_file() {
        let (dir, store) = store();
        let hash = store.put_bytes(b"new").unwrap();
        let dest = dir.path().join("out.txt");
        std::fs::write(&dest, "old").unwrap();
        store.materialize(&hash, &dest).unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new");
    }

    #[test]
    fn gc_removes_only_unreferenced() {
        let (dir, store) = store();
        let keep = store.put_bytes(b"keep").unwrap();
        let drop = store.put_bytes(b"drop").unwrap();

        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("f.txt"), "inside tree").unwrap();
        let mut hasher = ContentHasher::new();
        let tree_key = store.put_path(&tree, &mut hasher).unwrap();

        let live = store
            .closure(vec![keep.clone(), tree_key.clone()])
            .unwrap();
        let report = store.garbage_collect(&live).unwrap();

        assert_eq!(report.removed, 1);
        assert!(store.contains(&keep));
        assert!(store.contains(&tree_key));
        assert!(!store.contains(&drop));
        // The tree's child file survived via the closure.
        assert_eq!(store.all_hashes().unwrap().len(), 3);
    }

    #[test]
    fn closure_expands_tree_children() {
        let (dir, store) = store();
        let tree = dir.path().join("t");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("x"), "x").unwrap();
        let mut hasher = ContentHasher::new();
        let key = store.put_path(&tree, &mut hasher).unwrap();

        let live = store.closure(vec![key.clone()]).unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&key));
    }
}
