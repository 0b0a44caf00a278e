//! Object store backends.
//!
//! The engine only ever talks to a remote through [`ObjectStore`]; credential
//! configuration is the backend's concern, not the engine's.

use std::path::PathBuf;

use async_trait::async_trait;

use cairn_types::{CairnError, Result};

/// Collaborator interface to a remote object store keyed by hash.
///
/// All three operations are idempotent: `put` of an existing object and
/// `exists`/`get` repeated after a partial failure behave identically.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, hash: &str) -> Result<bool>;
    async fn put(&self, hash: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, hash: &str) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Local directory backend
// ---------------------------------------------------------------------------

/// Remote backed by a directory (NFS mount, external disk), sharded by hash
/// prefix like the local cache.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        let (prefix, rest) = hash.split_at(2.min(hash.len()));
        self.root.join(prefix).join(rest)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(hash)).await?)
    }

    async fn put(&self, hash: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.object_path(hash);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Temp-then-rename so a concurrent reader never sees a partial
        // object. The suffix is appended, not swapped in, so "x" and
        // "x.dir" never share a temp path.
        let tmp = PathBuf::from(format!("{}.tmp-{}", path.display(), std::process::id()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        if !tokio::fs::try_exists(&path).await? {
            return Err(CairnError::ObjectMissing {
                hash: hash.to_string(),
            });
        }
        Ok(tokio::fs::read(path).await?)
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// Remote speaking plain HTTP: `HEAD`/`PUT`/`GET` against `<base>/<hash>`.
pub struct HttpObjectStore {
    base: String,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, hash: &str) -> String {
        format!("{}/{}", self.base, hash)
    }
}

/// Map a reqwest failure to the transfer error taxonomy. Connection and
/// timeout failures are transient; everything else is fatal.
fn http_error(err: reqwest::Error) -> CairnError {
    CairnError::Remote {
        message: err.to_string(),
        retryable: err.is_timeout() || err.is_connect(),
    }
}

/// Server-side statuses worth retrying: 5xx and 429.
fn status_error(status: reqwest::StatusCode) -> CairnError {
    CairnError::Remote {
        message: format!("HTTP {status}"),
        retryable: status.is_server_error() || status.as_u16() == 429,
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn exists(&self, hash: &str) -> Result<bool> {
        let resp = self
            .client
            .head(self.url(hash))
            .send()
            .await
            .map_err(http_error)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            s if s == reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(s)),
        }
    }

    async fn put(&self, hash: &str, bytes: Vec<u8>) -> Result<()> {
        let resp = self
            .client
            .put(self.url(hash))
            .body(bytes)
            .send()
            .await
            .map_err(http_error)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_error(resp.status()))
        }
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.url(hash))
            .send()
            .await
            .map_err(http_error)?;
        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await.map_err(http_error)?.to_vec()),
            s if s == reqwest::StatusCode::NOT_FOUND => Err(CairnError::ObjectMissing {
                hash: hash.to_string(),
            }),
            s => Err(status_error(s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        assert!(!store.exists("abcdef").await.unwrap());
        store.put("abcdef", b"payload".to_vec()).await.unwrap();
        assert!(store.exists("abcdef").await.unwrap());
        assert_eq!(store.get("abcdef").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn local_store_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store.put("aa11", b"one".to_vec()).await.unwrap();
        // Second put of the same key does not rewrite the object.
        store.put("aa11", b"ignored".to_vec()).await.unwrap();
        assert_eq!(store.get("aa11").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn local_store_get_missing_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.get("ffff").await.unwrap_err();
        assert!(matches!(err, CairnError::ObjectMissing { .. }));
    }

    #[test]
    fn http_store_url_joins_cleanly() {
        let store = HttpObjectStore::new("http://cache.example/objects/");
        assert_eq!(store.url("ab12"), "http://cache.example/objects/ab12");
    }

    #[test]
    fn status_classification() {
        assert!(status_error(reqwest::StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(status_error(reqwest::StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!status_error(reqwest::StatusCode::FORBIDDEN).is_retryable());
    }
}
