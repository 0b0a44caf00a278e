//! Push/pull synchronizer between the local cache and an object store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use cairn_cache::CacheStore;
use cairn_types::{CairnError, Result};

use crate::store::ObjectStore;

/// Delay schedule between retry attempts for one object: doubling from
/// `base`, never exceeding `cap`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Retry immediately. Keeps transfer tests fast.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retrying after `attempt` failures (0-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|a| 1u32.checked_shl(a));
        match factor {
            Some(factor) => self.base.saturating_mul(factor).min(self.cap),
            None => self.cap,
        }
    }
}

impl Default for BackoffPolicy {
    // 500ms, 1s, 2s, ... capped at 30s.
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Outcome of a push or pull batch. Failures never abort unrelated objects;
/// the batch runs to completion and reports them here.
#[derive(Debug, Default)]
pub struct TransferReport {
    /// Objects actually transferred this invocation.
    pub transferred: Vec<String>,
    /// Objects the destination already had.
    pub skipped: Vec<String>,
    /// Objects that failed after retry exhaustion, with the final error.
    pub failed: Vec<(String, CairnError)>,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum ObjectOutcome {
    Transferred(String),
    Skipped(String),
    Failed(String, CairnError),
}

/// Moves cache objects to or from an [`ObjectStore`].
pub struct Synchronizer {
    cache: CacheStore,
    remote: Arc<dyn ObjectStore>,
    policy: BackoffPolicy,
    max_retries: usize,
    concurrency: usize,
}

impl Synchronizer {
    pub fn new(cache: CacheStore, remote: Arc<dyn ObjectStore>) -> Self {
        Self {
            cache,
            remote,
            policy: BackoffPolicy::default(),
            max_retries: 3,
            concurrency: 4,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy, max_retries: usize) -> Self {
        self.policy = policy;
        self.max_retries = max_retries;
        self
    }

    /// Upload each object the remote lacks. Idempotent and resumable:
    /// re-running after a partial failure transfers only the remainder.
    pub async fn push(&self, hashes: Vec<String>) -> TransferReport {
        self.run_batch(hashes, Direction::Push).await
    }

    /// Download each object the local cache lacks. Same semantics as push.
    pub async fn pull(&self, hashes: Vec<String>) -> TransferReport {
        self.run_batch(hashes, Direction::Pull).await
    }

    async fn run_batch(&self, hashes: Vec<String>, direction: Direction) -> TransferReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for hash in hashes {
            let cache = self.cache.clone();
            let remote = Arc::clone(&self.remote);
            let policy = self.policy;
            let max_retries = self.max_retries;
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                transfer_one(&cache, remote.as_ref(), &hash, direction, &policy, max_retries)
                    .await
            });
        }

        let mut report = TransferReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ObjectOutcome::Transferred(h)) => report.transferred.push(h),
                Ok(ObjectOutcome::Skipped(h)) => report.skipped.push(h),
                Ok(ObjectOutcome::Failed(h, e)) => report.failed.push((h, e)),
                Err(join_err) => report.failed.push((
                    String::new(),
                    CairnError::Storage(format!("transfer task panicked: {join_err}")),
                )),
            }
        }
        report.transferred.sort();
        report.skipped.sort();
        report
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Push,
    Pull,
}

async fn transfer_one(
    cache: &CacheStore,
    remote: &dyn ObjectStore,
    hash: &str,
    direction: Direction,
    policy: &BackoffPolicy,
    max_retries: usize,
) -> ObjectOutcome {
    let result = match direction {
        Direction::Push => push_one(cache, remote, hash, policy, max_retries).await,
        Direction::Pull => pull_one(cache, remote, hash, policy, max_retries).await,
    };
    match result {
        Ok(true) => {
            tracing::debug!(%hash, ?direction, "transferred object");
            ObjectOutcome::Transferred(hash.to_string())
        }
        Ok(false) => ObjectOutcome::Skipped(hash.to_string()),
        Err(e) => {
            tracing::warn!(%hash, ?direction, error = %e, "object transfer failed");
            ObjectOutcome::Failed(hash.to_string(), e)
        }
    }
}

/// Returns `Ok(true)` if the object was transferred, `Ok(false)` if the
/// remote already had it.
async fn push_one(
    cache: &CacheStore,
    remote: &dyn ObjectStore,
    hash: &str,
    policy: &BackoffPolicy,
    max_retries: usize,
) -> Result<bool> {
    if with_retry(|| remote.exists(hash), policy, max_retries, hash).await? {
        return Ok(false);
    }
    let bytes = cache.get_bytes(hash)?;
    with_retry(|| remote.put(hash, bytes.clone()), policy, max_retries, hash).await?;
    Ok(true)
}

async fn pull_one(
    cache: &CacheStore,
    remote: &dyn ObjectStore,
    hash: &str,
    policy: &BackoffPolicy,
    max_retries: usize,
) -> Result<bool> {
    if cache.contains(hash) {
        return Ok(false);
    }
    let bytes = with_retry(|| remote.get(hash), policy, max_retries, hash).await?;
    cache.put_keyed(hash, &bytes)?;
    Ok(true)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or exhausts
/// `max_retries` retries. The backoff delay is a pure function of the attempt
/// number and the policy.
async fn with_retry<T, F, Fut>(
    op: F,
    policy: &BackoffPolicy,
    max_retries: usize,
    hash: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay(attempt);
                tracing::debug!(%hash, attempt, delay_ms = %delay.as_millis(), "retrying transfer");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(CairnError::TransferFailed {
                    hash: hash.to_string(),
                    attempts: attempt + 1,
                    message: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
