//! Chunk payload storage.
//!
//! [`ChunkBackend`] is the pluggable medium: a content-addressed blob namespace
//! holding immutable payloads. [`ChunkStore`] wraps a backend with bounded
//! retries, per-call timeouts and the mapping into engine errors.
//!
//! `delete` and `rewrite` are not timed out. A backend may keep working on a
//! call its caller abandoned, and the reaper and compactor hand their claims
//! back as soon as the call returns; a late delete or image swap would then
//! remove a payload the index has since revived.

pub mod faulty;
pub mod file;
pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::config::StorageConfig;
use crate::error::{DedupError, Result, StoreError, StoreResult};
use crate::fingerprint::ChunkHash;
use crate::retry::{RetryConfig, RetryExecutor, RetryOutcome};

pub use faulty::FaultyBackend;
pub use file::FileBackend;
pub use memory::MemoryBackend;

/// What a rewrite must keep.
#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    /// Hashes that were live when the compactor took its snapshot.
    pub live: HashSet<ChunkHash>,
    /// Records written at or after this backend watermark are kept regardless
    /// of `live`; they landed after the snapshot was taken.
    pub retain_written_since: u64,
}

impl RewritePlan {
    /// Should a record with this hash and write sequence survive?
    pub fn retains(&self, hash: &ChunkHash, seq: u64) -> bool {
        seq >= self.retain_written_since || self.live.contains(hash)
    }
}

/// Outcome of a backend rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Backend image size before the swap.
    pub bytes_before: u64,
    /// Backend image size after the swap.
    pub bytes_after: u64,
    /// Payload records left out of the new image.
    pub records_dropped: usize,
}

impl RewriteReport {
    /// Space returned to the medium.
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// A medium for chunk payloads.
///
/// Payloads are immutable: `put` for a hash that is already present writes
/// nothing, but it still takes a fresh write sequence so a concurrent rewrite
/// keeps the record. `rewrite` builds a fresh image holding only what the plan retains
/// and swaps it in atomically; reads and writes racing with a rewrite must see
/// either the old or the new image, never neither.
#[async_trait]
pub trait ChunkBackend: Send + Sync + 'static {
    /// Store a payload under its content address.
    async fn put(&self, hash: &ChunkHash, data: Bytes) -> StoreResult<()>;

    /// Fetch a payload; `StoreError::NotFound` if absent.
    async fn get(&self, hash: &ChunkHash) -> StoreResult<Bytes>;

    /// Remove a payload. Returns whether it was present.
    async fn delete(&self, hash: &ChunkHash) -> StoreResult<bool>;

    /// Is a payload present?
    async fn contains(&self, hash: &ChunkHash) -> StoreResult<bool>;

    /// Monotonic write sequence: the sequence number the next `put` will get.
    fn watermark(&self) -> u64;

    /// Rewrite the image keeping only what `plan` retains.
    async fn rewrite(&self, plan: &RewritePlan) -> StoreResult<RewriteReport>;

    /// Bytes the image currently occupies, dead records included.
    async fn size_bytes(&self) -> StoreResult<u64>;

    /// Persist any buffered state.
    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Build the backend selected by configuration.
pub async fn open_backend(config: &StorageConfig) -> Result<Arc<dyn ChunkBackend>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        StorageConfig::File { dir } => {
            let backend = FileBackend::open(dir.clone())
                .await
                .map_err(|source| DedupError::StorageBackend {
                    op: "open",
                    attempts: 1,
                    source,
                })?;
            Ok(Arc::new(backend))
        }
    }
}

/// Backend handle with retries and error mapping.
#[derive(Clone)]
pub struct ChunkStore {
    backend: Arc<dyn ChunkBackend>,
    retry: RetryExecutor,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

fn backend_error<T>(op: &'static str, outcome: RetryOutcome<T>) -> Result<T> {
    match outcome {
        RetryOutcome::Success(v) => Ok(v),
        RetryOutcome::Failed {
            last_error,
            attempts,
        } => {
            warn!(op, attempts, error = %last_error, "backend call failed");
            Err(DedupError::StorageBackend {
                op,
                attempts,
                source: last_error,
            })
        }
    }
}

impl ChunkStore {
    /// Wrap a backend; `timeout` bounds each attempt.
    pub fn new(backend: Arc<dyn ChunkBackend>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            backend,
            retry: RetryExecutor::new(retry, timeout),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn ChunkBackend> {
        &self.backend
    }

    /// Store a payload.
    pub async fn put(&self, hash: &ChunkHash, data: Bytes) -> Result<()> {
        let hash = *hash;
        let outcome = self
            .retry
            .execute("put", || {
                let backend = Arc::clone(&self.backend);
                let data = data.clone();
                async move { backend.put(&hash, data).await }
            })
            .await;
        backend_error("put", outcome)
    }

    /// Fetch a payload; a missing payload is `NotFound`.
    pub async fn get(&self, hash: &ChunkHash) -> Result<Bytes> {
        let hash = *hash;
        let outcome = self
            .retry
            .execute("get", || {
                let backend = Arc::clone(&self.backend);
                async move { backend.get(&hash).await }
            })
            .await;
        match outcome {
            RetryOutcome::Failed {
                last_error: StoreError::NotFound(_),
                ..
            } => Err(DedupError::NotFound { hash }),
            other => backend_error("get", other),
        }
    }

    /// Remove a payload. Attempts run until the backend answers.
    pub async fn delete(&self, hash: &ChunkHash) -> Result<bool> {
        let hash = *hash;
        let outcome = self
            .retry
            .execute_to_completion("delete", || {
                let backend = Arc::clone(&self.backend);
                async move { backend.delete(&hash).await }
            })
            .await;
        backend_error("delete", outcome)
    }

    /// Is a payload present?
    pub async fn contains(&self, hash: &ChunkHash) -> Result<bool> {
        let hash = *hash;
        let outcome = self
            .retry
            .execute("contains", || {
                let backend = Arc::clone(&self.backend);
                async move { backend.contains(&hash).await }
            })
            .await;
        backend_error("contains", outcome)
    }

    /// Current backend write watermark.
    pub fn watermark(&self) -> u64 {
        self.backend.watermark()
    }

    /// Rewrite the backend image. Attempts run until the backend answers.
    pub async fn rewrite(&self, plan: &RewritePlan) -> Result<RewriteReport> {
        let outcome = self
            .retry
            .execute_to_completion("rewrite", || {
                let backend = Arc::clone(&self.backend);
                async move { backend.rewrite(plan).await }
            })
            .await;
        backend_error("rewrite", outcome)
    }

    /// Bytes occupied by the backend image.
    pub async fn size_bytes(&self) -> Result<u64> {
        let outcome = self
            .retry
            .execute("size", || {
                let backend = Arc::clone(&self.backend);
                async move { backend.size_bytes().await }
            })
            .await;
        backend_error("size", outcome)
    }

    /// Persist buffered backend state.
    pub async fn flush(&self) -> Result<()> {
        let outcome = self
            .retry
            .execute("flush", || {
                let backend = Arc::clone(&self.backend);
                async move { backend.flush().await }
            })
            .await;
        backend_error("flush", outcome)
    }
}
