//! Fault-injecting backend wrapper for exercising failure paths.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{ChunkBackend, RewritePlan, RewriteReport};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::ChunkHash;

/// Wraps another backend and fails calls on request.
///
/// Counted failures (`fail_next_*`) are transient `Unavailable` errors and are
/// consumed one per call. `fail_puts_permanently` makes every put fail with a
/// non-retryable error until cleared.
pub struct FaultyBackend {
    inner: Arc<dyn ChunkBackend>,
    put_failures: AtomicU32,
    delete_failures: AtomicU32,
    rewrite_failures: AtomicU32,
    permanent_put_failure: AtomicBool,
    put_delay_ms: AtomicU64,
    mutation_delay_ms: AtomicU64,
    injected: AtomicU32,
}

impl FaultyBackend {
    /// Wrap `inner` with no faults armed.
    pub fn new(inner: Arc<dyn ChunkBackend>) -> Self {
        Self {
            inner,
            put_failures: AtomicU32::new(0),
            delete_failures: AtomicU32::new(0),
            rewrite_failures: AtomicU32::new(0),
            permanent_put_failure: AtomicBool::new(false),
            put_delay_ms: AtomicU64::new(0),
            mutation_delay_ms: AtomicU64::new(0),
            injected: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` puts.
    pub fn fail_next_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` deletes.
    pub fn fail_next_deletes(&self, n: u32) {
        self.delete_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` rewrites.
    pub fn fail_next_rewrites(&self, n: u32) {
        self.rewrite_failures.store(n, Ordering::SeqCst);
    }

    /// Make every put fail with a permanent error.
    pub fn fail_puts_permanently(&self, on: bool) {
        self.permanent_put_failure.store(on, Ordering::SeqCst);
    }

    /// Delay each put by `delay` before it reaches the inner backend.
    pub fn set_put_delay(&self, delay: Duration) {
        self.put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay each delete and rewrite by `delay` before it reaches the inner
    /// backend.
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.mutation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    async fn pause(&self, delay_ms: &AtomicU64) {
        let delay = delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn take(&self, counter: &AtomicU32, op: &'static str) -> StoreResult<()> {
        let armed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.injected.fetch_add(1, Ordering::SeqCst);
            debug!(op, "injecting backend failure");
            return Err(StoreError::Unavailable(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkBackend for FaultyBackend {
    async fn put(&self, hash: &ChunkHash, data: Bytes) -> StoreResult<()> {
        self.pause(&self.put_delay_ms).await;
        if self.permanent_put_failure.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Corrupted {
                reason: "injected permanent put failure".to_string(),
            });
        }
        self.take(&self.put_failures, "put")?;
        self.inner.put(hash, data).await
    }

    async fn get(&self, hash: &ChunkHash) -> StoreResult<Bytes> {
        self.inner.get(hash).await
    }

    async fn delete(&self, hash: &ChunkHash) -> StoreResult<bool> {
        self.pause(&self.mutation_delay_ms).await;
        self.take(&self.delete_failures, "delete")?;
        self.inner.delete(hash).await
    }

    async fn contains(&self, hash: &ChunkHash) -> StoreResult<bool> {
        self.inner.contains(hash).await
    }

    fn watermark(&self) -> u64 {
        self.inner.watermark()
    }

    async fn rewrite(&self, plan: &RewritePlan) -> StoreResult<RewriteReport> {
        self.pause(&self.mutation_delay_ms).await;
        self.take(&self.rewrite_failures, "rewrite")?;
        self.inner.rewrite(plan).await
    }

    async fn size_bytes(&self) -> StoreResult<u64> {
        self.inner.size_bytes().await
    }

    async fn flush(&self) -> StoreResult<()> {
        self.inner.flush().await
    }

    fn name(&self) -> &'static str {
        "faulty"
    }
}
