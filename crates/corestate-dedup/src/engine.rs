//! Deduplication engine: the operation surface over the reference index,
//! the chunk store and the stats counters.
//!
//! The index update and the payload write are separate steps. A new hash is
//! first recorded as `Pending`; only the caller that created it writes the
//! payload, then commits. If the write fails (or the call is abandoned) the
//! pending entry is rolled back, so the index never claims a chunk the store
//! does not hold.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::chunker::{Chunk, ChunkSplitter};
use crate::compactor::{self, CompactionReport};
use crate::config::{DedupConfig, CONFLICT_BACKOFF_MAX_MS};
use crate::error::{DedupError, Result};
use crate::fingerprint::ChunkHash;
use crate::index::{EntryState, ReferenceEntry, ReferenceIndex};
use crate::journal::IndexJournal;
use crate::persist::{self, IndexSnapshot};
use crate::reaper::{self, ReapPolicy, ReapStats};
use crate::retry::{backoff_for, RetryConfig};
use crate::stats::{StatsAggregator, StorageStats};
use crate::store::{ChunkBackend, ChunkStore};

/// Outcome of submitting one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    /// Caller-supplied correlation id.
    pub chunk_id: String,
    /// Content address of the chunk.
    pub hash: ChunkHash,
    /// True when the content was already stored.
    pub is_duplicate: bool,
    /// Bytes written to the backend; 0 for a duplicate.
    pub stored_size: u64,
    /// Size of the submitted content.
    pub logical_size: u64,
    /// Reference count after this submission.
    pub reference_count: u64,
}

/// One chunk of an ingested stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedChunk {
    /// Offset of the chunk within the stream.
    pub offset: u64,
    /// Dedup outcome for the chunk.
    pub result: DeduplicationResult,
}

/// Outcome of chunking and submitting a whole stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Stream identifier; chunk ids are `"{stream_id}:{index}"`.
    pub stream_id: String,
    /// Per-chunk results in stream order.
    pub chunks: Vec<IngestedChunk>,
    /// Total stream length.
    pub logical_bytes: u64,
    /// Bytes newly written to the backend.
    pub stored_bytes: u64,
    /// Chunks that were already stored.
    pub duplicate_chunks: usize,
}

impl IngestReport {
    fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            ..Default::default()
        }
    }

    fn push(&mut self, offset: u64, result: DeduplicationResult) {
        self.logical_bytes += result.logical_size;
        self.stored_bytes += result.stored_size;
        if result.is_duplicate {
            self.duplicate_chunks += 1;
        }
        self.chunks.push(IngestedChunk { offset, result });
    }
}

/// Engine health summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Backend answered and no fault was observed.
    pub healthy: bool,
    /// Backend name.
    pub backend: String,
    /// Backend image size, if it could be read.
    pub backend_bytes: Option<u64>,
    /// Error from the backend size query, if any.
    pub error: Option<String>,
    /// Index entries in any state.
    pub index_entries: usize,
    /// Expiry reaper task is running.
    pub reaper_running: bool,
    /// Periodic compactor task is running.
    pub compactor_running: bool,
    /// Current storage counters.
    pub stats: StorageStats,
}

/// Liveness flags set by the background workers.
#[derive(Debug, Default)]
pub(crate) struct WorkerStatus {
    reaper: AtomicBool,
    compactor: AtomicBool,
}

impl WorkerStatus {
    pub(crate) fn set_reaper_running(&self, running: bool) {
        self.reaper.store(running, Ordering::SeqCst);
    }

    pub(crate) fn set_compactor_running(&self, running: bool) {
        self.compactor.store(running, Ordering::SeqCst);
    }
}

/// Rolls a `Pending` entry back unless the payload write was committed.
struct PendingWrite<'a> {
    index: &'a ReferenceIndex,
    hash: ChunkHash,
    armed: bool,
}

impl PendingWrite<'_> {
    fn committed(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if self.armed && self.index.rollback(&self.hash).is_some() {
            warn!(hash = %self.hash, "pending index entry rolled back");
        }
    }
}

/// The deduplication engine.
///
/// Owns the reference index exclusively; callers only reach it through the
/// operations below. Construct once and share behind an `Arc`.
pub struct DedupEngine {
    config: DedupConfig,
    splitter: ChunkSplitter,
    index: ReferenceIndex,
    store: ChunkStore,
    stats: StatsAggregator,
    policy: ReapPolicy,
    conflict_backoff: RetryConfig,
    compaction: Mutex<()>,
    checkpoint: Mutex<()>,
    workers: WorkerStatus,
}

impl std::fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupEngine")
            .field("store", &self.store)
            .field("entries", &self.index.len())
            .finish()
    }
}

impl DedupEngine {
    /// Build an engine over `backend` after validating `config`.
    pub fn new(config: DedupConfig, backend: Arc<dyn ChunkBackend>) -> Result<Self> {
        config.validate()?;
        let splitter = ChunkSplitter::new(config.chunker, config.hash_algorithm)?;
        let store = ChunkStore::new(backend, config.retry.clone(), config.store_timeout());
        let policy = ReapPolicy::from(&config.reaper);
        let conflict_backoff = RetryConfig {
            max_retries: config.conflict_retry_limit(),
            initial_backoff_ms: 1,
            max_backoff_ms: CONFLICT_BACKOFF_MAX_MS,
            backoff_multiplier: 2.0,
            jitter: true,
        };
        Ok(Self {
            config,
            splitter,
            index: ReferenceIndex::new(),
            store,
            stats: StatsAggregator::new(),
            policy,
            conflict_backoff,
            compaction: Mutex::new(()),
            checkpoint: Mutex::new(()),
            workers: WorkerStatus::default(),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Splitter configured for this engine.
    pub fn splitter(&self) -> &ChunkSplitter {
        &self.splitter
    }

    pub(crate) fn workers(&self) -> &WorkerStatus {
        &self.workers
    }

    pub(crate) fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Retry `op` while it reports a conflict with an in-flight write or reap.
    async fn retry_conflicts<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Err(DedupError::ConcurrentModificationConflict { hash, .. }) => {
                    if attempt >= self.conflict_backoff.max_retries {
                        return Err(DedupError::ConcurrentModificationConflict {
                            hash,
                            attempts: attempt + 1,
                        });
                    }
                    let backoff = backoff_for(&self.conflict_backoff, attempt);
                    attempt += 1;
                    debug!(%hash, attempt, ?backoff, "entry in transition, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Submit one chunk.
    ///
    /// `data` must be non-empty and no larger than `max_chunk_size`.
    /// `metadata` is stored verbatim with the first submission of a hash and
    /// never interpreted.
    #[instrument(skip(self, data, metadata), fields(size = data.len()))]
    pub async fn process_chunk(
        &self,
        chunk_id: &str,
        data: Bytes,
        metadata: Option<serde_json::Value>,
    ) -> Result<DeduplicationResult> {
        self.check_chunk(&data)?;
        let hash = self.config.hash_algorithm.hash(&data);
        self.process_hashed(chunk_id, hash, data, metadata).await
    }

    fn check_chunk(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(DedupError::invalid_input("chunk data is empty"));
        }
        if data.len() > self.config.max_chunk_size {
            return Err(DedupError::invalid_input(format!(
                "chunk of {} bytes exceeds max_chunk_size {}",
                data.len(),
                self.config.max_chunk_size
            )));
        }
        Ok(())
    }

    async fn process_hashed(
        &self,
        chunk_id: &str,
        hash: ChunkHash,
        data: Bytes,
        metadata: Option<serde_json::Value>,
    ) -> Result<DeduplicationResult> {
        let size = data.len() as u64;
        let metadata = metadata.map(|m| m.to_string());

        let outcome = self
            .retry_conflicts(|| {
                self.index
                    .lookup_or_create(hash, size, metadata.clone(), Utc::now())
            })
            .await?;

        if !outcome.created {
            self.stats.record_duplicate(size);
            debug!(
                chunk_id,
                %hash,
                reference_count = outcome.reference_count,
                revived = outcome.revived,
                "duplicate chunk"
            );
            return Ok(DeduplicationResult {
                chunk_id: chunk_id.to_string(),
                hash,
                is_duplicate: true,
                stored_size: 0,
                logical_size: size,
                reference_count: outcome.reference_count,
            });
        }

        let pending = PendingWrite {
            index: &self.index,
            hash,
            armed: true,
        };
        self.store.put(&hash, data).await?;
        self.index.commit(&hash)?;
        pending.committed();

        self.stats.record_unique(size);
        debug!(chunk_id, %hash, size, "new chunk stored");
        Ok(DeduplicationResult {
            chunk_id: chunk_id.to_string(),
            hash,
            is_duplicate: false,
            stored_size: size,
            logical_size: size,
            reference_count: outcome.reference_count,
        })
    }

    /// Read a chunk's payload and record the access.
    #[instrument(skip_all, fields(hash = %hash))]
    pub async fn get_chunk(&self, hash: &ChunkHash) -> Result<Bytes> {
        if self.index.touch(hash, Utc::now()).is_none() {
            return Err(DedupError::NotFound { hash: *hash });
        }
        self.store.get(hash).await
    }

    /// Drop one reference. Physical removal is left to the reaper.
    #[instrument(skip_all, fields(hash = %hash))]
    pub async fn delete_chunk(&self, hash: &ChunkHash) -> Result<bool> {
        let update = self
            .retry_conflicts(|| self.index.decrement(hash, 1, Utc::now()))
            .await?;
        self.stats.record_released(update.size_bytes, 1);
        debug!(reference_count = update.reference_count, "reference released");
        Ok(true)
    }

    /// Add (`delta > 0`) or release (`delta < 0`) references tracked
    /// out-of-band. Returns the new count.
    #[instrument(skip_all, fields(hash = %hash, delta = delta))]
    pub async fn update_reference_count(&self, hash: &ChunkHash, delta: i64) -> Result<u64> {
        if delta == 0 {
            return self
                .index
                .get(hash)
                .filter(|e| matches!(e.state, EntryState::Active | EntryState::Tombstoned))
                .map(|e| e.reference_count)
                .ok_or(DedupError::NotFound { hash: *hash });
        }

        let amount = delta.unsigned_abs();
        let update = if delta > 0 {
            let update = self
                .retry_conflicts(|| self.index.increment(hash, amount, Utc::now()))
                .await?;
            self.stats.record_referenced(update.size_bytes, amount);
            update
        } else {
            let update = self
                .retry_conflicts(|| self.index.decrement(hash, amount, Utc::now()))
                .await?;
            self.stats.record_released(update.size_bytes, amount);
            update
        };
        debug!(delta, reference_count = update.reference_count, "reference count updated");
        Ok(update.reference_count)
    }

    /// Current storage counters.
    pub fn get_stats(&self) -> StorageStats {
        self.stats.snapshot()
    }

    /// Read-only copy of the index entry for `hash`.
    pub fn entry(&self, hash: &ChunkHash) -> Option<ReferenceEntry> {
        self.index.get(hash)
    }

    /// Query the backend and report worker liveness.
    pub async fn health(&self) -> HealthReport {
        let size = self.store.size_bytes().await;
        let (backend_bytes, error) = match size {
            Ok(bytes) => (Some(bytes), None),
            Err(e) => (None, Some(e.to_string())),
        };
        HealthReport {
            healthy: error.is_none(),
            backend: self.store.backend().name().to_string(),
            backend_bytes,
            error,
            index_entries: self.index.len(),
            reaper_running: self.workers.reaper.load(Ordering::SeqCst),
            compactor_running: self.workers.compactor.load(Ordering::SeqCst),
            stats: self.stats.snapshot(),
        }
    }

    /// Chunk an in-memory stream and submit every chunk.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn ingest(&self, stream_id: &str, data: &[u8]) -> Result<IngestReport> {
        let mut report = IngestReport::new(stream_id);
        for (i, chunk) in self.splitter.chunks(data).enumerate() {
            let result = self.submit_chunk(stream_id, i, chunk).await?;
            report.push(result.0, result.1);
        }
        info!(
            stream_id,
            chunks = report.chunks.len(),
            duplicates = report.duplicate_chunks,
            stored_bytes = report.stored_bytes,
            "stream ingested"
        );
        Ok(report)
    }

    /// Chunk a reader and submit every chunk. The reader is consumed on the
    /// calling task.
    #[instrument(skip(self, reader))]
    pub async fn ingest_reader<R: Read>(&self, stream_id: &str, reader: R) -> Result<IngestReport> {
        let mut report = IngestReport::new(stream_id);
        for (i, chunk) in self.splitter.stream(reader).enumerate() {
            let result = self.submit_chunk(stream_id, i, chunk?).await?;
            report.push(result.0, result.1);
        }
        info!(
            stream_id,
            chunks = report.chunks.len(),
            duplicates = report.duplicate_chunks,
            stored_bytes = report.stored_bytes,
            "stream ingested"
        );
        Ok(report)
    }

    async fn submit_chunk(
        &self,
        stream_id: &str,
        index: usize,
        chunk: Chunk,
    ) -> Result<(u64, DeduplicationResult)> {
        self.check_chunk(&chunk.data)?;
        let chunk_id = format!("{}:{}", stream_id, index);
        let result = self
            .process_hashed(&chunk_id, chunk.hash, chunk.data, None)
            .await?;
        Ok((chunk.offset, result))
    }

    /// Run one reap cycle now. Normally driven by the background reaper.
    pub async fn cleanup_expired_chunks(&self) -> ReapStats {
        self.reap_expired(Utc::now(), None).await
    }

    pub(crate) async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> ReapStats {
        reaper::reap_cycle(
            &self.index,
            &self.store,
            &self.stats,
            &self.policy,
            now,
            shutdown,
        )
        .await
    }

    /// Rewrite the backend without dead payloads. Runs are serialized.
    pub async fn compact_storage(&self) -> Result<CompactionReport> {
        self.compact_at(Utc::now()).await
    }

    pub(crate) async fn compact_at(&self, now: DateTime<Utc>) -> Result<CompactionReport> {
        let _running = self.compaction.lock().await;
        let report =
            compactor::compact(&self.index, &self.store, &self.stats, &self.policy, now).await?;
        info!(
            bytes_reclaimed = report.bytes_reclaimed,
            entries_removed = report.entries_removed,
            records_dropped = report.records_dropped,
            "compaction complete"
        );
        Ok(report)
    }

    /// Journal every settled index change from now on.
    pub(crate) fn attach_journal(&self, journal: Arc<IndexJournal>) {
        if !self.index.attach_journal(journal) {
            warn!("index journal already attached");
        }
    }

    /// Save an index snapshot and drop the journal records it covers.
    /// Does nothing without `index_path`. Runs are serialized.
    pub async fn checkpoint_index(&self) -> Result<()> {
        let Some(path) = self.config.index_path.clone() else {
            return Ok(());
        };
        let _running = self.checkpoint.lock().await;

        // Read before the snapshot: every record below `mark` is already
        // applied to the entries the snapshot copies.
        let journal = self.index.journal().cloned();
        let mark = journal.as_ref().map(|j| j.next_seq()).unwrap_or(0);
        let snapshot = IndexSnapshot::new(self.config.hash_algorithm, self.index.snapshot())
            .covering_journal_until(mark);
        let entries = snapshot.entries.len();

        tokio::task::spawn_blocking(move || {
            persist::save_snapshot(&path, &snapshot)?;
            match journal {
                Some(journal) => journal.truncate_before(mark),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| DedupError::Persistence(format!("checkpoint task failed: {}", e)))??;

        debug!(entries, journal_seq = mark, "index checkpoint written");
        Ok(())
    }

    /// Load persisted entries, drop the ones whose payload is missing from the
    /// store, and rebuild the counters. Returns `(loaded, dropped)`.
    pub(crate) async fn restore_index(&self, entries: Vec<ReferenceEntry>) -> Result<(usize, usize)> {
        let loaded = self.index.restore(entries);
        let mut dropped = 0usize;
        for entry in self.index.snapshot() {
            if !self.store.contains(&entry.hash).await? {
                warn!(hash = %entry.hash, "indexed chunk missing from store, dropping entry");
                self.index.forget(&entry.hash);
                dropped += 1;
            }
        }
        self.stats.rebuild(&self.index.snapshot());
        Ok((loaded - dropped, dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;
    use crate::store::{FaultyBackend, MemoryBackend};
    use std::time::Duration;

    fn test_config() -> DedupConfig {
        let mut config = DedupConfig::with_grace_period(Duration::from_secs(60));
        config.retry = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        config
    }

    fn engine() -> DedupEngine {
        DedupEngine::new(test_config(), Arc::new(MemoryBackend::new())).unwrap()
    }

    fn faulty_engine() -> (DedupEngine, Arc<FaultyBackend>) {
        let faulty = Arc::new(FaultyBackend::new(Arc::new(MemoryBackend::new())));
        let engine = DedupEngine::new(test_config(), faulty.clone()).unwrap();
        (engine, faulty)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn test_duplicate_submission() {
        let engine = engine();
        let data = Bytes::from_static(b"some chunk payload");

        let first = engine.process_chunk("a", data.clone(), None).await.unwrap();
        assert!(!first.is_duplicate);
        assert_eq!(first.stored_size, 18);
        assert_eq!(first.logical_size, 18);
        assert_eq!(first.hash, blake3_hash(&data));

        let second = engine.process_chunk("b", data, None).await.unwrap();
        assert!(second.is_duplicate);
        assert_eq!(second.stored_size, 0);
        assert_eq!(second.logical_size, 18);
        assert_eq!(second.reference_count, 2);
        assert_eq!(second.chunk_id, "b");

        let stats = engine.get_stats();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.unique_bytes, 18);
        assert_eq!(stats.logical_bytes, 36);
        assert!((stats.dedup_ratio - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_index() {
        let engine = engine();
        assert!(matches!(
            engine.process_chunk("empty", Bytes::new(), None).await,
            Err(DedupError::InvalidInput { .. })
        ));
        let oversized = Bytes::from(vec![0u8; engine.config().max_chunk_size + 1]);
        assert!(matches!(
            engine.process_chunk("big", oversized, None).await,
            Err(DedupError::InvalidInput { .. })
        ));
        assert_eq!(engine.health().await.index_entries, 0);
    }

    #[tokio::test]
    async fn test_put_failure_rolls_back() {
        let (engine, faulty) = faulty_engine();
        faulty.fail_puts_permanently(true);
        let data = Bytes::from_static(b"doomed");
        let hash = blake3_hash(&data);

        let err = engine.process_chunk("x", data.clone(), None).await.unwrap_err();
        assert!(matches!(err, DedupError::StorageBackend { op: "put", .. }));
        assert!(engine.entry(&hash).is_none());
        assert_eq!(engine.get_stats().total_chunks, 0);

        faulty.fail_puts_permanently(false);
        let retry = engine.process_chunk("x", data, None).await.unwrap();
        assert!(!retry.is_duplicate);
        assert_eq!(retry.reference_count, 1);
    }

    #[tokio::test]
    async fn test_transient_put_failure_retried() {
        let (engine, faulty) = faulty_engine();
        faulty.fail_next_puts(2);
        let result = engine
            .process_chunk("x", Bytes::from_static(b"flaky"), None)
            .await
            .unwrap();
        assert!(!result.is_duplicate);
        assert_eq!(engine.get_chunk(&result.hash).await.unwrap(), "flaky");
    }

    #[tokio::test]
    async fn test_get_chunk_records_access() {
        let engine = engine();
        let result = engine
            .process_chunk("x", Bytes::from_static(b"read me"), None)
            .await
            .unwrap();
        let before = engine.entry(&result.hash).unwrap().last_accessed_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(engine.get_chunk(&result.hash).await.unwrap(), "read me");
        assert!(engine.entry(&result.hash).unwrap().last_accessed_at > before);
    }

    #[tokio::test]
    async fn test_delete_and_underflow() {
        let engine = engine();
        let data = Bytes::from_static(b"twice");
        let hash = engine.process_chunk("1", data.clone(), None).await.unwrap().hash;
        engine.process_chunk("2", data, None).await.unwrap();

        assert!(engine.delete_chunk(&hash).await.unwrap());
        assert!(engine.delete_chunk(&hash).await.unwrap());
        assert!(matches!(
            engine.delete_chunk(&hash).await,
            Err(DedupError::ReferenceUnderflow { current: 0, .. })
        ));
        let entry = engine.entry(&hash).unwrap();
        assert_eq!(entry.reference_count, 0);
        assert_eq!(entry.state, EntryState::Tombstoned);
        // tombstoned payload stays readable until reaped
        assert_eq!(engine.get_chunk(&hash).await.unwrap(), "twice");
        assert_eq!(engine.get_stats().logical_bytes, 0);
    }

    #[tokio::test]
    async fn test_unknown_hash_not_found() {
        let engine = engine();
        let hash = blake3_hash(b"never submitted");
        assert!(matches!(
            engine.get_chunk(&hash).await,
            Err(DedupError::NotFound { .. })
        ));
        assert!(matches!(
            engine.delete_chunk(&hash).await,
            Err(DedupError::NotFound { .. })
        ));
        assert!(matches!(
            engine.update_reference_count(&hash, 1).await,
            Err(DedupError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_reference_count() {
        let engine = engine();
        let hash = engine
            .process_chunk("x", Bytes::from_static(b"shared"), None)
            .await
            .unwrap()
            .hash;

        assert_eq!(engine.update_reference_count(&hash, 4).await.unwrap(), 5);
        assert_eq!(engine.update_reference_count(&hash, 0).await.unwrap(), 5);
        assert_eq!(engine.update_reference_count(&hash, -3).await.unwrap(), 2);
        assert!(matches!(
            engine.update_reference_count(&hash, -3).await,
            Err(DedupError::ReferenceUnderflow {
                current: 2,
                requested: 3,
                ..
            })
        ));
        assert_eq!(engine.get_stats().logical_bytes, 12);
    }

    #[tokio::test]
    async fn test_metadata_kept_from_first_submission() {
        let engine = engine();
        let data = Bytes::from_static(b"with metadata");
        let hash = engine
            .process_chunk("x", data.clone(), Some(serde_json::json!({"backup": "nightly"})))
            .await
            .unwrap()
            .hash;
        engine
            .process_chunk("y", data, Some(serde_json::json!({"backup": "weekly"})))
            .await
            .unwrap();
        let meta = engine.entry(&hash).unwrap().metadata.unwrap();
        let value: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(value["backup"], "nightly");
    }

    #[tokio::test]
    async fn test_reaped_chunk_is_gone_and_resubmittable() {
        let engine = engine();
        let data = Bytes::from_static(b"short lived");
        let hash = engine.process_chunk("x", data.clone(), None).await.unwrap().hash;
        engine.delete_chunk(&hash).await.unwrap();

        let early = engine.reap_expired(t(30), None).await;
        assert_eq!(early.reaped, 0);

        let cycle = engine.reap_expired(t(61), None).await;
        assert_eq!(cycle.reaped, 1);
        assert!(engine.entry(&hash).is_none());
        assert!(matches!(
            engine.get_chunk(&hash).await,
            Err(DedupError::NotFound { .. })
        ));

        let again = engine.process_chunk("y", data, None).await.unwrap();
        assert!(!again.is_duplicate);
    }

    #[tokio::test]
    async fn test_concurrent_identical_submissions() {
        let (engine, faulty) = faulty_engine();
        faulty.set_put_delay(Duration::from_millis(20));
        let engine = Arc::new(engine);
        let data = Bytes::from(vec![7u8; 4096]);

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let data = data.clone();
                tokio::spawn(async move {
                    engine.process_chunk(&format!("c{}", i), data, None).await
                })
            })
            .collect();

        let mut fresh = 0;
        let mut duplicates = 0;
        for h in handles {
            let result = h.await.unwrap().unwrap();
            if result.is_duplicate {
                duplicates += 1;
            } else {
                fresh += 1;
            }
        }
        assert_eq!((fresh, duplicates), (1, 1));
        let hash = blake3_hash(&data);
        assert_eq!(engine.entry(&hash).unwrap().reference_count, 2);
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let faulty = Arc::new(FaultyBackend::new(Arc::new(MemoryBackend::new())));
        faulty.set_put_delay(Duration::from_millis(500));
        let mut config = test_config();
        config.conflict_retries = Some(1);
        let engine = Arc::new(DedupEngine::new(config, faulty).unwrap());
        let data = Bytes::from_static(b"slow write");

        let owner = {
            let engine = Arc::clone(&engine);
            let data = data.clone();
            tokio::spawn(async move { engine.process_chunk("owner", data, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = engine.process_chunk("late", data, None).await.unwrap_err();
        assert!(matches!(
            err,
            DedupError::ConcurrentModificationConflict { attempts: 2, .. }
        ));
        assert!(!owner.await.unwrap().unwrap().is_duplicate);
    }

    #[tokio::test]
    async fn test_duplicate_outwaits_slow_first_write() {
        let faulty = Arc::new(FaultyBackend::new(Arc::new(MemoryBackend::new())));
        faulty.set_put_delay(Duration::from_millis(200));
        let mut config = test_config();
        config.store_timeout_ms = 300;
        config.retry.max_retries = 0;
        let engine = Arc::new(DedupEngine::new(config, faulty).unwrap());
        let data = Bytes::from_static(b"slow but fine");

        let owner = {
            let engine = Arc::clone(&engine);
            let data = data.clone();
            tokio::spawn(async move { engine.process_chunk("owner", data, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let late = engine.process_chunk("late", data, None).await.unwrap();
        assert!(late.is_duplicate);
        assert!(!owner.await.unwrap().unwrap().is_duplicate);
        assert_eq!(engine.entry(&late.hash).unwrap().reference_count, 2);
    }

    #[tokio::test]
    async fn test_saturated_reference_count() {
        let engine = engine();
        let data = Bytes::from_static(b"everyone wants this");
        let hash = engine.process_chunk("x", data.clone(), None).await.unwrap().hash;

        engine.update_reference_count(&hash, i64::MAX).await.unwrap();
        assert_eq!(
            engine.update_reference_count(&hash, i64::MAX).await.unwrap(),
            u64::MAX
        );
        let logical = engine.get_stats().logical_bytes;

        assert!(matches!(
            engine.process_chunk("y", data, None).await,
            Err(DedupError::InvalidInput { .. })
        ));
        assert!(matches!(
            engine.update_reference_count(&hash, 1).await,
            Err(DedupError::InvalidInput { .. })
        ));
        let entry = engine.entry(&hash).unwrap();
        assert_eq!(entry.reference_count, u64::MAX);
        assert_eq!(entry.state, EntryState::Active);
        assert_eq!(engine.get_stats().logical_bytes, logical);
    }

    #[tokio::test]
    async fn test_ingest_assigns_stream_ids() {
        let engine = engine();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();

        let report = engine.ingest("backup-1", &data).await.unwrap();
        assert!(report.chunks.len() > 1);
        assert_eq!(report.logical_bytes, data.len() as u64);
        assert_eq!(report.chunks[0].result.chunk_id, "backup-1:0");
        assert_eq!(report.chunks[0].offset, 0);

        let again = engine
            .ingest_reader("backup-2", std::io::Cursor::new(data.clone()))
            .await
            .unwrap();
        assert_eq!(again.chunks.len(), report.chunks.len());
        assert_eq!(again.duplicate_chunks, report.chunks.len());
        assert_eq!(again.stored_bytes, 0);
    }

    #[tokio::test]
    async fn test_health_reports_backend() {
        let engine = engine();
        engine
            .process_chunk("x", Bytes::from_static(b"healthy"), None)
            .await
            .unwrap();
        let health = engine.health().await;
        assert!(health.healthy);
        assert_eq!(health.backend, "memory");
        assert_eq!(health.backend_bytes, Some(7));
        assert_eq!(health.index_entries, 1);
        assert!(!health.reaper_running);
    }

    #[tokio::test]
    async fn test_restore_drops_entries_without_payload() {
        let backend = Arc::new(MemoryBackend::new());
        let first = DedupEngine::new(test_config(), backend.clone()).unwrap();
        let kept = first
            .process_chunk("a", Bytes::from_static(b"kept"), None)
            .await
            .unwrap()
            .hash;
        let lost = first
            .process_chunk("b", Bytes::from_static(b"lost"), None)
            .await
            .unwrap()
            .hash;
        let snapshot = first.index.snapshot();
        backend.delete(&lost).await.unwrap();

        let second = DedupEngine::new(test_config(), backend).unwrap();
        let (loaded, dropped) = second.restore_index(snapshot).await.unwrap();
        assert_eq!((loaded, dropped), (1, 1));
        assert!(second.entry(&kept).is_some());
        assert!(second.entry(&lost).is_none());
        assert_eq!(second.get_stats().unique_bytes, 4);
    }
}
