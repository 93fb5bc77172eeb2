//! Running storage counters and the dedup ratio.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::index::{EntryState, ReferenceEntry};

/// Point-in-time storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Distinct chunks held (tombstoned but not yet reaped included).
    pub total_chunks: u64,
    /// Sum of distinct stored payload sizes.
    pub unique_bytes: u64,
    /// Sum over all logical references: what would be stored without dedup.
    pub logical_bytes: u64,
    /// `1 - unique_bytes / logical_bytes`; 0 when nothing is referenced.
    pub dedup_ratio: f64,
    /// Backend bytes returned by the most recent compaction.
    pub reclaimed_bytes_last_compaction: u64,
    /// Chunks submitted through `process_chunk`.
    pub chunks_processed: u64,
    /// Submissions that matched an existing chunk.
    pub duplicate_chunks: u64,
    /// Entries physically removed by the reaper or compactor.
    pub entries_reaped: u64,
    /// Completed compaction runs.
    pub compactions: u64,
}

/// Compute `1 - unique/logical`, clamped to `[0, 1]`.
pub fn dedup_ratio(unique_bytes: u64, logical_bytes: u64) -> f64 {
    if logical_bytes == 0 {
        return 0.0;
    }
    (1.0 - unique_bytes as f64 / logical_bytes as f64).clamp(0.0, 1.0)
}

fn saturating_sub(counter: &AtomicU64, amount: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(amount))
    });
}

fn saturating_add(counter: &AtomicU64, amount: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_add(amount))
    });
}

/// Lock-free counters updated by the engine on every index transition.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    total_chunks: AtomicU64,
    unique_bytes: AtomicU64,
    logical_bytes: AtomicU64,
    reclaimed_last_compaction: AtomicU64,
    chunks_processed: AtomicU64,
    duplicate_chunks: AtomicU64,
    entries_reaped: AtomicU64,
    compactions: AtomicU64,
}

impl StatsAggregator {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new chunk was stored.
    pub fn record_unique(&self, size: u64) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.total_chunks.fetch_add(1, Ordering::Relaxed);
        self.unique_bytes.fetch_add(size, Ordering::Relaxed);
        saturating_add(&self.logical_bytes, size);
    }

    /// A submission matched an existing chunk.
    pub fn record_duplicate(&self, size: u64) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.duplicate_chunks.fetch_add(1, Ordering::Relaxed);
        saturating_add(&self.logical_bytes, size);
    }

    /// `references` logical references were added out-of-band.
    pub fn record_referenced(&self, size: u64, references: u64) {
        saturating_add(&self.logical_bytes, size.saturating_mul(references));
    }

    /// `references` logical references were released.
    pub fn record_released(&self, size: u64, references: u64) {
        saturating_sub(&self.logical_bytes, size.saturating_mul(references));
    }

    /// A chunk was physically removed.
    pub fn record_removed(&self, size: u64) {
        saturating_sub(&self.total_chunks, 1);
        saturating_sub(&self.unique_bytes, size);
        self.entries_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// A compaction finished.
    pub fn record_compaction(&self, bytes_reclaimed: u64) {
        self.reclaimed_last_compaction
            .store(bytes_reclaimed, Ordering::Relaxed);
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the content counters from index entries, e.g. after a reload.
    /// Operational counters (processed, duplicates, ...) are left alone.
    pub fn rebuild<'a>(&self, entries: impl IntoIterator<Item = &'a ReferenceEntry>) {
        let mut total = 0u64;
        let mut unique = 0u64;
        let mut logical = 0u64;
        for entry in entries {
            if matches!(entry.state, EntryState::Active | EntryState::Tombstoned) {
                total += 1;
                unique += entry.size_bytes;
                logical += entry.size_bytes.saturating_mul(entry.reference_count);
            }
        }
        self.total_chunks.store(total, Ordering::Relaxed);
        self.unique_bytes.store(unique, Ordering::Relaxed);
        self.logical_bytes.store(logical, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> StorageStats {
        let unique_bytes = self.unique_bytes.load(Ordering::Relaxed);
        let logical_bytes = self.logical_bytes.load(Ordering::Relaxed);
        StorageStats {
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            unique_bytes,
            logical_bytes,
            dedup_ratio: dedup_ratio(unique_bytes, logical_bytes),
            reclaimed_bytes_last_compaction: self.reclaimed_last_compaction.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            duplicate_chunks: self.duplicate_chunks.load(Ordering::Relaxed),
            entries_reaped: self.entries_reaped.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}
