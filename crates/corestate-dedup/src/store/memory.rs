//! In-process chunk backend.
//!
//! Models a log-structured medium: deletes leave dead space behind that only
//! a rewrite gives back, so compaction is observable in `size_bytes`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{ChunkBackend, RewritePlan, RewriteReport};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::ChunkHash;

#[derive(Debug, Clone)]
struct Record {
    data: Bytes,
    seq: u64,
}

#[derive(Debug, Default)]
struct Image {
    records: HashMap<ChunkHash, Record>,
    live_bytes: u64,
    dead_bytes: u64,
}

/// Memory-resident backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    image: RwLock<Image>,
    next_seq: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads currently held.
    pub fn len(&self) -> usize {
        self.image.read().records.len()
    }

    /// True if no payloads are held.
    pub fn is_empty(&self) -> bool {
        self.image.read().records.is_empty()
    }

    /// Bytes occupied by deleted payloads awaiting a rewrite.
    pub fn dead_bytes(&self) -> u64 {
        self.image.read().dead_bytes
    }
}

#[async_trait]
impl ChunkBackend for MemoryBackend {
    async fn put(&self, hash: &ChunkHash, data: Bytes) -> StoreResult<()> {
        let mut image = self.image.write();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if let Some(existing) = image.records.get_mut(hash) {
            existing.seq = seq;
            return Ok(());
        }
        image.live_bytes += data.len() as u64;
        image.records.insert(*hash, Record { data, seq });
        Ok(())
    }

    async fn get(&self, hash: &ChunkHash) -> StoreResult<Bytes> {
        self.image
            .read()
            .records
            .get(hash)
            .map(|r| r.data.clone())
            .ok_or(StoreError::NotFound(*hash))
    }

    async fn delete(&self, hash: &ChunkHash) -> StoreResult<bool> {
        let mut image = self.image.write();
        match image.records.remove(hash) {
            Some(record) => {
                let len = record.data.len() as u64;
                image.live_bytes -= len;
                image.dead_bytes += len;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn contains(&self, hash: &ChunkHash) -> StoreResult<bool> {
        Ok(self.image.read().records.contains_key(hash))
    }

    fn watermark(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    async fn rewrite(&self, plan: &RewritePlan) -> StoreResult<RewriteReport> {
        let mut image = self.image.write();
        let bytes_before = image.live_bytes + image.dead_bytes;

        let mut fresh = Image::default();
        let mut records_dropped = 0usize;
        for (hash, record) in image.records.iter() {
            if plan.retains(hash, record.seq) {
                fresh.live_bytes += record.data.len() as u64;
                fresh.records.insert(*hash, record.clone());
            } else {
                records_dropped += 1;
            }
        }

        let bytes_after = fresh.live_bytes;
        *image = fresh;
        Ok(RewriteReport {
            bytes_before,
            bytes_after,
            records_dropped,
        })
    }

    async fn size_bytes(&self) -> StoreResult<u64> {
        let image = self.image.read();
        Ok(image.live_bytes + image.dead_bytes)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
