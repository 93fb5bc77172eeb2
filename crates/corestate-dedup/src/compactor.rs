//! Compactor: rewrites the chunk store without dead payloads.
//!
//! The rewrite keeps every hash present in the index at snapshot time plus
//! anything the backend accepted after the watermark read that precedes the
//! snapshot. Grace-expired tombstones are claimed first and left out, then
//! removed from the index once the new image is in place. Payloads the index
//! does not know about at all (left behind by a crash between a put and an
//! index save) are dropped as well.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::DedupEngine;
use crate::error::Result;
use crate::fingerprint::ChunkHash;
use crate::index::{ReapClaim, ReferenceIndex};
use crate::reaper::{ClaimGuard, ReapPolicy};
use crate::stats::StatsAggregator;
use crate::store::{ChunkStore, RewritePlan};

/// Outcome of one compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Backend size before the rewrite minus backend size after it.
    pub bytes_reclaimed: u64,
    /// Index entries removed along with their payloads.
    pub entries_removed: u64,
    /// Payload records left out of the new image.
    pub records_dropped: u64,
}

/// Run one compaction as of `now`.
pub(crate) async fn compact(
    index: &ReferenceIndex,
    store: &ChunkStore,
    stats: &StatsAggregator,
    policy: &ReapPolicy,
    now: DateTime<Utc>,
) -> Result<CompactionReport> {
    let watermark = store.watermark();

    let mut claims = Vec::new();
    for hash in index.expired_tombstones(policy.grace_period, now) {
        if let ReapClaim::Claimed { size_bytes } =
            index.claim_for_reap(&hash, policy.grace_period, policy.hot_access_window, now)
        {
            claims.push(ClaimGuard::new(index, hash, size_bytes));
        }
    }
    let claimed: HashSet<ChunkHash> = claims.iter().map(|g| *g.hash()).collect();

    let live: HashSet<ChunkHash> = index
        .snapshot()
        .into_iter()
        .map(|e| e.hash)
        .filter(|hash| !claimed.contains(hash))
        .collect();
    debug!(
        live = live.len(),
        claimed = claimed.len(),
        watermark,
        "compaction snapshot taken"
    );

    let plan = RewritePlan {
        live,
        retain_written_since: watermark,
    };
    // On failure the claims drop here and go back to Tombstoned.
    let rewrite = store.rewrite(&plan).await?;

    let mut entries_removed = 0u64;
    for guard in claims {
        let hash = *guard.hash();
        // Normally a no-op: the rewrite already left the payload out. A copy
        // that survives a failed delete is an orphan for the next run.
        if let Err(e) = store.delete(&hash).await {
            warn!(%hash, error = %e, "payload delete after rewrite failed");
        }
        match index.mark_removed(&hash, policy.grace_period, now) {
            Ok(_) => {
                stats.record_removed(guard.size_bytes());
                entries_removed += 1;
                guard.disarm();
            }
            Err(e) => warn!(%hash, error = %e, "entry could not be removed after rewrite"),
        }
    }

    let report = CompactionReport {
        bytes_reclaimed: rewrite.bytes_reclaimed(),
        entries_removed,
        records_dropped: rewrite.records_dropped as u64,
    };
    stats.record_compaction(report.bytes_reclaimed);
    Ok(report)
}

/// Background loop: compact every `interval` until shutdown.
pub(crate) async fn run_compactor(
    engine: Arc<DedupEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    engine.workers().set_compactor_running(true);
    info!(?interval, "periodic compactor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.compact_storage().await {
                    Ok(report) => info!(
                        bytes_reclaimed = report.bytes_reclaimed,
                        entries_removed = report.entries_removed,
                        "periodic compaction complete"
                    ),
                    Err(e) => warn!(error = %e, "periodic compaction failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    engine.workers().set_compactor_running(false);
    info!("periodic compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;
    use crate::index::EntryState;
    use crate::retry::RetryConfig;
    use crate::store::{ChunkBackend, FaultyBackend, MemoryBackend};
    use bytes::Bytes;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn policy() -> ReapPolicy {
        ReapPolicy {
            grace_period: Duration::from_secs(60),
            hot_access_window: Duration::ZERO,
        }
    }

    fn store_over(backend: Arc<dyn ChunkBackend>) -> ChunkStore {
        ChunkStore::new(
            backend,
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            Duration::from_secs(1),
        )
    }

    async fn stored(index: &ReferenceIndex, store: &ChunkStore, data: Vec<u8>) -> ChunkHash {
        let hash = blake3_hash(&data);
        index
            .lookup_or_create(hash, data.len() as u64, None, t(0))
            .unwrap();
        store.put(&hash, Bytes::from(data)).await.unwrap();
        index.commit(&hash).unwrap();
        hash
    }

    #[tokio::test]
    async fn test_compaction_keeps_live_and_drops_expired() {
        let index = ReferenceIndex::new();
        let store = store_over(Arc::new(MemoryBackend::new()));
        let stats = StatsAggregator::new();

        let live = stored(&index, &store, vec![1u8; 4000]).await;
        let in_grace = stored(&index, &store, vec![2u8; 3000]).await;
        let expired = stored(&index, &store, vec![3u8; 2000]).await;
        index.decrement(&in_grace, 1, t(50)).unwrap();
        index.decrement(&expired, 1, t(0)).unwrap();

        let report = compact(&index, &store, &stats, &policy(), t(61)).await.unwrap();
        assert_eq!(report.bytes_reclaimed, 2000);
        assert_eq!(report.entries_removed, 1);

        assert!(store.contains(&live).await.unwrap());
        assert!(store.contains(&in_grace).await.unwrap());
        assert!(!store.contains(&expired).await.unwrap());
        assert!(index.get(&expired).is_none());
        assert_eq!(index.get(&in_grace).unwrap().state, EntryState::Tombstoned);
        assert_eq!(stats.snapshot().reclaimed_bytes_last_compaction, 2000);
    }

    #[tokio::test]
    async fn test_compaction_drops_orphans() {
        let index = ReferenceIndex::new();
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        let stats = StatsAggregator::new();

        let orphan = blake3_hash(b"orphan");
        store.put(&orphan, Bytes::from_static(b"orphan")).await.unwrap();
        let live = stored(&index, &store, vec![9u8; 100]).await;

        let report = compact(&index, &store, &stats, &policy(), t(0)).await.unwrap();
        assert_eq!(report.records_dropped, 1);
        assert_eq!(report.bytes_reclaimed, 6);
        assert!(!backend.contains(&orphan).await.unwrap());
        assert!(backend.contains(&live).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_space_reclaimed() {
        let index = ReferenceIndex::new();
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        let stats = StatsAggregator::new();

        let gone = stored(&index, &store, vec![4u8; 1000]).await;
        index.decrement(&gone, 1, t(0)).unwrap();
        // reaper already removed it physically; only dead space remains
        index.claim_for_reap(&gone, Duration::ZERO, Duration::ZERO, t(100));
        store.delete(&gone).await.unwrap();
        index.mark_removed(&gone, Duration::ZERO, t(100)).unwrap();
        assert_eq!(backend.dead_bytes(), 1000);

        let report = compact(&index, &store, &stats, &policy(), t(100)).await.unwrap();
        assert_eq!(report.bytes_reclaimed, 1000);
        assert_eq!(report.entries_removed, 0);
        assert_eq!(backend.size_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_rewrite_keeps_claims_until_done() {
        let index = ReferenceIndex::new();
        let faulty = Arc::new(FaultyBackend::new(Arc::new(MemoryBackend::new())));
        let store = ChunkStore::new(
            faulty.clone(),
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            Duration::from_millis(10),
        );
        let stats = StatsAggregator::new();

        let expired = stored(&index, &store, vec![6u8; 700]).await;
        index.decrement(&expired, 1, t(0)).unwrap();

        faulty.set_mutation_delay(Duration::from_millis(50));
        let report = compact(&index, &store, &stats, &policy(), t(61)).await.unwrap();
        assert_eq!(report.entries_removed, 1);
        assert!(index.get(&expired).is_none());
        assert!(!faulty.contains(&expired).await.unwrap());

        // a resubmission after the swap is stored afresh
        let again = blake3_hash(&[6u8; 700]);
        let outcome = index.lookup_or_create(again, 700, None, t(62)).unwrap();
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn test_failed_rewrite_releases_claims() {
        let index = ReferenceIndex::new();
        let faulty = Arc::new(FaultyBackend::new(Arc::new(MemoryBackend::new())));
        let store = store_over(faulty.clone());
        let stats = StatsAggregator::new();

        let expired = stored(&index, &store, vec![5u8; 500]).await;
        index.decrement(&expired, 1, t(0)).unwrap();

        faulty.fail_next_rewrites(1);
        assert!(compact(&index, &store, &stats, &policy(), t(61)).await.is_err());
        assert_eq!(index.get(&expired).unwrap().state, EntryState::Tombstoned);
        assert!(store.contains(&expired).await.unwrap());
    }
}
