//! Expiry reaper: physically removes chunks whose reference count has stayed
//! at zero for the grace period.
//!
//! A cycle nominates expired tombstones, then for each one claims it under the
//! key lock (re-checking the zero count), deletes the payload, and removes the
//! entry. A failure on one entry is logged and the cycle moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ReaperConfig;
use crate::engine::DedupEngine;
use crate::fingerprint::ChunkHash;
use crate::index::{ReapClaim, ReferenceIndex};
use crate::stats::StatsAggregator;
use crate::store::ChunkStore;

/// Timing policy shared by the reaper and the compactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// Minimum time at zero references before removal.
    pub grace_period: Duration,
    /// Tombstoned entries read within this window are skipped; zero disables.
    pub hot_access_window: Duration,
}

impl From<&ReaperConfig> for ReapPolicy {
    fn from(config: &ReaperConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            hot_access_window: Duration::from_secs(config.hot_access_window_secs),
        }
    }
}

/// Outcome of one reap cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapStats {
    /// Expired tombstones nominated at the start of the cycle.
    pub candidates: usize,
    /// Entries physically removed.
    pub reaped: usize,
    /// Entries left alone (re-referenced, hot, or already gone).
    pub skipped: usize,
    /// Entries whose removal failed; retried next cycle.
    pub failed: usize,
    /// Payload bytes released.
    pub bytes_freed: u64,
    /// The cycle stopped early on shutdown.
    pub cancelled: bool,
}

/// Hands a reap claim back to the index unless the entry was removed.
///
/// Dropping the guard on any early exit (error, cancellation, a dropped
/// future) returns the entry to `Tombstoned`, so no entry stays `Reaping`.
pub(crate) struct ClaimGuard<'a> {
    index: &'a ReferenceIndex,
    hash: ChunkHash,
    size_bytes: u64,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    pub(crate) fn new(index: &'a ReferenceIndex, hash: ChunkHash, size_bytes: u64) -> Self {
        Self {
            index,
            hash,
            size_bytes,
            armed: true,
        }
    }

    pub(crate) fn hash(&self) -> &ChunkHash {
        &self.hash
    }

    pub(crate) fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// The entry is gone; nothing to hand back.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.index.release_claim(&self.hash);
        }
    }
}

fn shutdown_requested(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Run one reap cycle as of `now`.
pub(crate) async fn reap_cycle(
    index: &ReferenceIndex,
    store: &ChunkStore,
    stats: &StatsAggregator,
    policy: &ReapPolicy,
    now: DateTime<Utc>,
    shutdown: Option<&watch::Receiver<bool>>,
) -> ReapStats {
    let candidates = index.expired_tombstones(policy.grace_period, now);
    let mut cycle = ReapStats {
        candidates: candidates.len(),
        ..Default::default()
    };

    for hash in candidates {
        if shutdown_requested(shutdown) {
            cycle.cancelled = true;
            debug!(remaining = cycle.candidates - cycle.reaped - cycle.skipped - cycle.failed, "reap cycle cancelled");
            break;
        }

        let guard = match index.claim_for_reap(&hash, policy.grace_period, policy.hot_access_window, now) {
            ReapClaim::Claimed { size_bytes } => ClaimGuard::new(index, hash, size_bytes),
            ReapClaim::Skipped(reason) => {
                debug!(%hash, ?reason, "reap skipped");
                cycle.skipped += 1;
                continue;
            }
        };

        if let Err(e) = store.delete(guard.hash()).await {
            warn!(%hash, error = %e, "payload delete failed, entry kept for next cycle");
            cycle.failed += 1;
            continue;
        }

        match index.mark_removed(&hash, policy.grace_period, now) {
            Ok(_) => {
                stats.record_removed(guard.size_bytes());
                cycle.reaped += 1;
                cycle.bytes_freed += guard.size_bytes();
                guard.disarm();
            }
            Err(e) => {
                error!(%hash, error = %e, "payload deleted but entry could not be removed");
                cycle.failed += 1;
            }
        }
    }

    cycle
}

/// Background loop: reap on every interval tick until shutdown.
pub(crate) async fn run_reaper(engine: Arc<DedupEngine>, mut shutdown: watch::Receiver<bool>) {
    let interval = engine.config().reaper.interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let cancel = shutdown.clone();

    engine.workers().set_reaper_running(true);
    info!(?interval, "expiry reaper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cycle = engine.reap_expired(Utc::now(), Some(&cancel)).await;
                if cycle.reaped > 0 || cycle.failed > 0 {
                    info!(
                        reaped = cycle.reaped,
                        failed = cycle.failed,
                        bytes_freed = cycle.bytes_freed,
                        "reap cycle complete"
                    );
                } else {
                    debug!(candidates = cycle.candidates, "reap cycle complete");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    engine.workers().set_reaper_running(false);
    info!("expiry reaper stopped");
}
