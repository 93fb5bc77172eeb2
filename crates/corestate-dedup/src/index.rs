//! Reference index: content address → reference count and lifecycle timestamps.
//!
//! The index is a sharded concurrent map. Every operation on a key runs under
//! that key's shard lock, so operations on the same hash are serialized while
//! distinct hashes proceed in parallel. No operation here awaits or touches
//! the chunk store; callers do backend I/O between index steps.
//!
//! Entry lifecycle:
//!
//! ```text
//!   lookup_or_create        commit           decrement to 0          claim_for_reap        mark_removed
//! ─────────────────▶ Pending ─────▶ Active ─────────────────▶ Tombstoned ─────────────▶ Reaping ─────────▶ (gone)
//!                       │             ▲                           │    ▲                     │
//!                       │ rollback    └──── increment / dedup ────┘    └── release_claim ────┘
//!                       ▼
//!                    (gone)
//! ```
//!
//! `Pending` and `Reaping` are transitional: the payload write or the physical
//! delete is in flight. Operations that would change the count of a
//! transitional entry report `ConcurrentModificationConflict` so the caller can
//! back off and retry once the transition settles.
//!
//! With a journal attached, every settled change is appended under the key
//! lock before it is applied; a failed append leaves the entry unchanged.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{DedupError, Result};
use crate::fingerprint::ChunkHash;
use crate::journal::{IndexJournal, JournalOp};

/// Lifecycle state of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Created; the payload write has not been confirmed yet.
    Pending,
    /// Stored with at least one reference.
    Active,
    /// Count reached zero; waiting out the grace period.
    Tombstoned,
    /// Claimed for physical deletion.
    Reaping,
}

/// One chunk's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    /// Content address (primary key).
    pub hash: ChunkHash,
    /// Live logical references.
    pub reference_count: u64,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// First observation of this hash.
    pub created_at: DateTime<Utc>,
    /// Last read or re-reference.
    pub last_accessed_at: DateTime<Utc>,
    /// Set when the count last reached zero.
    pub tombstoned_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: EntryState,
    /// Caller metadata from the first submission, kept as raw JSON and never interpreted.
    pub metadata: Option<String>,
}

/// Result of [`ReferenceIndex::lookup_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupOutcome {
    /// True when this call created the entry and owns the payload write.
    pub created: bool,
    /// Count after the call.
    pub reference_count: u64,
    /// Payload size recorded for the hash.
    pub size_bytes: u64,
    /// True when a tombstoned entry was brought back to life.
    pub revived: bool,
}

/// Count and size after an increment or decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountUpdate {
    /// Count after the call.
    pub reference_count: u64,
    /// Payload size recorded for the hash.
    pub size_bytes: u64,
}

/// Why [`ReferenceIndex::claim_for_reap`] left an entry alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapSkip {
    /// Entry no longer exists.
    Missing,
    /// Entry is referenced again or in flight.
    NotTombstoned,
    /// Grace period has not elapsed.
    InGrace,
    /// Read recently; the hot-chunk window protects it.
    Hot,
}

/// Result of a reap claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ReapClaim {
    /// The caller now owns the physical delete.
    Claimed {
        /// Payload size of the claimed entry.
        size_bytes: u64,
    },
    /// Entry left untouched.
    Skipped(ReapSkip),
}

/// Concurrent map from hash to [`ReferenceEntry`].
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    entries: DashMap<ChunkHash, ReferenceEntry>,
    journal: OnceLock<Arc<IndexJournal>>,
}

fn grace_elapsed(tombstoned_at: Option<DateTime<Utc>>, grace: Duration, now: DateTime<Utc>) -> bool {
    match (tombstoned_at, chrono::Duration::from_std(grace)) {
        (Some(t), Ok(g)) => now.signed_duration_since(t) >= g,
        _ => false,
    }
}

fn conflict(hash: ChunkHash) -> DedupError {
    DedupError::ConcurrentModificationConflict { hash, attempts: 1 }
}

fn overflow(hash: ChunkHash) -> DedupError {
    DedupError::invalid_input(format!("reference count overflow on {}", hash))
}

impl ReferenceIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start journaling settled changes. Only the first journal sticks.
    pub fn attach_journal(&self, journal: Arc<IndexJournal>) -> bool {
        self.journal.set(journal).is_ok()
    }

    /// The attached journal, if any.
    pub fn journal(&self) -> Option<&Arc<IndexJournal>> {
        self.journal.get()
    }

    /// Journal `next` and then apply it to `e`.
    fn settle(&self, e: &mut ReferenceEntry, next: ReferenceEntry) -> Result<()> {
        if let Some(journal) = self.journal.get() {
            journal.append(&JournalOp::Upsert(next.clone()))?;
        }
        *e = next;
        Ok(())
    }

    /// Atomically create the entry with count 1 (state `Pending`) or add a
    /// reference to an existing stored entry.
    ///
    /// Only the caller that sees `created == true` writes the payload, which is
    /// what keeps two concurrent submissions of the same content from both
    /// writing it.
    pub fn lookup_or_create(
        &self,
        hash: ChunkHash,
        size_bytes: u64,
        metadata: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<LookupOutcome> {
        match self.entries.entry(hash) {
            Entry::Vacant(v) => {
                v.insert(ReferenceEntry {
                    hash,
                    reference_count: 1,
                    size_bytes,
                    created_at: now,
                    last_accessed_at: now,
                    tombstoned_at: None,
                    state: EntryState::Pending,
                    metadata,
                });
                Ok(LookupOutcome {
                    created: true,
                    reference_count: 1,
                    size_bytes,
                    revived: false,
                })
            }
            Entry::Occupied(mut o) => {
                let e = o.get_mut();
                if e.size_bytes != size_bytes {
                    error!(%hash, stored = e.size_bytes, submitted = size_bytes, "content hash collision");
                    return Err(DedupError::invalid_input(format!(
                        "content hash collision on {}: stored size {} differs from submitted size {}",
                        hash, e.size_bytes, size_bytes
                    )));
                }
                match e.state {
                    EntryState::Pending | EntryState::Reaping => Err(conflict(hash)),
                    EntryState::Active => {
                        let mut next = e.clone();
                        next.reference_count = next
                            .reference_count
                            .checked_add(1)
                            .ok_or_else(|| overflow(hash))?;
                        next.last_accessed_at = now;
                        self.settle(e, next)?;
                        Ok(LookupOutcome {
                            created: false,
                            reference_count: e.reference_count,
                            size_bytes: e.size_bytes,
                            revived: false,
                        })
                    }
                    EntryState::Tombstoned => {
                        let mut next = e.clone();
                        next.reference_count = 1;
                        next.tombstoned_at = None;
                        next.state = EntryState::Active;
                        next.last_accessed_at = now;
                        self.settle(e, next)?;
                        debug!(%hash, "tombstoned entry revived");
                        Ok(LookupOutcome {
                            created: false,
                            reference_count: 1,
                            size_bytes: e.size_bytes,
                            revived: true,
                        })
                    }
                }
            }
        }
    }

    /// Confirm the payload write for a `Pending` entry.
    pub fn commit(&self, hash: &ChunkHash) -> Result<()> {
        match self.entries.get_mut(hash) {
            Some(mut e) if e.state == EntryState::Pending => {
                let mut next = e.clone();
                next.state = EntryState::Active;
                self.settle(&mut e, next)
            }
            Some(_) => Err(conflict(*hash)),
            None => Err(DedupError::NotFound { hash: *hash }),
        }
    }

    /// Drop a `Pending` entry whose payload write failed.
    ///
    /// Nobody else can hold a reference to a pending entry, so removing it
    /// outright is safe. Returns the removed entry.
    pub fn rollback(&self, hash: &ChunkHash) -> Option<ReferenceEntry> {
        self.entries
            .remove_if(hash, |_, e| e.state == EntryState::Pending)
            .map(|(_, e)| e)
    }

    /// Subtract `amount` references. Reaching zero tombstones the entry but
    /// keeps it in the index.
    pub fn decrement(&self, hash: &ChunkHash, amount: u64, now: DateTime<Utc>) -> Result<CountUpdate> {
        let mut e = self
            .entries
            .get_mut(hash)
            .ok_or(DedupError::NotFound { hash: *hash })?;
        if e.state == EntryState::Pending {
            return Err(conflict(*hash));
        }
        if amount > e.reference_count {
            return Err(DedupError::ReferenceUnderflow {
                hash: *hash,
                current: e.reference_count,
                requested: amount,
            });
        }
        if amount > 0 {
            let mut next = e.clone();
            next.reference_count -= amount;
            if next.reference_count == 0 {
                next.state = EntryState::Tombstoned;
                next.tombstoned_at = Some(now);
            }
            self.settle(&mut e, next)?;
            if e.reference_count == 0 {
                debug!(%hash, "entry tombstoned");
            }
        }
        Ok(CountUpdate {
            reference_count: e.reference_count,
            size_bytes: e.size_bytes,
        })
    }

    /// Add `amount` references to a stored entry, reviving it if tombstoned.
    pub fn increment(&self, hash: &ChunkHash, amount: u64, now: DateTime<Utc>) -> Result<CountUpdate> {
        let mut e = self
            .entries
            .get_mut(hash)
            .ok_or(DedupError::NotFound { hash: *hash })?;
        match e.state {
            EntryState::Pending | EntryState::Reaping => return Err(conflict(*hash)),
            EntryState::Active | EntryState::Tombstoned => {}
        }
        if amount > 0 {
            let new_count = e
                .reference_count
                .checked_add(amount)
                .ok_or_else(|| overflow(*hash))?;
            let mut next = e.clone();
            next.reference_count = new_count;
            next.state = EntryState::Active;
            next.tombstoned_at = None;
            next.last_accessed_at = now;
            self.settle(&mut e, next)?;
        }
        Ok(CountUpdate {
            reference_count: e.reference_count,
            size_bytes: e.size_bytes,
        })
    }

    /// Record a read. Returns the entry if its payload is readable
    /// (`Active` or `Tombstoned`), `None` otherwise.
    pub fn touch(&self, hash: &ChunkHash, now: DateTime<Utc>) -> Option<ReferenceEntry> {
        let mut e = self.entries.get_mut(hash)?;
        match e.state {
            EntryState::Active | EntryState::Tombstoned => {
                e.last_accessed_at = now;
                Some(e.value().clone())
            }
            EntryState::Pending | EntryState::Reaping => None,
        }
    }

    /// Read-only copy of one entry.
    pub fn get(&self, hash: &ChunkHash) -> Option<ReferenceEntry> {
        self.entries.get(hash).map(|e| e.value().clone())
    }

    /// Claim a tombstoned entry whose grace period has elapsed, moving it to
    /// `Reaping`. The zero count is re-checked here under the key lock, which
    /// catches a re-reference that raced with the scan that nominated the entry.
    pub fn claim_for_reap(
        &self,
        hash: &ChunkHash,
        grace: Duration,
        hot_window: Duration,
        now: DateTime<Utc>,
    ) -> ReapClaim {
        let Some(mut e) = self.entries.get_mut(hash) else {
            return ReapClaim::Skipped(ReapSkip::Missing);
        };
        if e.state != EntryState::Tombstoned || e.reference_count != 0 {
            return ReapClaim::Skipped(ReapSkip::NotTombstoned);
        }
        if !grace_elapsed(e.tombstoned_at, grace, now) {
            return ReapClaim::Skipped(ReapSkip::InGrace);
        }
        if !hot_window.is_zero() {
            if let Ok(w) = chrono::Duration::from_std(hot_window) {
                if now.signed_duration_since(e.last_accessed_at) < w {
                    return ReapClaim::Skipped(ReapSkip::Hot);
                }
            }
        }
        e.state = EntryState::Reaping;
        ReapClaim::Claimed {
            size_bytes: e.size_bytes,
        }
    }

    /// Hand a claimed entry back after its physical delete failed.
    pub fn release_claim(&self, hash: &ChunkHash) {
        if let Some(mut e) = self.entries.get_mut(hash) {
            if e.state == EntryState::Reaping {
                e.state = EntryState::Tombstoned;
            }
        }
    }

    /// Remove an entry after its payload was physically deleted.
    ///
    /// Fails unless the entry was claimed, still has a zero count, and its
    /// grace period has elapsed.
    pub fn mark_removed(
        &self,
        hash: &ChunkHash,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReferenceEntry> {
        let Entry::Occupied(o) = self.entries.entry(*hash) else {
            return Err(DedupError::NotFound { hash: *hash });
        };
        let e = o.get();
        if e.state != EntryState::Reaping
            || e.reference_count != 0
            || !grace_elapsed(e.tombstoned_at, grace, now)
        {
            return Err(conflict(*hash));
        }
        // The payload is already gone, so the entry goes too. A restart that
        // replays a journal missing this record drops the entry when it finds
        // no payload.
        if let Some(journal) = self.journal.get() {
            if let Err(err) = journal.append(&JournalOp::Remove(*hash)) {
                error!(%hash, error = %err, "index journal append failed for removal");
            }
        }
        Ok(o.remove())
    }

    /// Hashes of tombstoned entries whose grace period has elapsed.
    pub fn expired_tombstones(&self, grace: Duration, now: DateTime<Utc>) -> Vec<ChunkHash> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Tombstoned && grace_elapsed(e.tombstoned_at, grace, now))
            .map(|e| e.hash)
            .collect()
    }

    /// Copy of every entry.
    ///
    /// Each entry is copied under its own shard lock, so writers are held up
    /// only for the copy of their shard. Entries are individually consistent;
    /// the set as a whole is not a global atomic cut.
    pub fn snapshot(&self) -> Vec<ReferenceEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Load persisted entries into an empty index. Transitional states are
    /// settled: `Pending` entries are dropped and `Reaping` becomes `Tombstoned`.
    pub fn restore(&self, entries: impl IntoIterator<Item = ReferenceEntry>) -> usize {
        let mut loaded = 0;
        for mut e in entries {
            match e.state {
                EntryState::Pending => continue,
                EntryState::Reaping => e.state = EntryState::Tombstoned,
                EntryState::Active | EntryState::Tombstoned => {}
            }
            self.entries.insert(e.hash, e);
            loaded += 1;
        }
        loaded
    }

    /// Drop an entry unconditionally; only used while reconciling a restored
    /// index against the store before any traffic arrives.
    pub(crate) fn forget(&self, hash: &ChunkHash) -> Option<ReferenceEntry> {
        self.entries.remove(hash).map(|(_, e)| e)
    }

    /// Number of entries, in any state.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
