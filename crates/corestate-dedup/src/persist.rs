//! Reference index snapshots.
//!
//! The index is saved as a single bincode file, written to a temporary
//! sibling, synced, and renamed into place. Only `Active` and `Tombstoned`
//! entries are saved: `Pending` writes were never acknowledged and `Reaping`
//! entries are either gone or go back to `Tombstoned` on load.
//!
//! A snapshot records the index journal sequence it covers; changes after
//! that are replayed from the journal on load (see [`crate::journal`]).

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::DedupEngine;
use crate::error::{DedupError, Result};
use crate::fingerprint::HashAlgorithm;
use crate::index::{EntryState, ReferenceEntry};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 2;

/// On-disk image of the reference index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Format version; see [`SNAPSHOT_VERSION`].
    pub version: u32,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Algorithm the hashes were computed with.
    pub hash_algorithm: HashAlgorithm,
    /// First journal sequence not reflected in `entries`.
    pub journal_seq: u64,
    /// Saved entries.
    pub entries: Vec<ReferenceEntry>,
}

impl IndexSnapshot {
    /// Build a snapshot from index entries, keeping only settled ones.
    pub fn new(hash_algorithm: HashAlgorithm, entries: Vec<ReferenceEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter_map(|mut e| match e.state {
                EntryState::Active | EntryState::Tombstoned => Some(e),
                EntryState::Reaping => {
                    e.state = EntryState::Tombstoned;
                    Some(e)
                }
                EntryState::Pending => None,
            })
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            hash_algorithm,
            journal_seq: 0,
            entries,
        }
    }

    /// Mark the journal records this snapshot already covers.
    pub fn covering_journal_until(mut self, seq: u64) -> Self {
        self.journal_seq = seq;
        self
    }
}

/// Write `snapshot` to `path` atomically.
pub fn save_snapshot(path: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    let encoded = bincode::serialize(snapshot)
        .map_err(|e| DedupError::Persistence(format!("failed to serialize index: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&encoded)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    info!(
        path = %path.display(),
        entries = snapshot.entries.len(),
        bytes = encoded.len(),
        "index snapshot saved"
    );
    Ok(())
}

/// Read the snapshot at `path`. A missing file is `Ok(None)`.
///
/// Fails if the file is unreadable, from another format version, or was
/// written with a different hash algorithm than `expected`.
pub fn load_snapshot(path: &Path, expected: HashAlgorithm) -> Result<Option<IndexSnapshot>> {
    let contents = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no index snapshot");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let snapshot: IndexSnapshot = bincode::deserialize(&contents)
        .map_err(|e| DedupError::Persistence(format!("failed to deserialize index: {}", e)))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(DedupError::Persistence(format!(
            "unsupported index snapshot version {}",
            snapshot.version
        )));
    }
    if snapshot.hash_algorithm != expected {
        return Err(DedupError::Persistence(format!(
            "index was written with {:?} but engine uses {:?}",
            snapshot.hash_algorithm, expected
        )));
    }

    info!(
        path = %path.display(),
        entries = snapshot.entries.len(),
        saved_at = %snapshot.saved_at,
        "index snapshot loaded"
    );
    Ok(Some(snapshot))
}

/// Background loop: checkpoint the index every `interval` until shutdown.
pub(crate) async fn run_checkpointer(
    engine: Arc<DedupEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(?interval, "index checkpointer started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.checkpoint_index().await {
                    warn!(error = %e, "index checkpoint failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("index checkpointer stopped");
}
