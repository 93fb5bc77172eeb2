//! Index journal: settled index changes, appended as they happen.
//!
//! Snapshots alone lose everything since the last save when the process dies.
//! Every change that a snapshot would capture (a commit, a count change, a
//! revival, a removal) is also appended here, under the same key lock as the
//! in-memory change, so per-hash record order matches the index. Records
//! carry the entry's full resulting state, so replaying a record the snapshot
//! already reflects is harmless.
//!
//! A checkpoint saves a snapshot tagged with the journal sequence read before
//! the snapshot was taken, then drops every record below that sequence.
//!
//! File layout: `record* := len:u32le crc32:u32le bincode(JournalRecord)[len]`

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DedupError, Result};
use crate::fingerprint::ChunkHash;
use crate::index::ReferenceEntry;

const RECORD_PREFIX_LEN: usize = 8;

/// One journaled change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// The entry now looks like this.
    Upsert(ReferenceEntry),
    /// The entry and its payload are gone.
    Remove(ChunkHash),
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    seq: u64,
    op: JournalOp,
}

fn persistence(context: &str, e: impl std::fmt::Display) -> DedupError {
    DedupError::Persistence(format!("{}: {}", context, e))
}

/// Records read back from a journal file.
#[derive(Debug, Default)]
pub struct JournalReplay {
    /// Operations at or above the requested sequence, in append order.
    pub ops: Vec<JournalOp>,
    /// Sequence the next append should take.
    pub next_seq: u64,
}

impl JournalReplay {
    /// Apply the replayed operations on top of snapshot entries.
    pub fn apply_to(self, entries: Vec<ReferenceEntry>) -> Vec<ReferenceEntry> {
        let mut by_hash: HashMap<ChunkHash, ReferenceEntry> =
            entries.into_iter().map(|e| (e.hash, e)).collect();
        for op in self.ops {
            match op {
                JournalOp::Upsert(entry) => {
                    by_hash.insert(entry.hash, entry);
                }
                JournalOp::Remove(hash) => {
                    by_hash.remove(&hash);
                }
            }
        }
        by_hash.into_values().collect()
    }
}

/// Read every intact record from `path`.
///
/// A damaged or short final record is a write that never finished and is cut
/// off; damage followed by more records is an error.
fn read_records(path: &Path) -> Result<(Vec<JournalRecord>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut pos = 0u64;
    let mut prefix = [0u8; RECORD_PREFIX_LEN];
    let mut body = Vec::new();

    while total - pos >= RECORD_PREFIX_LEN as u64 {
        reader.read_exact(&mut prefix)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&prefix[..4]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&prefix[4..]);
        let len = u32::from_le_bytes(len);
        let end = pos + RECORD_PREFIX_LEN as u64 + u64::from(len);
        if end > total {
            break;
        }
        body.resize(len as usize, 0);
        reader.read_exact(&mut body)?;
        if crc32fast::hash(&body) != u32::from_le_bytes(crc) {
            if end == total {
                break;
            }
            return Err(DedupError::Persistence(format!(
                "index journal {} damaged at offset {}",
                path.display(),
                pos
            )));
        }
        let record: JournalRecord = bincode::deserialize(&body)
            .map_err(|e| persistence("failed to decode journal record", e))?;
        records.push(record);
        pos = end;
    }

    if pos < total {
        warn!(
            path = %path.display(),
            valid_len = pos,
            discarded = total - pos,
            "dropping unfinished index journal record"
        );
    }
    Ok((records, pos))
}

/// Replay `path`, keeping records with a sequence of at least `from_seq`.
pub fn replay_journal(path: &Path, from_seq: u64) -> Result<JournalReplay> {
    let (records, _) = read_records(path)?;
    let mut replay = JournalReplay {
        ops: Vec::with_capacity(records.len()),
        next_seq: from_seq,
    };
    let mut skipped = 0usize;
    for record in records {
        replay.next_seq = replay.next_seq.max(record.seq + 1);
        if record.seq >= from_seq {
            replay.ops.push(record.op);
        } else {
            skipped += 1;
        }
    }
    debug!(
        path = %path.display(),
        replayed = replay.ops.len(),
        skipped,
        "index journal read"
    );
    Ok(replay)
}

fn encode(seq: u64, op: &JournalOp) -> Result<Vec<u8>> {
    let record = JournalRecord {
        seq,
        op: op.clone(),
    };
    let body =
        bincode::serialize(&record).map_err(|e| persistence("failed to encode journal record", e))?;
    let len = u32::try_from(body.len())
        .map_err(|_| DedupError::Persistence("journal record too large".to_string()))?;
    let mut out = Vec::with_capacity(RECORD_PREFIX_LEN + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

struct JournalFile {
    file: File,
    len: u64,
    next_seq: u64,
}

/// Append handle on the journal file.
pub struct IndexJournal {
    path: PathBuf,
    sync_writes: bool,
    inner: Mutex<JournalFile>,
}

impl std::fmt::Debug for IndexJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexJournal")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl IndexJournal {
    /// Journal path that goes with an index snapshot path.
    pub fn path_for(index_path: &Path) -> PathBuf {
        index_path.with_extension("journal")
    }

    /// Open `path` for appending; new records start at `next_seq`.
    ///
    /// An unfinished final record is cut off first so appends start on a
    /// record boundary.
    pub fn open(path: &Path, next_seq: u64, sync_writes: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let (_, valid_len) = read_records(path)?;
        let file = open_append(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        info!(path = %path.display(), next_seq, "index journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            sync_writes,
            inner: Mutex::new(JournalFile {
                file,
                len: valid_len,
                next_seq,
            }),
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence the next record will take.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Append one record. Returns its sequence.
    pub fn append(&self, op: &JournalOp) -> Result<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let record = encode(seq, op)?;
        if let Err(e) = inner.file.write_all(&record) {
            let _ = inner.file.set_len(inner.len);
            return Err(e.into());
        }
        if self.sync_writes {
            inner.file.sync_data()?;
        }
        inner.len += record.len() as u64;
        inner.next_seq += 1;
        Ok(seq)
    }

    /// Force appended records to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    /// Drop records below `seq`; a snapshot taken at `seq` covers them.
    pub fn truncate_before(&self, seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let (records, _) = read_records(&self.path)?;
        let total = records.len();

        let tmp_path = self.path.with_extension("journal.tmp");
        let mut kept = 0usize;
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in records.into_iter().filter(|r| r.seq >= seq) {
                tmp.write_all(&encode(record.seq, &record.op)?)?;
                kept += 1;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        inner.file = open_append(&self.path)?;
        inner.len = inner.file.metadata()?.len();
        debug!(
            path = %self.path.display(),
            dropped = total - kept,
            kept,
            "index journal truncated"
        );
        Ok(())
    }
}
