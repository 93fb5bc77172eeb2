//! Log-structured file backend.
//!
//! Payloads are appended to a single log file; the location index is rebuilt
//! by scanning the log on open. Deletes append a tombstone record, so space is
//! only returned by [`ChunkBackend::rewrite`], which copies retained records
//! into a fresh log and renames it over the old one.
//!
//! File layout:
//!
//! ```text
//! "CSDL" version:u8
//! record* := kind:u8 hash:[u8; 32] len:u32le crc32:u32le hcrc32:u32le payload[len]
//! ```
//!
//! `crc32` covers the payload and `hcrc32` the fields before it, so a damaged
//! header is caught before its length is trusted.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ChunkBackend, RewritePlan, RewriteReport};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::{ChunkHash, HASH_LEN};

const LOG_FILE: &str = "chunks.log";
const COMPACT_FILE: &str = "chunks.log.compact";

/// Log file magic: "CSDL"
const LOG_MAGIC: [u8; 4] = *b"CSDL";
const LOG_VERSION: u8 = 2;
const FILE_HEADER_LEN: u64 = 5;

const RECORD_HEADER_LEN: usize = 1 + HASH_LEN + 4 + 4 + 4;
/// Bytes covered by the header checksum.
const HEADER_CHECKED_LEN: usize = RECORD_HEADER_LEN - 4;
const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;

/// Where a payload lives in the log.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: u32,
    crc: u32,
    seq: u64,
}

struct LogState {
    file: File,
    index: HashMap<ChunkHash, Slot>,
    file_len: u64,
    generation: u64,
}

/// Single-file, append-only chunk backend.
pub struct FileBackend {
    path: PathBuf,
    state: Arc<Mutex<LogState>>,
    next_seq: Arc<AtomicU64>,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .finish()
    }
}

fn corrupted(reason: impl Into<String>) -> StoreError {
    StoreError::Corrupted {
        reason: reason.into(),
    }
}

fn record_header(kind: u8, hash: &ChunkHash, len: u32, crc: u32) -> [u8; RECORD_HEADER_LEN] {
    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0] = kind;
    header[1..1 + HASH_LEN].copy_from_slice(hash.as_bytes());
    header[1 + HASH_LEN..5 + HASH_LEN].copy_from_slice(&len.to_le_bytes());
    header[5 + HASH_LEN..HEADER_CHECKED_LEN].copy_from_slice(&crc.to_le_bytes());
    let hcrc = crc32fast::hash(&header[..HEADER_CHECKED_LEN]);
    header[HEADER_CHECKED_LEN..].copy_from_slice(&hcrc.to_le_bytes());
    header
}

/// Decode a record header, or `None` if its checksum does not match.
fn parse_record_header(header: &[u8; RECORD_HEADER_LEN]) -> Option<(u8, ChunkHash, u32, u32)> {
    let mut hcrc = [0u8; 4];
    hcrc.copy_from_slice(&header[HEADER_CHECKED_LEN..]);
    if crc32fast::hash(&header[..HEADER_CHECKED_LEN]) != u32::from_le_bytes(hcrc) {
        return None;
    }
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&header[1..1 + HASH_LEN]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[1 + HASH_LEN..5 + HASH_LEN]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&header[5 + HASH_LEN..HEADER_CHECKED_LEN]);
    Some((
        header[0],
        ChunkHash(hash),
        u32::from_le_bytes(len),
        u32::from_le_bytes(crc),
    ))
}

fn file_header() -> [u8; FILE_HEADER_LEN as usize] {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    header[..4].copy_from_slice(&LOG_MAGIC);
    header[4] = LOG_VERSION;
    header
}

fn read_payload(file: &mut File, hash: &ChunkHash, slot: &Slot) -> StoreResult<Vec<u8>> {
    let mut buf = vec![0u8; slot.len as usize];
    file.seek(SeekFrom::Start(slot.offset))?;
    file.read_exact(&mut buf)?;
    if crc32fast::hash(&buf) != slot.crc {
        return Err(corrupted(format!(
            "checksum mismatch for {} at offset {}",
            hash, slot.offset
        )));
    }
    Ok(buf)
}

struct Scan {
    index: HashMap<ChunkHash, Slot>,
    valid_len: u64,
    next_seq: u64,
}

/// Rebuild the location index from the log, truncating a torn tail.
fn scan_log(file: &mut File, path: &Path) -> StoreResult<Scan> {
    let total = file.metadata()?.len();
    if total == 0 {
        file.write_all(&file_header())?;
        file.sync_all()?;
        return Ok(Scan {
            index: HashMap::new(),
            valid_len: FILE_HEADER_LEN,
            next_seq: 0,
        });
    }

    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut magic = [0u8; FILE_HEADER_LEN as usize];
    if total < FILE_HEADER_LEN || reader.read_exact(&mut magic).is_err() || magic != file_header()
    {
        return Err(corrupted(format!("{} is not a chunk log", path.display())));
    }

    let mut index = HashMap::new();
    let mut next_seq = 0u64;
    let mut pos = FILE_HEADER_LEN;
    let mut header = [0u8; RECORD_HEADER_LEN];
    let mut payload = Vec::new();

    while pos < total {
        if total - pos < RECORD_HEADER_LEN as u64 {
            break;
        }
        reader.read_exact(&mut header)?;
        let (kind, hash, len, crc) = parse_record_header(&header).ok_or_else(|| {
            corrupted(format!("record header checksum mismatch at offset {}", pos))
        })?;
        let end = pos + RECORD_HEADER_LEN as u64 + len as u64;
        if end > total {
            break;
        }
        payload.resize(len as usize, 0);
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            if end == total {
                // Last record only partially reached the disk.
                break;
            }
            return Err(corrupted(format!(
                "checksum mismatch in record at offset {}",
                pos
            )));
        }
        match kind {
            KIND_PUT => {
                index.insert(
                    hash,
                    Slot {
                        offset: pos + RECORD_HEADER_LEN as u64,
                        len,
                        crc,
                        seq: next_seq,
                    },
                );
                next_seq += 1;
            }
            KIND_DELETE => {
                index.remove(&hash);
            }
            other => {
                return Err(corrupted(format!(
                    "unknown record kind {} at offset {}",
                    other, pos
                )))
            }
        }
        pos = end;
    }
    drop(reader);

    if pos < total {
        warn!(
            path = %path.display(),
            valid_len = pos,
            discarded = total - pos,
            "truncating torn tail of chunk log"
        );
        file.set_len(pos)?;
        file.sync_all()?;
    }

    Ok(Scan {
        index,
        valid_len: pos,
        next_seq,
    })
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Appends records to a fresh log while tracking offsets.
struct LogWriter {
    writer: BufWriter<File>,
    len: u64,
    index: HashMap<ChunkHash, Slot>,
}

impl LogWriter {
    fn create(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&file_header())?;
        Ok(Self {
            writer,
            len: FILE_HEADER_LEN,
            index: HashMap::new(),
        })
    }

    fn put(&mut self, hash: &ChunkHash, payload: &[u8], slot: &Slot) -> StoreResult<()> {
        self.writer
            .write_all(&record_header(KIND_PUT, hash, slot.len, slot.crc))?;
        self.writer.write_all(payload)?;
        self.index.insert(
            *hash,
            Slot {
                offset: self.len + RECORD_HEADER_LEN as u64,
                ..*slot
            },
        );
        self.len += RECORD_HEADER_LEN as u64 + slot.len as u64;
        Ok(())
    }

    fn delete(&mut self, hash: &ChunkHash) -> StoreResult<()> {
        self.writer
            .write_all(&record_header(KIND_DELETE, hash, 0, crc32fast::hash(&[])))?;
        self.index.remove(hash);
        self.len += RECORD_HEADER_LEN as u64;
        Ok(())
    }

    fn finish(self) -> StoreResult<(u64, HashMap<ChunkHash, Slot>)> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok((self.len, self.index))
    }
}

fn rewrite_log(
    state: &Mutex<LogState>,
    path: &Path,
    plan: &RewritePlan,
) -> StoreResult<RewriteReport> {
    let compact_path = path.with_file_name(COMPACT_FILE);

    // Phase one copies everything retained so far without blocking writers.
    // The old log is append-only, so slots captured here stay readable.
    let (generation, mut source, keep) = {
        let st = state.lock();
        let keep: Vec<(ChunkHash, Slot)> = st
            .index
            .iter()
            .filter(|(hash, slot)| plan.retains(hash, slot.seq))
            .map(|(hash, slot)| (*hash, *slot))
            .collect();
        (st.generation, File::open(path)?, keep)
    };

    let mut out = LogWriter::create(&compact_path)?;
    for (hash, slot) in &keep {
        let payload = read_payload(&mut source, hash, slot)?;
        out.put(hash, &payload, slot)?;
    }

    // Phase two catches up with writes and deletes that raced with the copy,
    // then swaps the logs while holding the lock.
    let mut st = state.lock();
    if st.generation != generation {
        return Err(StoreError::Unavailable(
            "chunk log was rewritten concurrently".to_string(),
        ));
    }

    let late: Vec<(ChunkHash, Slot)> = st
        .index
        .iter()
        .filter(|(hash, slot)| !out.index.contains_key(*hash) && plan.retains(hash, slot.seq))
        .map(|(hash, slot)| (*hash, *slot))
        .collect();
    for (hash, slot) in &late {
        let payload = read_payload(&mut st.file, hash, slot)?;
        out.put(hash, &payload, slot)?;
    }

    let gone: Vec<ChunkHash> = out
        .index
        .keys()
        .filter(|hash| !st.index.contains_key(*hash))
        .copied()
        .collect();
    for hash in &gone {
        out.delete(hash)?;
    }

    let (new_len, new_index) = out.finish()?;
    let records_dropped = st
        .index
        .keys()
        .filter(|hash| !new_index.contains_key(*hash))
        .count();

    std::fs::rename(&compact_path, path)?;
    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }

    let bytes_before = st.file_len;
    st.file = open_log(path)?;
    st.index = new_index;
    st.file_len = new_len;
    st.generation += 1;

    Ok(RewriteReport {
        bytes_before,
        bytes_after: new_len,
        records_dropped,
    })
}

impl FileBackend {
    /// Open (or create) the chunk log under `dir`.
    pub async fn open(dir: PathBuf) -> StoreResult<Self> {
        tokio::task::spawn_blocking(move || Self::open_blocking(dir))
            .await
            .map_err(|e| StoreError::Unavailable(format!("open task failed: {}", e)))?
    }

    fn open_blocking(dir: PathBuf) -> StoreResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);

        let stale = dir.join(COMPACT_FILE);
        if stale.exists() {
            warn!(path = %stale.display(), "removing unfinished compaction output");
            std::fs::remove_file(&stale)?;
        }

        let mut file = open_log(&path)?;
        let scan = scan_log(&mut file, &path)?;
        info!(
            path = %path.display(),
            payloads = scan.index.len(),
            bytes = scan.valid_len,
            "opened chunk log"
        );

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(LogState {
                file,
                index: scan.index,
                file_len: scan.valid_len,
                generation: 0,
            })),
            next_seq: Arc::new(AtomicU64::new(scan.next_seq)),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_state<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut LogState) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut st = state.lock();
            f(&mut st)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl ChunkBackend for FileBackend {
    async fn put(&self, hash: &ChunkHash, data: Bytes) -> StoreResult<()> {
        let hash = *hash;
        let next_seq = Arc::clone(&self.next_seq);
        self.with_state(move |st| {
            if let Some(slot) = st.index.get_mut(&hash) {
                slot.seq = next_seq.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            let len = u32::try_from(data.len())
                .map_err(|_| corrupted(format!("payload of {} bytes exceeds record limit", data.len())))?;
            let crc = crc32fast::hash(&data);

            let mut record = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
            record.extend_from_slice(&record_header(KIND_PUT, &hash, len, crc));
            record.extend_from_slice(&data);
            if let Err(e) = st.file.write_all(&record) {
                // Drop whatever part of the record made it out.
                let _ = st.file.set_len(st.file_len);
                return Err(e.into());
            }

            let seq = next_seq.fetch_add(1, Ordering::SeqCst);
            st.index.insert(
                hash,
                Slot {
                    offset: st.file_len + RECORD_HEADER_LEN as u64,
                    len,
                    crc,
                    seq,
                },
            );
            st.file_len += record.len() as u64;
            Ok(())
        })
        .await
    }

    async fn get(&self, hash: &ChunkHash) -> StoreResult<Bytes> {
        let hash = *hash;
        self.with_state(move |st| {
            let slot = *st.index.get(&hash).ok_or(StoreError::NotFound(hash))?;
            read_payload(&mut st.file, &hash, &slot).map(Bytes::from)
        })
        .await
    }

    async fn delete(&self, hash: &ChunkHash) -> StoreResult<bool> {
        let hash = *hash;
        self.with_state(move |st| {
            if !st.index.contains_key(&hash) {
                return Ok(false);
            }
            let record = record_header(KIND_DELETE, &hash, 0, crc32fast::hash(&[]));
            if let Err(e) = st.file.write_all(&record) {
                let _ = st.file.set_len(st.file_len);
                return Err(e.into());
            }
            st.index.remove(&hash);
            st.file_len += RECORD_HEADER_LEN as u64;
            Ok(true)
        })
        .await
    }

    async fn contains(&self, hash: &ChunkHash) -> StoreResult<bool> {
        Ok(self.state.lock().index.contains_key(hash))
    }

    fn watermark(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    async fn rewrite(&self, plan: &RewritePlan) -> StoreResult<RewriteReport> {
        let state = Arc::clone(&self.state);
        let path = self.path.clone();
        let plan = plan.clone();
        let result = tokio::task::spawn_blocking(move || {
            let result = rewrite_log(&state, &path, &plan);
            if result.is_err() {
                let _ = std::fs::remove_file(path.with_file_name(COMPACT_FILE));
            }
            result
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("rewrite task failed: {}", e)))?;

        if let Ok(report) = &result {
            debug!(
                path = %self.path.display(),
                bytes_before = report.bytes_before,
                bytes_after = report.bytes_after,
                records_dropped = report.records_dropped,
                "chunk log rewritten"
            );
        }
        result
    }

    async fn size_bytes(&self) -> StoreResult<u64> {
        Ok(self.state.lock().file_len)
    }

    async fn flush(&self) -> StoreResult<()> {
        self.with_state(|st| {
            st.file.sync_all()?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;
    use tempfile::TempDir;

    fn payload(tag: u8, len: usize) -> (ChunkHash, Bytes) {
        let data = Bytes::from(vec![tag; len]);
        (blake3_hash(&data), data)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
        let (hash, data) = payload(7, 4096);

        backend.put(&hash, data.clone()).await.unwrap();
        let size = backend.size_bytes().await.unwrap();
        backend.put(&hash, data.clone()).await.unwrap();
        assert_eq!(backend.size_bytes().await.unwrap(), size);
        assert_eq!(backend.get(&hash).await.unwrap(), data);

        assert!(backend.delete(&hash).await.unwrap());
        assert!(!backend.delete(&hash).await.unwrap());
        assert!(matches!(
            backend.get(&hash).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reopen_replays_log() {
        let dir = TempDir::new().unwrap();
        let (kept, kept_data) = payload(1, 1000);
        let (dropped, dropped_data) = payload(2, 2000);
        {
            let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
            backend.put(&kept, kept_data.clone()).await.unwrap();
            backend.put(&dropped, dropped_data).await.unwrap();
            backend.delete(&dropped).await.unwrap();
            backend.flush().await.unwrap();
        }

        let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(backend.get(&kept).await.unwrap(), kept_data);
        assert!(!backend.contains(&dropped).await.unwrap());
        assert_eq!(backend.watermark(), 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let (hash, data) = payload(3, 512);
        let valid_len = {
            let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
            backend.put(&hash, data.clone()).await.unwrap();
            backend.size_bytes().await.unwrap()
        };

        let log = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        let (other, _) = payload(4, 512);
        file.write_all(&record_header(KIND_PUT, &other, 512, 0))
            .unwrap();
        file.write_all(&[4u8; 100]).unwrap();
        drop(file);

        let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(backend.size_bytes().await.unwrap(), valid_len);
        assert_eq!(backend.get(&hash).await.unwrap(), data);
        assert!(!backend.contains(&other).await.unwrap());

        let (next, next_data) = payload(5, 64);
        backend.put(&next, next_data.clone()).await.unwrap();
        drop(backend);
        let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(backend.get(&next).await.unwrap(), next_data);
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOG_FILE), b"not a log at all").unwrap();
        assert!(matches!(
            FileBackend::open(dir.path().to_path_buf()).await,
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_mid_log_corruption_detected() {
        let dir = TempDir::new().unwrap();
        {
            let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
            let (a, da) = payload(8, 256);
            let (b, db) = payload(9, 256);
            backend.put(&a, da).await.unwrap();
            backend.put(&b, db).await.unwrap();
        }
        let log = dir.path().join(LOG_FILE);
        let mut bytes = std::fs::read(&log).unwrap();
        let first_payload = FILE_HEADER_LEN as usize + RECORD_HEADER_LEN;
        bytes[first_payload + 10] ^= 0xff;
        std::fs::write(&log, bytes).unwrap();

        assert!(matches!(
            FileBackend::open(dir.path().to_path_buf()).await,
            Err(StoreError::Corrupted { .. })
        ));
    }

    async fn two_record_log(dir: &Path) -> Vec<u8> {
        let backend = FileBackend::open(dir.to_path_buf()).await.unwrap();
        let (a, da) = payload(14, 300);
        let (b, db) = payload(15, 300);
        backend.put(&a, da).await.unwrap();
        backend.put(&b, db).await.unwrap();
        drop(backend);
        std::fs::read(dir.join(LOG_FILE)).unwrap()
    }

    #[tokio::test]
    async fn test_mid_log_length_damage_detected() {
        let dir = TempDir::new().unwrap();
        let mut bytes = two_record_log(dir.path()).await;
        // high byte of the first record's length
        let len_at = FILE_HEADER_LEN as usize + 1 + HASH_LEN;
        bytes[len_at + 3] ^= 0x01;
        std::fs::write(dir.path().join(LOG_FILE), &bytes).unwrap();

        assert!(matches!(
            FileBackend::open(dir.path().to_path_buf()).await,
            Err(StoreError::Corrupted { .. })
        ));
        // nothing was truncated away
        assert_eq!(
            std::fs::metadata(dir.path().join(LOG_FILE)).unwrap().len(),
            bytes.len() as u64
        );
    }

    #[tokio::test]
    async fn test_mid_log_hash_damage_detected() {
        let dir = TempDir::new().unwrap();
        let mut bytes = two_record_log(dir.path()).await;
        bytes[FILE_HEADER_LEN as usize + 1] ^= 0x80;
        std::fs::write(dir.path().join(LOG_FILE), bytes).unwrap();

        assert!(matches!(
            FileBackend::open(dir.path().to_path_buf()).await,
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_rewrite_reclaims_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
        let (live, live_data) = payload(10, 8192);
        let (dead, dead_data) = payload(11, 8192);
        let (orphan, orphan_data) = payload(12, 4096);
        backend.put(&live, live_data.clone()).await.unwrap();
        backend.put(&dead, dead_data).await.unwrap();
        backend.put(&orphan, orphan_data).await.unwrap();
        backend.delete(&dead).await.unwrap();

        let before = backend.size_bytes().await.unwrap();
        let plan = RewritePlan {
            live: [live].into_iter().collect(),
            retain_written_since: backend.watermark(),
        };
        let report = backend.rewrite(&plan).await.unwrap();
        assert_eq!(report.bytes_before, before);
        assert_eq!(report.records_dropped, 1);
        assert_eq!(
            report.bytes_after,
            FILE_HEADER_LEN + RECORD_HEADER_LEN as u64 + 8192
        );
        assert!(report.bytes_reclaimed() > 12_000);
        assert!(!dir.path().join(COMPACT_FILE).exists());

        assert_eq!(backend.get(&live).await.unwrap(), live_data);
        assert!(!backend.contains(&orphan).await.unwrap());

        let (fresh, fresh_data) = payload(13, 100);
        backend.put(&fresh, fresh_data.clone()).await.unwrap();
        drop(backend);

        let backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(backend.get(&live).await.unwrap(), live_data);
        assert_eq!(backend.get(&fresh).await.unwrap(), fresh_data);
        assert!(!backend.contains(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_compaction_output_removed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(COMPACT_FILE), b"partial").unwrap();
        let _backend = FileBackend::open(dir.path().to_path_buf()).await.unwrap();
        assert!(!dir.path().join(COMPACT_FILE).exists());
    }
}
