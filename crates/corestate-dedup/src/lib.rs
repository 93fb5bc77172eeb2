#![warn(missing_docs)]

//! CoreState deduplication engine: content-defined chunking (FastCDC),
//! content addressing (BLAKE3/SHA-256), and a reference-counted chunk index
//! with delayed reaping and storage compaction.
//!
//! Write path: Data → Chunk (FastCDC) → Fingerprint → Index lookup → Store (new content only)
//! Release path: Decrement → Tombstone → Grace period → Reap → Compact

pub mod chunker;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod journal;
pub mod persist;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod stats;
pub mod store;

pub use chunker::{Chunk, ChunkBoundary, ChunkSplitter, ChunkerConfig};
pub use compactor::CompactionReport;
pub use config::{CompactionConfig, DedupConfig, ReaperConfig, StorageConfig};
pub use engine::{DedupEngine, DeduplicationResult, HealthReport, IngestReport, IngestedChunk};
pub use error::{DedupError, Result, StoreError};
pub use fingerprint::{ChunkHash, HashAlgorithm};
pub use index::{EntryState, ReferenceEntry};
pub use persist::IndexSnapshot;
pub use reaper::{ReapPolicy, ReapStats};
pub use retry::RetryConfig;
pub use service::DedupService;
pub use stats::StorageStats;
pub use store::{ChunkBackend, ChunkStore, FaultyBackend, FileBackend, MemoryBackend};
