//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::HashAlgorithm;
use crate::retry::RetryConfig;

/// Default upper bound on a single submitted chunk (4 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Expiry reaper policy.
///
/// The grace period has no default: it is the window that absorbs a re-reference
/// racing with a count reaching zero, and only the operator can size it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Interval between reap cycles in milliseconds (default: 60000).
    #[serde(default = "default_reap_interval_ms")]
    pub interval_ms: u64,
    /// How long a tombstoned entry must stay at zero before physical removal.
    pub grace_period_secs: u64,
    /// Tombstoned entries read within this many seconds are left for a later
    /// cycle. 0 disables the check (default: 0).
    #[serde(default)]
    pub hot_access_window_secs: u64,
}

fn default_reap_interval_ms() -> u64 {
    60_000
}

impl ReaperConfig {
    /// Reaper policy with the given grace period and default interval.
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            interval_ms: default_reap_interval_ms(),
            grace_period_secs: grace_period.as_secs(),
            hot_access_window_secs: 0,
        }
    }

    /// Interval between cycles.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Grace period as a `Duration`.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Compaction schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Run the compactor every N seconds; `None` means on demand only.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// Where chunk payloads (and optionally the index) live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local, in-memory image.
    Memory,
    /// Log-structured file under `dir`.
    File {
        /// Directory holding the chunk log.
        dir: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Content-defined chunking parameters.
    #[serde(default)]
    pub chunker: ChunkerConfig,
    /// Content hash used for addresses.
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    /// Largest payload accepted by `process_chunk`.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Reaper policy (grace period required).
    pub reaper: ReaperConfig,
    /// Compaction schedule.
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Backend retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Timeout for a single backend call in milliseconds (default: 5000).
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// How many times an operation that meets an in-flight write or reap is
    /// retried before `ConcurrentModificationConflict`. Unset, enough retries
    /// to outwait one fully retried backend put (see
    /// [`DedupConfig::conflict_retry_limit`]).
    #[serde(default)]
    pub conflict_retries: Option<u32>,
    /// Payload backend.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Index snapshot file; when set the index survives restarts. Changes
    /// between checkpoints go to a journal next to it (`<stem>.journal`).
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    /// Seconds between index checkpoints (default: 60).
    #[serde(default = "default_index_checkpoint_secs")]
    pub index_checkpoint_secs: u64,
    /// fsync every journal record instead of once per checkpoint
    /// (default: false). Without it a process crash loses nothing, but a
    /// power loss can drop the records since the last checkpoint.
    #[serde(default)]
    pub index_sync_writes: bool,
}

fn default_max_chunk_size() -> usize {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_index_checkpoint_secs() -> u64 {
    60
}

/// Conflict backoff steps: 1 ms doubling up to this cap.
pub(crate) const CONFLICT_BACKOFF_MAX_MS: u64 = 50;
/// Steps before the conflict backoff reaches its cap (1, 2, 4 .. 32 ms).
const CONFLICT_BACKOFF_RAMP: u32 = 6;

impl DedupConfig {
    /// A configuration with defaults everywhere except the required grace period.
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            hash_algorithm: HashAlgorithm::default(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            reaper: ReaperConfig::with_grace_period(grace_period),
            compaction: CompactionConfig::default(),
            retry: RetryConfig::default(),
            store_timeout_ms: default_store_timeout_ms(),
            conflict_retries: None,
            storage: StorageConfig::Memory,
            index_path: None,
            index_checkpoint_secs: default_index_checkpoint_secs(),
            index_sync_writes: false,
        }
    }

    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DedupConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(DedupError::InvalidConfig(format!(
                    "unsupported config file extension: {:?}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Per-call backend timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Longest a single backend put can take: every attempt timing out, plus
    /// the uncapped backoff between them.
    pub fn put_budget(&self) -> Duration {
        let attempts = u64::from(self.retry.max_retries) + 1;
        let backoff = self
            .retry
            .max_backoff_ms
            .saturating_mul(u64::from(self.retry.max_retries));
        Duration::from_millis(
            self.store_timeout_ms
                .saturating_mul(attempts)
                .saturating_add(backoff),
        )
    }

    /// Conflict retries in effect: the configured count, or enough capped
    /// backoff steps to cover [`put_budget`](Self::put_budget).
    pub fn conflict_retry_limit(&self) -> u32 {
        self.conflict_retries.unwrap_or_else(|| {
            let budget_ms = self.put_budget().as_millis() as u64;
            let steps = budget_ms.div_ceil(CONFLICT_BACKOFF_MAX_MS);
            u32::try_from(steps)
                .unwrap_or(u32::MAX)
                .saturating_add(CONFLICT_BACKOFF_RAMP)
        })
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        self.chunker.validate()?;
        if self.max_chunk_size < self.chunker.max_size as usize {
            return Err(DedupError::InvalidConfig(format!(
                "max_chunk_size {} is smaller than chunker max_size {}",
                self.max_chunk_size, self.chunker.max_size
            )));
        }
        if self.reaper.interval_ms == 0 {
            return Err(DedupError::InvalidConfig(
                "reaper interval must be non-zero".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(DedupError::InvalidConfig(
                "store_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(DedupError::InvalidConfig(format!(
                "retry backoff_multiplier {} must be >= 1.0",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(DedupError::InvalidConfig(
                "retry initial_backoff_ms exceeds max_backoff_ms".to_string(),
            ));
        }
        if self.index_checkpoint_secs == 0 {
            return Err(DedupError::InvalidConfig(
                "index_checkpoint_secs must be non-zero".to_string(),
            ));
        }
        if self.compaction.interval_secs == Some(0) {
            return Err(DedupError::InvalidConfig(
                "compaction interval must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }
}
