//! Error types for the deduplication engine

use crate::fingerprint::ChunkHash;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DedupError>;

/// Result type alias for chunk backend operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// All errors surfaced by the deduplication engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Empty or oversized chunk, malformed hash string, or similar caller mistake.
    /// Rejected before the index is touched.
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// What was wrong with the input.
        reason: String,
    },

    /// The hash is not present in the index (never submitted, or already reaped).
    #[error("Chunk not found: {hash}")]
    NotFound {
        /// The content address that was looked up.
        hash: ChunkHash,
    },

    /// A decrement asked for more references than the entry holds.
    #[error("Reference underflow on {hash}: current count {current}, requested decrement {requested}")]
    ReferenceUnderflow {
        /// The content address.
        hash: ChunkHash,
        /// Reference count at the time of the request.
        current: u64,
        /// Amount the caller tried to subtract.
        requested: u64,
    },

    /// The backend kept failing after the bounded retry budget was spent.
    #[error("Storage backend error during {op} after {attempts} attempt(s): {source}")]
    StorageBackend {
        /// Backend operation that failed (`put`, `get`, `delete`, `rewrite`, ...).
        op: &'static str,
        /// Attempts made, including the first.
        attempts: u32,
        /// Last backend error observed.
        #[source]
        source: StoreError,
    },

    /// The entry stayed in a transitional state (payload write or reap in flight)
    /// for longer than the conflict retry budget.
    #[error("Concurrent modification conflict on {hash} after {attempts} attempt(s)")]
    ConcurrentModificationConflict {
        /// The content address.
        hash: ChunkHash,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Configuration rejected at initialization.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The index snapshot could not be saved or loaded.
    #[error("Index persistence failed: {0}")]
    Persistence(String),

    /// Reading a caller-supplied stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DedupError {
    /// Shorthand for [`DedupError::InvalidInput`].
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        DedupError::InvalidInput {
            reason: reason.into(),
        }
    }
}

/// Errors reported by a [`ChunkBackend`](crate::store::ChunkBackend) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend holds no payload under this hash.
    #[error("Payload not found: {0}")]
    NotFound(ChunkHash),

    /// I/O error from the underlying medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The call did not finish within the configured timeout.
    #[error("Backend call timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The backend image is damaged.
    #[error("Backend image corrupted: {reason}")]
    Corrupted {
        /// Description of the damage.
        reason: String,
    },

    /// The backend is temporarily unable to serve requests.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(_) => true,
            StoreError::Timeout { .. } => true,
            StoreError::Unavailable(_) => true,
            StoreError::NotFound(_) => false,
            StoreError::Corrupted { .. } => false,
        }
    }
}
