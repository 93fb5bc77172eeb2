//! Content-defined chunking (FastCDC)
//!
//! Boundaries come from a gear-hash rolling fingerprint: after `min_size`
//! bytes the fingerprint is tested against a mask sized so the expected chunk
//! length is `target_size`, and a cut is forced at `max_size`. A boundary
//! depends only on the bytes before it within the current chunk, so identical
//! sub-sequences re-align after insertions or deletions elsewhere in the stream.
//!
//! Policy for short input: an empty stream yields zero chunks (never an empty
//! chunk) and a stream shorter than `min_size` yields exactly one chunk.

use crate::error::{DedupError, Result};
use crate::fingerprint::{ChunkHash, HashAlgorithm};
use bytes::Bytes;
use fastcdc::v2020::{
    FastCDC, StreamCDC, AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX,
    MINIMUM_MIN,
};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// A content-defined chunk with its content address
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// Content hash of the chunk (CAS key)
    pub hash: ChunkHash,
    /// Byte offset of this chunk in the original data stream
    pub offset: u64,
}

/// Position of one chunk within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    /// Byte offset of the first byte of the chunk
    pub offset: u64,
    /// Length of the chunk in bytes
    pub length: usize,
}

/// Configuration for the FastCDC chunker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes
    pub min_size: u32,
    /// Expected (target) chunk size in bytes
    #[serde(alias = "avg_size")]
    pub target_size: u32,
    /// Maximum chunk size in bytes; a cut is forced here
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 16 * 1024,
            target_size: 64 * 1024,
            max_size: 256 * 1024,
        }
    }
}

impl ChunkerConfig {
    /// Check ordering and the bounds FastCDC accepts.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_size < self.target_size && self.target_size < self.max_size) {
            return Err(DedupError::InvalidConfig(format!(
                "chunker sizes must satisfy min < target < max (got {} / {} / {})",
                self.min_size, self.target_size, self.max_size
            )));
        }
        let in_range = |name: &str, v: u32, lo: u32, hi: u32| {
            if v < lo || v > hi {
                Err(DedupError::InvalidConfig(format!(
                    "chunker {} {} outside [{}, {}]",
                    name, v, lo, hi
                )))
            } else {
                Ok(())
            }
        };
        in_range("min_size", self.min_size, MINIMUM_MIN, MINIMUM_MAX)?;
        in_range("target_size", self.target_size, AVERAGE_MIN, AVERAGE_MAX)?;
        in_range("max_size", self.max_size, MAXIMUM_MIN, MAXIMUM_MAX)?;
        Ok(())
    }
}

/// Splits byte streams into content-defined chunks.
///
/// The splitter holds no per-stream state: every call starts a fresh, lazy
/// sequence, so re-running a split over the same bytes yields the same
/// boundaries.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    config: ChunkerConfig,
    algorithm: HashAlgorithm,
}

impl ChunkSplitter {
    /// Create a splitter after validating the configuration.
    pub fn new(config: ChunkerConfig, algorithm: HashAlgorithm) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, algorithm })
    }

    /// The configuration in use.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Lazily compute chunk boundaries over an in-memory buffer.
    pub fn boundaries<'a>(&self, data: &'a [u8]) -> Boundaries<'a> {
        let inner = if data.is_empty() {
            None
        } else {
            Some(FastCDC::new(
                data,
                self.config.min_size,
                self.config.target_size,
                self.config.max_size,
            ))
        };
        Boundaries { inner }
    }

    /// Lazily split an in-memory buffer into hashed chunks.
    /// Concatenating all chunk.data bytes reconstructs the original data.
    pub fn chunks<'a>(&self, data: &'a [u8]) -> Chunks<'a> {
        Chunks {
            data,
            boundaries: self.boundaries(data),
            algorithm: self.algorithm,
        }
    }

    /// Lazily split a reader into hashed chunks without buffering the whole stream.
    pub fn stream<R: Read>(&self, reader: R) -> StreamChunks<R> {
        StreamChunks {
            inner: StreamCDC::new(
                reader,
                self.config.min_size,
                self.config.target_size,
                self.config.max_size,
            ),
            algorithm: self.algorithm,
            done: false,
        }
    }
}

/// Iterator over chunk boundaries of a buffer.
pub struct Boundaries<'a> {
    inner: Option<FastCDC<'a>>,
}

impl Iterator for Boundaries<'_> {
    type Item = ChunkBoundary;

    fn next(&mut self) -> Option<Self::Item> {
        let c = self.inner.as_mut()?.next()?;
        Some(ChunkBoundary {
            offset: c.offset as u64,
            length: c.length,
        })
    }
}

/// Iterator over hashed chunks of a buffer.
pub struct Chunks<'a> {
    data: &'a [u8],
    boundaries: Boundaries<'a>,
    algorithm: HashAlgorithm,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let b = self.boundaries.next()?;
        let start = b.offset as usize;
        let bytes = Bytes::copy_from_slice(&self.data[start..start + b.length]);
        let hash = self.algorithm.hash(&bytes);
        Some(Chunk {
            data: bytes,
            hash,
            offset: b.offset,
        })
    }
}

/// Iterator over hashed chunks read from a [`Read`] source.
pub struct StreamChunks<R: Read> {
    inner: StreamCDC<R>,
    algorithm: HashAlgorithm,
    done: bool,
}

impl<R: Read> Iterator for StreamChunks<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next()? {
            Ok(c) => {
                let hash = self.algorithm.hash(&c.data);
                Some(Ok(Chunk {
                    data: Bytes::from(c.data),
                    hash,
                    offset: c.offset,
                }))
            }
            Err(fastcdc::v2020::Error::Empty) => {
                self.done = true;
                None
            }
            Err(fastcdc::v2020::Error::IoError(e)) => {
                self.done = true;
                Some(Err(DedupError::Io(e)))
            }
            Err(other) => {
                self.done = true;
                Some(Err(DedupError::Io(std::io::Error::other(format!(
                    "{:?}",
                    other
                )))))
            }
        }
    }
}
