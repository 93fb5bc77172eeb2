//! Content fingerprinting: the hash that is a chunk's permanent address

use crate::error::DedupError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a content address in bytes. Every supported algorithm yields 256 bits.
pub const HASH_LEN: usize = 32;

/// A 32-byte content hash identifying a chunk. Used as the CAS key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHash(pub [u8; HASH_LEN]);

impl ChunkHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, DedupError> {
        let mut out = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|e| {
            DedupError::invalid_input(format!("malformed chunk hash {:?}: {}", s, e))
        })?;
        Ok(ChunkHash(out))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..16])
    }
}

impl FromStr for ChunkHash {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ChunkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChunkHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash function used to derive content addresses.
///
/// Both choices are cryptographic, so accidental collisions between distinct
/// payloads are not a practical concern. The algorithm must not change for a
/// populated store: addresses computed under one algorithm never match the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE3 (default)
    #[default]
    Blake3,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Compute the content address of `data`.
    pub fn hash(&self, data: &[u8]) -> ChunkHash {
        match self {
            HashAlgorithm::Blake3 => blake3_hash(data),
            HashAlgorithm::Sha256 => sha256_hash(data),
        }
    }

    /// Stable identifier used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(HashAlgorithm::Blake3),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            other => Err(DedupError::InvalidConfig(format!(
                "unknown hash algorithm {:?}",
                other
            ))),
        }
    }
}

/// Compute BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> ChunkHash {
    ChunkHash(*blake3::hash(data).as_bytes())
}

/// Compute SHA-256 hash of data
pub fn sha256_hash(data: &[u8]) -> ChunkHash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    ChunkHash(out)
}
