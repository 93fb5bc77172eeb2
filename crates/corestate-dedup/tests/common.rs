//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use corestate_dedup::{DedupConfig, DedupService, StorageConfig};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Memory-backed config with a fast reaper tick.
pub fn test_config(grace: Duration) -> DedupConfig {
    let mut config = DedupConfig::with_grace_period(grace);
    config.reaper.interval_ms = 10;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config
}

/// File-backed config persisting the index next to the chunk log.
pub fn file_config(dir: &Path, grace: Duration) -> DedupConfig {
    let mut config = test_config(grace);
    config.storage = StorageConfig::File {
        dir: dir.join("chunks"),
    };
    config.index_path = Some(dir.join("index.bin"));
    config
}

/// Service over an in-memory store.
pub async fn memory_service(grace: Duration) -> DedupService {
    DedupService::initialize(test_config(grace))
        .await
        .expect("service starts")
}

/// Reproducible pseudo-random bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}
