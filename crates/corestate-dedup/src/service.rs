//! Service lifecycle: opens the backend, restores the index, runs the
//! background workers, and shuts everything down in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DedupConfig;
use crate::engine::DedupEngine;
use crate::error::{DedupError, Result};
use crate::journal::{self, IndexJournal};
use crate::persist;
use crate::store::{open_backend, ChunkBackend};
use crate::{compactor, reaper};

/// A running deduplication service.
///
/// Dropping the service without [`close`](Self::close) stops the workers at
/// their next tick but skips the final checkpoint and store flush; the index
/// journal still holds every settled change for the next start.
pub struct DedupService {
    engine: Arc<DedupEngine>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for DedupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupService")
            .field("engine", &self.engine)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl DedupService {
    /// Validate `config`, open the configured backend, and start.
    pub async fn initialize(config: DedupConfig) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config.storage).await?;
        Self::with_backend(config, backend).await
    }

    /// Start over an already opened backend.
    pub async fn with_backend(config: DedupConfig, backend: Arc<dyn ChunkBackend>) -> Result<Self> {
        let engine = Arc::new(DedupEngine::new(config, backend)?);

        if let Some(path) = engine.config().index_path.clone() {
            let algorithm = engine.config().hash_algorithm;
            let sync_writes = engine.config().index_sync_writes;
            let (entries, replayed, journal) = tokio::task::spawn_blocking(move || {
                let (entries, from_seq) = persist::load_snapshot(&path, algorithm)?
                    .map(|s| (s.entries, s.journal_seq))
                    .unwrap_or_default();
                let journal_path = IndexJournal::path_for(&path);
                let replay = journal::replay_journal(&journal_path, from_seq)?;
                let replayed = replay.ops.len();
                let next_seq = replay.next_seq;
                let entries = replay.apply_to(entries);
                let journal = IndexJournal::open(&journal_path, next_seq, sync_writes)?;
                Ok::<_, DedupError>((entries, replayed, journal))
            })
            .await
            .map_err(|e| DedupError::Persistence(e.to_string()))??;

            let (restored, dropped) = engine.restore_index(entries).await?;
            info!(restored, dropped, replayed, "reference index restored");
            engine.attach_journal(Arc::new(journal));
            engine.checkpoint_index().await?;
        }

        let (shutdown, rx) = watch::channel(false);
        let mut workers = vec![tokio::spawn(reaper::run_reaper(Arc::clone(&engine), rx.clone()))];
        if engine.config().index_path.is_some() {
            workers.push(tokio::spawn(persist::run_checkpointer(
                Arc::clone(&engine),
                Duration::from_secs(engine.config().index_checkpoint_secs),
                rx.clone(),
            )));
        }
        if let Some(interval) = engine.config().compaction.interval_secs {
            workers.push(tokio::spawn(compactor::run_compactor(
                Arc::clone(&engine),
                Duration::from_secs(interval),
                rx,
            )));
        }

        info!(
            backend = engine.store().backend().name(),
            workers = workers.len(),
            "dedup service started"
        );
        Ok(Self {
            engine,
            shutdown,
            workers,
        })
    }

    /// The engine, for issuing operations.
    pub fn engine(&self) -> &Arc<DedupEngine> {
        &self.engine
    }

    /// Checkpoint the index now, if an index path is configured.
    pub async fn save_index(&self) -> Result<()> {
        self.engine.checkpoint_index().await
    }

    /// Stop the workers, checkpoint the index, and flush the store.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "background worker ended abnormally");
            }
        }
        self.save_index().await?;
        self.engine.store().flush().await?;
        info!("dedup service closed");
        Ok(())
    }
}

impl Drop for DedupService {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
