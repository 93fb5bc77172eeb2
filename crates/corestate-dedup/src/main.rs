#![warn(missing_docs)]

//! CoreState dedup command-line tool

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corestate_dedup::{ChunkHash, ChunkSplitter, DedupConfig, DedupEngine, DedupService};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cs-dedup")]
#[command(about = "CoreState deduplication engine", long_about = None)]
struct Cli {
    /// Engine configuration (.toml or .json)
    #[arg(short, long, env = "CS_DEDUP_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk files and store their unique chunks
    Ingest {
        /// Files to ingest; each becomes one stream
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print chunk boundaries and hashes without storing anything
    Chunk {
        /// File to split
        file: PathBuf,
    },
    /// Release one reference to a chunk
    Release {
        /// Chunk hash (hex)
        hash: ChunkHash,
    },
    /// Reap chunks whose grace period has expired
    Reap,
    /// Rewrite the store without dead payloads
    Compact,
    /// Print storage statistics and health
    Stats,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn print(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = DedupConfig::from_file(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    if let Command::Chunk { file } = &cli.command {
        let splitter = ChunkSplitter::new(config.chunker, config.hash_algorithm)?;
        let reader = BufReader::new(File::open(file).with_context(|| format!("opening {}", file.display()))?);
        let mut chunks = Vec::new();
        for chunk in splitter.stream(reader) {
            let chunk = chunk?;
            chunks.push(json!({
                "offset": chunk.offset,
                "length": chunk.data.len(),
                "hash": chunk.hash,
            }));
        }
        return print(&chunks);
    }

    tracing::info!(config = %cli.config.display(), "cs-dedup starting");
    let service = DedupService::initialize(config).await?;

    let outcome = run(service.engine(), cli.command).await;

    service.close().await?;
    outcome
}

async fn run(engine: &DedupEngine, command: Command) -> Result<()> {
    match command {
        Command::Ingest { files } => {
            let mut reports = Vec::with_capacity(files.len());
            for path in &files {
                let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
                let stream_id = path.display().to_string();
                let report = engine.ingest_reader(&stream_id, BufReader::new(file)).await?;
                reports.push(json!({
                    "stream_id": report.stream_id,
                    "chunks": report.chunks.len(),
                    "duplicate_chunks": report.duplicate_chunks,
                    "logical_bytes": report.logical_bytes,
                    "stored_bytes": report.stored_bytes,
                }));
            }
            print(&json!({ "streams": reports, "stats": engine.get_stats() }))
        }
        Command::Release { hash } => {
            engine.delete_chunk(&hash).await?;
            let remaining = engine.entry(&hash).map(|e| e.reference_count).unwrap_or(0);
            print(&json!({ "hash": hash, "reference_count": remaining }))
        }
        Command::Reap => print(&engine.cleanup_expired_chunks().await),
        Command::Compact => print(&engine.compact_storage().await?),
        Command::Stats => print(&engine.health().await),
        Command::Chunk { .. } => Ok(()),
    }
}
