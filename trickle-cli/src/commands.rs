//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Subcommand};
use tracing::{info, warn};
use trickle_core::config::TrickleConfig;
use trickle_core::engine::TorrentHandle;
use trickle_core::engine::memory::{MemoryEngine, MemoryTorrent};
use trickle_core::tracing_setup::{CliLogLevel, init_tracing};
use trickle_core::StreamingService;

/// URI scheme of torrents served from the local library.
const LIBRARY_SCHEME: &str = "memory:";

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Serve(ServeArgs),
}

/// Options of the `serve` command
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,
    /// Console log level, overridden by RUST_LOG
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    pub log_level: CliLogLevel,
    /// Directory for the full trace log of this run
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,
    /// Directory whose files are served as single-file torrents. Each file is
    /// loaded into memory in full, outside the stream memory limit
    #[arg(long)]
    pub library: Option<PathBuf>,
    /// Piece length of library torrents in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    pub piece_length: u64,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => serve(args).await,
    }
}

/// Loads configuration, seeds the engine and runs the server until Ctrl-C.
///
/// # Errors
/// - Invalid configuration from the environment
/// - Log file or library directory cannot be read
/// - Bind address unavailable
pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    init_tracing(args.log_level.as_tracing_level(), args.logs_dir.as_deref())
        .context("failed to initialize logging")?;

    let config = TrickleConfig::from_env();
    config.validate()?;
    info!(
        "Stream memory limit {} bytes, idle timeout {:?}, removal grace {:?}",
        config.streaming.memory_limit, config.streaming.idle_timeout, config.streaming.remove_timeout
    );

    let engine = Arc::new(MemoryEngine::new());
    match &args.library {
        Some(dir) => {
            let uris = seed_library(&engine, dir, args.piece_length).await?;
            info!("Serving {} library files from {}", uris.len(), dir.display());
        }
        None => warn!("No --library given, every torrent add will time out"),
    }

    let service = StreamingService::new(config, engine);
    service.spawn_background_tasks();

    trickle_web::run_server(args.bind, service)
        .await
        .with_context(|| format!("server on {} failed", args.bind))
}

/// Registers every regular file in `dir` with the engine as
/// `memory:<file name>`. Returns the URIs, sorted.
///
/// File contents stay resident for the life of the engine; the stream
/// memory limit only bounds the piece caches.
///
/// # Errors
/// Returns an I/O error if the directory or one of its files cannot be read.
pub async fn seed_library(
    engine: &MemoryEngine,
    dir: &Path,
    piece_length: u64,
) -> anyhow::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read library {}", dir.display()))?;

    let mut uris = Vec::new();
    let mut resident = 0u64;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let content = tokio::fs::read(entry.path())
            .await
            .with_context(|| format!("failed to read {}", entry.path().display()))?;

        resident += content.len() as u64;
        let torrent = MemoryTorrent::single_file(name.clone(), piece_length, Bytes::from(content));
        let uri = format!("{LIBRARY_SCHEME}{name}");
        info!("Library file {} available as {}", torrent.info_hash(), uri);
        engine.insert(uri.clone(), torrent);
        uris.push(uri);
    }

    if resident > 0 {
        warn!(
            "Library {} holds {} bytes in memory, not bounded by the stream memory limit",
            dir.display(),
            resident
        );
    }

    uris.sort();
    Ok(uris)
}
