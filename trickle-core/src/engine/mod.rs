//! Capability interface to the BitTorrent engine
//!
//! The cache and stream lifecycle code never talks to a torrent library
//! directly. Everything it needs is expressed through [`TorrentEngine`] and
//! [`TorrentHandle`], so any engine can be plugged in and the core can be
//! exercised against the in-memory engine in [`memory`].

pub mod memory;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Serialize, Serializer};

/// SHA-1 hash identifying a unique torrent.
///
/// Stable for the same content regardless of which URI it was added by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidInfoHash` - If the string is not 20 hex-encoded bytes
    pub fn from_hex(hex_str: &str) -> Result<Self, EngineError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut hash).map_err(|_| EngineError::InvalidInfoHash {
            value: hex_str.to_string(),
        })?;
        Ok(Self(hash))
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Piece containing the absolute torrent byte `offset`.
    pub fn containing(offset: u64, piece_length: u64) -> Self {
        Self((offset / piece_length.max(1)) as u32)
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentFile {
    /// File name without directories
    pub name: String,
    /// Path relative to the torrent root, unique within the torrent
    pub path: String,
    /// Byte offset of the file within the concatenated torrent content
    pub offset: u64,
    /// File length in bytes
    pub length: u64,
}

/// Transfer counters reported by the engine for one torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TorrentStats {
    /// Download progress (0.0 to 1.0)
    pub progress: f64,
    /// Total bytes downloaded
    pub downloaded: u64,
    /// Total bytes uploaded
    pub uploaded: u64,
    /// Current download rate in bytes per second
    pub download_rate: u64,
    /// Current upload rate in bytes per second
    pub upload_rate: u64,
    /// Connected peers
    pub peers: usize,
}

/// Ordered, finite sequence of byte blocks produced by a range read.
///
/// Not restartable: reading the same range again needs a new call.
pub type BlockStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Storage the engine writes verified pieces into and reads them back from.
///
/// A `put` may evict older pieces, and eviction calls back into the owning
/// handle through [`TorrentHandle::mark_unverified`] and
/// [`TorrentHandle::deselect`]. Engines must not hold their own locks
/// across `put`.
pub trait PieceStore: Send + Sync {
    /// Stores a verified piece.
    fn put(&self, index: PieceIndex, data: Bytes);

    /// Returns a resident piece, or the `range` sub-slice of it.
    ///
    /// Returns `None` when the piece is not resident or the range falls
    /// outside the piece.
    fn get(&self, index: PieceIndex, range: Option<Range<usize>>) -> Option<Bytes>;
}

/// Handle to one torrent owned by the engine.
///
/// The core references handles but never owns the torrent behind them.
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    /// Stable content identifier.
    fn info_hash(&self) -> InfoHash;

    /// Display name.
    fn name(&self) -> &str;

    /// Total content length in bytes.
    fn length(&self) -> u64;

    /// Piece length in bytes. The final piece may be shorter.
    fn piece_length(&self) -> u64;

    /// Files in torrent order.
    fn files(&self) -> &[TorrentFile];

    /// Current transfer counters.
    fn stats(&self) -> TorrentStats;

    /// Replaces the piece storage used for this torrent.
    fn attach_store(&self, store: Arc<dyn PieceStore>);

    /// Reads the inclusive byte range `[start, end]` of a file.
    ///
    /// # Errors
    ///
    /// - `EngineError::FileNotFound` - If `file_index` is not a file of this torrent
    /// - `EngineError::ReadFailed` - If the range is invalid or the torrent is destroyed
    fn read_range(
        &self,
        file_index: usize,
        start: u64,
        end: u64,
    ) -> Result<BlockStream, EngineError>;

    /// Marks a piece as no longer verified so it is not served from storage.
    ///
    /// # Errors
    ///
    /// - `EngineError::PieceRejected` - If the engine refuses the request
    fn mark_unverified(&self, index: PieceIndex) -> Result<(), EngineError>;

    /// Removes a piece from the set the engine is trying to download.
    ///
    /// # Errors
    ///
    /// - `EngineError::PieceRejected` - If the engine refuses the request
    fn deselect(&self, index: PieceIndex) -> Result<(), EngineError>;

    /// Stops the torrent and releases its engine resources.
    ///
    /// # Errors
    ///
    /// - `EngineError::Shutdown` - If the engine is no longer running
    async fn destroy(&self) -> Result<(), EngineError>;
}

/// Entry point of the BitTorrent engine.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Adds a torrent by URI and resolves once its metadata is known.
    ///
    /// Adding a URI whose torrent is already present returns the existing
    /// handle.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidUri` - If the URI cannot be parsed
    async fn add_torrent(&self, uri: &str) -> Result<Arc<dyn TorrentHandle>, EngineError>;

    /// Discards a torrent whose add did not complete.
    async fn cancel_add(&self, uri: &str);
}

/// Adds a torrent, giving up after `timeout`.
///
/// On expiry the partially added torrent is discarded so it does not leak
/// engine state. There is no retry.
///
/// # Errors
///
/// - `EngineError::AddTimeout` - If metadata did not arrive in time
/// - Any error returned by [`TorrentEngine::add_torrent`]
pub async fn add_with_timeout(
    engine: &dyn TorrentEngine,
    uri: &str,
    timeout: Duration,
) -> Result<Arc<dyn TorrentHandle>, EngineError> {
    match tokio::time::timeout(timeout, engine.add_torrent(uri)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Adding torrent timed out after {:?}: {}", timeout, uri);
            engine.cancel_add(uri).await;
            Err(EngineError::AddTimeout {
                uri: uri.to_string(),
                timeout,
            })
        }
    }
}

/// Errors reported by or about the torrent engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Adding torrent {uri} timed out after {timeout:?}")]
    AddTimeout { uri: String, timeout: Duration },

    #[error("Invalid torrent URI: {uri}")]
    InvalidUri { uri: String },

    #[error("Invalid info hash: {value}")]
    InvalidInfoHash { value: String },

    #[error("File {index} not found in torrent")]
    FileNotFound { index: usize },

    #[error("Read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("Engine rejected request for piece {index}: {reason}")]
    PieceRejected { index: PieceIndex, reason: String },

    #[error("Torrent engine is shut down")]
    Shutdown,
}
