//! In-memory torrent engine
//!
//! Serves torrents whose content is already held in memory. A piece is
//! "downloaded" from that content the first time it is read and handed to
//! the attached piece store, so caching and eviction behave as they would
//! against a real swarm. The CLI uses it to serve a local library and the
//! tests use it as a recording fake.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};

use super::{
    BlockStream, EngineError, InfoHash, PieceIndex, PieceStore, TorrentEngine, TorrentFile,
    TorrentHandle, TorrentStats,
};

/// Engine resolving URIs against torrents inserted ahead of time.
///
/// Unknown URIs never resolve, like a magnet link with no reachable peers.
#[derive(Default)]
pub struct MemoryEngine {
    torrents: RwLock<HashMap<String, Arc<MemoryTorrent>>>,
    cancelled: Mutex<Vec<String>>,
}

impl MemoryEngine {
    /// Creates an engine with no torrents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `torrent` resolvable under `uri`.
    pub fn insert(&self, uri: impl Into<String>, torrent: Arc<MemoryTorrent>) {
        self.torrents.write().insert(uri.into(), torrent);
    }

    /// Looks up the torrent registered under `uri`.
    pub fn torrent(&self, uri: &str) -> Option<Arc<MemoryTorrent>> {
        self.torrents.read().get(uri).cloned()
    }

    /// URIs of every known torrent, sorted.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.torrents.read().keys().cloned().collect();
        uris.sort();
        uris
    }

    /// URIs whose add was abandoned, in call order.
    pub fn cancelled_adds(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl TorrentEngine for MemoryEngine {
    async fn add_torrent(&self, uri: &str) -> Result<Arc<dyn TorrentHandle>, EngineError> {
        if uri.trim().is_empty() {
            return Err(EngineError::InvalidUri {
                uri: uri.to_string(),
            });
        }

        let torrent = self.torrent(uri);
        match torrent {
            Some(torrent) => {
                torrent.destroyed.store(false, Ordering::SeqCst);
                Ok(torrent)
            }
            None => std::future::pending().await,
        }
    }

    async fn cancel_add(&self, uri: &str) {
        self.cancelled.lock().push(uri.to_string());
    }
}

#[derive(Default)]
struct PieceState {
    have: BTreeSet<u32>,
    downloaded: u64,
    unverified: Vec<PieceIndex>,
    deselected: Vec<PieceIndex>,
}

#[derive(Default, Clone, Copy)]
struct Rates {
    download: u64,
    upload: u64,
    peers: usize,
}

/// Torrent whose content lives in memory.
pub struct MemoryTorrent {
    info_hash: InfoHash,
    name: String,
    piece_length: u64,
    files: Vec<TorrentFile>,
    content: Bytes,
    store: RwLock<Option<Arc<dyn PieceStore>>>,
    pieces: Arc<Mutex<PieceState>>,
    rates: Mutex<Rates>,
    destroyed: AtomicBool,
    destroy_count: AtomicUsize,
    destroy_delay: Mutex<Duration>,
    reject_evictions: AtomicBool,
    fail_reads: Arc<AtomicBool>,
}

impl MemoryTorrent {
    /// Builds a torrent from `(path, content)` pairs laid out back to back.
    pub fn new(name: impl Into<String>, piece_length: u64, files: Vec<(String, Bytes)>) -> Arc<Self> {
        let name = name.into();
        let piece_length = piece_length.max(1);

        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        hasher.update(piece_length.to_be_bytes());

        let mut content = Vec::new();
        let mut torrent_files = Vec::with_capacity(files.len());
        for (path, data) in files {
            hasher.update(path.as_bytes());
            hasher.update((data.len() as u64).to_be_bytes());

            let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();
            torrent_files.push(TorrentFile {
                name: file_name,
                path,
                offset: content.len() as u64,
                length: data.len() as u64,
            });
            content.extend_from_slice(&data);
        }

        Arc::new(Self {
            info_hash: InfoHash::new(hasher.finalize().into()),
            name,
            piece_length,
            files: torrent_files,
            content: Bytes::from(content),
            store: RwLock::new(None),
            pieces: Arc::new(Mutex::new(PieceState::default())),
            rates: Mutex::new(Rates::default()),
            destroyed: AtomicBool::new(false),
            destroy_count: AtomicUsize::new(0),
            destroy_delay: Mutex::new(Duration::ZERO),
            reject_evictions: AtomicBool::new(false),
            fail_reads: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Builds a torrent holding a single file named after the torrent.
    pub fn single_file(name: impl Into<String>, piece_length: u64, content: Bytes) -> Arc<Self> {
        let name = name.into();
        Self::new(name.clone(), piece_length, vec![(name, content)])
    }

    /// Number of pieces covering the content.
    pub fn piece_count(&self) -> u64 {
        (self.content.len() as u64).div_ceil(self.piece_length)
    }

    /// Sets the rates reported by [`TorrentHandle::stats`].
    pub fn set_rates(&self, download: u64, upload: u64) {
        let mut rates = self.rates.lock();
        rates.download = download;
        rates.upload = upload;
    }

    /// Sets the peer count reported by [`TorrentHandle::stats`].
    pub fn set_peers(&self, peers: usize) {
        self.rates.lock().peers = peers;
    }

    /// Makes every following mark-unverified and deselect call fail.
    pub fn reject_evictions(&self, reject: bool) {
        self.reject_evictions.store(reject, Ordering::SeqCst);
    }

    /// Makes `destroy` take `delay` before the torrent is gone.
    pub fn delay_destroy(&self, delay: Duration) {
        *self.destroy_delay.lock() = delay;
    }

    /// Makes every following block read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Pieces passed to `mark_unverified`, in call order.
    pub fn unverified_pieces(&self) -> Vec<PieceIndex> {
        self.pieces.lock().unverified.clone()
    }

    /// Pieces passed to `deselect`, in call order.
    pub fn deselected_pieces(&self) -> Vec<PieceIndex> {
        self.pieces.lock().deselected.clone()
    }

    /// Total bytes pulled from the backing content.
    pub fn downloaded(&self) -> u64 {
        self.pieces.lock().downloaded
    }

    /// Whether a piece store is attached.
    pub fn has_store(&self) -> bool {
        self.store.read().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroy_count.load(Ordering::SeqCst)
    }

    fn check_eviction_allowed(&self, index: PieceIndex) -> Result<(), EngineError> {
        if self.reject_evictions.load(Ordering::SeqCst) {
            return Err(EngineError::PieceRejected {
                index,
                reason: "evictions rejected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TorrentHandle for MemoryTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        self.content.len() as u64
    }

    fn piece_length(&self) -> u64 {
        self.piece_length
    }

    fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    fn stats(&self) -> TorrentStats {
        let rates = *self.rates.lock();
        let pieces = self.pieces.lock();
        let piece_count = self.piece_count();
        let progress = if piece_count == 0 {
            1.0
        } else {
            pieces.have.len() as f64 / piece_count as f64
        };

        TorrentStats {
            progress,
            downloaded: pieces.downloaded,
            uploaded: 0,
            download_rate: rates.download,
            upload_rate: rates.upload,
            peers: rates.peers,
        }
    }

    fn attach_store(&self, store: Arc<dyn PieceStore>) {
        *self.store.write() = Some(store);
    }

    fn read_range(
        &self,
        file_index: usize,
        start: u64,
        end: u64,
    ) -> Result<BlockStream, EngineError> {
        let file = self
            .files
            .get(file_index)
            .ok_or(EngineError::FileNotFound { index: file_index })?;

        if self.is_destroyed() {
            return Err(EngineError::ReadFailed {
                reason: format!("torrent {} is destroyed", self.info_hash),
            });
        }

        if start > end || end >= file.length {
            return Err(EngineError::ReadFailed {
                reason: format!(
                    "invalid range {start}-{end} for file of {} bytes",
                    file.length
                ),
            });
        }

        let reader = PieceReader {
            content: self.content.clone(),
            piece_length: self.piece_length,
            store: self.store.read().clone(),
            pieces: Arc::clone(&self.pieces),
            fail_reads: Arc::clone(&self.fail_reads),
        };
        let last = file.offset + end;

        let blocks = futures::stream::unfold(Some(file.offset + start), move |position| {
            let reader = reader.clone();
            async move {
                let position = position?;
                // Each block is a suspension point, like waiting on a peer.
                tokio::task::yield_now().await;
                match reader.read_block(position, last) {
                    Ok(block) => {
                        let next = position + block.len() as u64;
                        Some((Ok(block), (next <= last).then_some(next)))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        });

        Ok(blocks.boxed())
    }

    fn mark_unverified(&self, index: PieceIndex) -> Result<(), EngineError> {
        {
            let mut pieces = self.pieces.lock();
            pieces.unverified.push(index);
            pieces.have.remove(&index.as_u32());
        }
        self.check_eviction_allowed(index)
    }

    fn deselect(&self, index: PieceIndex) -> Result<(), EngineError> {
        self.pieces.lock().deselected.push(index);
        self.check_eviction_allowed(index)
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        let delay = *self.destroy_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.destroy_count.fetch_add(1, Ordering::SeqCst);
        *self.store.write() = None;
        Ok(())
    }
}

/// Everything a block stream needs, detached from the torrent's lifetime.
#[derive(Clone)]
struct PieceReader {
    content: Bytes,
    piece_length: u64,
    store: Option<Arc<dyn PieceStore>>,
    pieces: Arc<Mutex<PieceState>>,
    fail_reads: Arc<AtomicBool>,
}

impl PieceReader {
    /// Reads from `position` up to the end of its piece or `last`.
    fn read_block(&self, position: u64, last: u64) -> Result<Bytes, EngineError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::ReadFailed {
                reason: format!("simulated failure at byte {position}"),
            });
        }

        let index = PieceIndex::containing(position, self.piece_length);
        let piece_start = index.as_u32() as u64 * self.piece_length;
        let piece = self.fetch_piece(index, piece_start);

        let piece_last = piece_start + piece.len() as u64 - 1;
        let from = (position - piece_start) as usize;
        let to = (last.min(piece_last) - piece_start) as usize + 1;
        Ok(piece.slice(from..to))
    }

    fn fetch_piece(&self, index: PieceIndex, piece_start: u64) -> Bytes {
        if let Some(piece) = self.store.as_ref().and_then(|store| store.get(index, None)) {
            return piece;
        }

        let piece_end = (piece_start + self.piece_length).min(self.content.len() as u64);
        let piece = self.content.slice(piece_start as usize..piece_end as usize);
        {
            let mut pieces = self.pieces.lock();
            pieces.have.insert(index.as_u32());
            pieces.downloaded += piece.len() as u64;
        }

        if let Some(store) = &self.store {
            store.put(index, piece.clone());
        }
        piece
    }
}
