//! Per-torrent cache of verified pieces
//!
//! Holds the pieces active streams are about to read. Its capacity follows
//! the number of streams watching the torrent, and every evicted piece is
//! reported to the engine so it stops being tracked and downloaded.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use super::RecencyCache;
use crate::engine::{PieceIndex, TorrentHandle};

/// Receives the index of every piece dropped from a [`PieceCache`].
pub trait EvictionHook: Send + Sync {
    fn piece_evicted(&self, index: PieceIndex);
}

/// Tells the engine an evicted piece is gone: marks it unverified and
/// deselects it. Failures are logged and swallowed.
pub struct EngineEvictionHook {
    handle: Arc<dyn TorrentHandle>,
}

impl EngineEvictionHook {
    pub fn new(handle: Arc<dyn TorrentHandle>) -> Self {
        Self { handle }
    }
}

impl EvictionHook for EngineEvictionHook {
    fn piece_evicted(&self, index: PieceIndex) {
        if let Err(e) = self.handle.mark_unverified(index) {
            warn!(
                "Failed to mark piece {} of {} unverified: {}",
                index,
                self.handle.info_hash(),
                e
            );
        }

        if let Err(e) = self.handle.deselect(index) {
            warn!(
                "Failed to deselect piece {} of {}: {}",
                index,
                self.handle.info_hash(),
                e
            );
        }
    }
}

/// Occupancy snapshot for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PieceCacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub memory_bytes: u64,
}

/// Number of pieces a torrent may keep resident.
///
/// Half of each stream's memory limit is left as read-ahead slack, and an
/// unwatched torrent is sized as if it had one stream.
pub fn capacity_for(active_streams: usize, piece_length: u64, memory_limit: u64) -> usize {
    let pieces_per_stream = memory_limit / piece_length.max(1) / 2;
    active_streams.max(1) * pieces_per_stream as usize
}

/// Piece index to piece bytes for one torrent.
pub struct PieceCache {
    pieces: RecencyCache<PieceIndex, Bytes>,
    piece_length: u64,
    hook: Arc<dyn EvictionHook>,
}

impl PieceCache {
    /// Creates an empty cache with zero capacity.
    pub fn new(piece_length: u64, hook: Arc<dyn EvictionHook>) -> Self {
        Self {
            pieces: RecencyCache::new(0),
            piece_length,
            hook,
        }
    }

    /// Stores a piece, reporting whatever it displaced.
    pub fn store(&mut self, index: PieceIndex, data: Bytes) {
        if let Some(evicted) = self.pieces.put(index, data) {
            self.hook.piece_evicted(evicted);
        }

        debug!(
            "Piece stored, index={}, capacity={}, memory={}",
            index,
            self.capacity_usage(),
            self.memory_usage()
        );
    }

    /// Reads a piece and marks it most recently used.
    pub fn fetch(&mut self, index: PieceIndex) -> Option<Bytes> {
        let piece = self.pieces.get(&index).cloned();

        if piece.is_some() {
            debug!(
                "Piece retrieved, index={}, capacity={}, memory={}",
                index,
                self.capacity_usage(),
                self.memory_usage()
            );
        }
        piece
    }

    /// Reads the `range` sub-slice of a piece, or the whole piece.
    pub fn fetch_range(&mut self, index: PieceIndex, range: Option<Range<usize>>) -> Option<Bytes> {
        let piece = self.fetch(index)?;
        match range {
            None => Some(piece),
            Some(range) if range.start <= range.end && range.end <= piece.len() => {
                Some(piece.slice(range))
            }
            Some(_) => None,
        }
    }

    pub fn contains(&self, index: PieceIndex) -> bool {
        self.pieces.has(&index)
    }

    /// Resizes for the current number of streams and reports every piece
    /// that no longer fits. Returns the new capacity.
    pub fn recompute_capacity(&mut self, active_streams: usize, memory_limit: u64) -> usize {
        let capacity = capacity_for(active_streams, self.piece_length, memory_limit);

        for evicted in self.pieces.set_capacity(capacity) {
            self.hook.piece_evicted(evicted);
        }

        debug!(
            "Piece cache resized for {} streams, capacity={}",
            active_streams,
            self.capacity_usage()
        );
        capacity
    }

    /// Drops every resident piece without notifying the engine.
    pub fn clear(&mut self) -> usize {
        self.pieces.clear().len()
    }

    pub fn capacity(&self) -> usize {
        self.pieces.capacity()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Resident and maximum piece count as `resident/capacity`.
    pub fn capacity_usage(&self) -> String {
        format!("{}/{}", self.pieces.len(), self.pieces.capacity())
    }

    /// Bytes held by resident pieces.
    pub fn memory_usage(&self) -> u64 {
        self.pieces.iter().map(|(_, piece)| piece.len() as u64).sum()
    }

    pub fn stats(&self) -> PieceCacheStats {
        PieceCacheStats {
            capacity: self.capacity(),
            resident: self.len(),
            memory_bytes: self.memory_usage(),
        }
    }
}
