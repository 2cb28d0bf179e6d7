//! Display snapshots of registered torrents

use std::sync::Arc;

use serde::Serialize;

use super::registry::Stream;
use super::speed::SpeedSample;
use crate::cache::PieceCacheStats;
use crate::engine::{InfoHash, TorrentHandle};

/// Point-in-time view of one registered torrent.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentInfo {
    pub name: String,
    pub info_hash: InfoHash,
    pub size: u64,
    pub progress: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peers: usize,
    /// Active streams on the torrent
    pub streams: usize,
    pub cache: PieceCacheStats,
    pub speed_history: Vec<SpeedSample>,
    pub files: Vec<TorrentFileInfo>,
}

/// Point-in-time view of one file in a torrent.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentFileInfo {
    pub name: String,
    pub index: usize,
    pub path: String,
    pub size: u64,
    /// Active streams that have read this file
    pub streams: usize,
}

impl TorrentInfo {
    pub(crate) fn new(
        handle: &dyn TorrentHandle,
        streams: &[Arc<Stream>],
        cache: PieceCacheStats,
        speed_history: Vec<SpeedSample>,
    ) -> Self {
        let stats = handle.stats();
        let files = handle
            .files()
            .iter()
            .enumerate()
            .map(|(index, file)| TorrentFileInfo {
                name: file.name.clone(),
                index,
                path: file.path.clone(),
                size: file.length,
                streams: streams
                    .iter()
                    .filter(|stream| stream.has_file(&file.path))
                    .count(),
            })
            .collect();

        Self {
            name: handle.name().to_string(),
            info_hash: handle.info_hash(),
            size: handle.length(),
            progress: stats.progress,
            downloaded: stats.downloaded,
            uploaded: stats.uploaded,
            download_rate: stats.download_rate,
            upload_rate: stats.upload_rate,
            peers: stats.peers,
            streams: streams.len(),
            cache,
            speed_history,
            files,
        }
    }

    /// Looks up a file snapshot by path.
    pub fn file(&self, path: &str) -> Option<&TorrentFileInfo> {
        self.files.iter().find(|file| file.path == path)
    }
}
