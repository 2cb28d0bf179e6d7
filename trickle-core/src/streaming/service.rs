//! Streaming facade used by the HTTP layer
//!
//! Wires the torrent engine, the stream registry and the window planner
//! together so a request handler only deals with URIs, stream ids and range
//! headers.

use std::sync::Arc;

use tracing::{debug, warn};

use super::body::StreamBody;
use super::info::TorrentInfo;
use super::registry::StreamRegistry;
use super::window::{RangeRequest, WindowPlan, plan_window};
use super::{StreamingError, StreamingResult};
use crate::config::TrickleConfig;
use crate::engine::{InfoHash, TorrentEngine, TorrentFile, TorrentHandle, add_with_timeout};

/// Everything a handler needs to answer one ranged file request.
pub struct OpenStream {
    pub file: TorrentFile,
    pub plan: WindowPlan,
    pub body: StreamBody,
}

/// Entry point for streaming torrent files over HTTP.
#[derive(Clone)]
pub struct StreamingService {
    engine: Arc<dyn TorrentEngine>,
    registry: StreamRegistry,
    config: TrickleConfig,
}

impl StreamingService {
    pub fn new(config: TrickleConfig, engine: Arc<dyn TorrentEngine>) -> Self {
        let registry = StreamRegistry::new(config.streaming.clone(), config.speed.history_depth);
        Self {
            engine,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TrickleConfig {
        &self.config
    }

    /// Starts the speed sampler. Must be called inside a tokio runtime.
    pub fn spawn_background_tasks(&self) {
        self.registry
            .spawn_speed_sampler(self.config.speed.sample_interval);
    }

    /// Adds `uri` to the engine, if needed, and registers it.
    ///
    /// If the engine hands back a torrent that is still being destroyed,
    /// waits for the teardown and adds the URI again.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Engine` - If the add failed or timed out
    pub async fn open_torrent(&self, uri: &str) -> StreamingResult<Arc<dyn TorrentHandle>> {
        loop {
            let handle =
                add_with_timeout(self.engine.as_ref(), uri, self.config.engine.add_timeout)
                    .await?;
            let info_hash = handle.info_hash();

            if self.registry.wait_for_teardown(info_hash).await {
                debug!("Torrent {} was destroyed while adding, adding again", info_hash);
                continue;
            }
            if self.registry.register_torrent(Arc::clone(&handle))
                || self.registry.is_registered(info_hash)
            {
                return Ok(handle);
            }
        }
    }

    /// Opens one response window on file `file_index` of the torrent at `uri`.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Engine` - If the torrent could not be added or read
    /// - `StreamingError::FileNotFound` - If the file index is unknown
    /// - `StreamingError::OutOfRange` - If the range starts past the end of the file
    pub async fn open_stream(
        &self,
        uri: &str,
        stream_id: &str,
        file_index: usize,
        request: &RangeRequest,
    ) -> StreamingResult<OpenStream> {
        let handle = self.open_torrent(uri).await?;
        self.stream_file(&handle, stream_id, file_index, request)
    }

    /// Opens one response window on a torrent that is already registered.
    ///
    /// # Errors
    ///
    /// - `StreamingError::FileNotFound` - If the file index is unknown
    /// - `StreamingError::OutOfRange` - If the range starts past the end of the file
    /// - `StreamingError::NotRegistered` - If the torrent was removed meanwhile
    /// - `StreamingError::Engine` - If the engine refused the read
    pub fn stream_file(
        &self,
        handle: &Arc<dyn TorrentHandle>,
        stream_id: &str,
        file_index: usize,
        request: &RangeRequest,
    ) -> StreamingResult<OpenStream> {
        let file = handle
            .files()
            .get(file_index)
            .cloned()
            .ok_or(StreamingError::FileNotFound { index: file_index })?;

        let plan = plan_window(
            &file,
            handle.piece_length(),
            self.config.streaming.memory_limit,
            request,
        )?;

        let stream = self
            .registry
            .register_stream(stream_id, handle.as_ref(), &file)?;
        let blocks = handle.read_range(file_index, plan.start, plan.end)?;

        debug!(
            "Serving {} for stream {}: {}",
            file.path,
            stream_id,
            plan.content_range()
        );

        Ok(OpenStream {
            file,
            plan,
            body: StreamBody::new(blocks, stream),
        })
    }

    /// # Errors
    ///
    /// - `StreamingError::NotRegistered` - If the torrent is not registered
    pub fn torrent_info(&self, info_hash: InfoHash) -> StreamingResult<TorrentInfo> {
        self.registry.torrent_info(info_hash)
    }

    /// Snapshots of every registered torrent, most recently added first.
    pub fn list_torrents(&self) -> Vec<TorrentInfo> {
        self.registry.torrent_infos()
    }

    /// Forgets a torrent and destroys it in the engine.
    ///
    /// The torrent is unregistered even if the engine fails to destroy it.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotRegistered` - If the torrent is not registered
    /// - `StreamingError::Engine` - If the engine failed to destroy it
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> StreamingResult<()> {
        self.registry.destroy_torrent(info_hash).await
    }

    /// Releases every torrent and stops background tasks.
    pub async fn shutdown(&self) {
        for handle in self.registry.shutdown() {
            if let Err(e) = handle.destroy().await {
                warn!("Failed to destroy torrent {} on shutdown: {}", handle.info_hash(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::TryStreamExt;

    use super::*;
    use crate::engine::EngineError;
    use crate::engine::memory::{MemoryEngine, MemoryTorrent};

    const MIB: u64 = 1024 * 1024;

    fn service_with(torrents: &[(&str, Arc<MemoryTorrent>)]) -> (StreamingService, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        for (uri, torrent) in torrents {
            engine.insert(*uri, Arc::clone(torrent));
        }
        let service = StreamingService::new(TrickleConfig::for_testing(), engine.clone());
        (service, engine)
    }

    fn movie() -> Arc<MemoryTorrent> {
        MemoryTorrent::single_file("movie.mp4", MIB, Bytes::from(vec![7u8; 20 * MIB as usize]))
    }

    #[tokio::test]
    async fn test_full_request_is_capped_to_window() {
        let torrent = movie();
        let (service, _engine) = service_with(&[("memory:movie", torrent.clone())]);

        let open = service
            .open_stream("memory:movie", "viewer", 0, &RangeRequest::full())
            .await
            .unwrap();

        assert_eq!((open.plan.start, open.plan.end), (0, 8_388_607));
        assert_eq!(open.file.name, "movie.mp4");
        assert_eq!(service.registry().stream_count(torrent.info_hash()), Some(1));

        let bytes: Vec<Bytes> = open.body.try_collect().await.unwrap();
        let total: usize = bytes.iter().map(Bytes::len).sum();
        assert_eq!(total as u64, 8 * MIB);
    }

    #[tokio::test]
    async fn test_unknown_file_index() {
        let (service, _engine) = service_with(&[("memory:movie", movie())]);

        let result = service
            .open_stream("memory:movie", "viewer", 3, &RangeRequest::full())
            .await;

        assert!(matches!(result, Err(StreamingError::FileNotFound { index: 3 })));
    }

    #[tokio::test]
    async fn test_range_past_end_is_out_of_range() {
        let torrent = movie();
        let (service, _engine) = service_with(&[("memory:movie", torrent.clone())]);
        let request = RangeRequest::parse(Some(&format!("bytes={}-", 20 * MIB)));

        let result = service.open_stream("memory:movie", "viewer", 0, &request).await;

        assert!(matches!(
            result,
            Err(StreamingError::OutOfRange { file_length }) if file_length == 20 * MIB
        ));
        assert_eq!(service.registry().stream_count(torrent.info_hash()), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_add_times_out() {
        let (service, engine) = service_with(&[]);

        let result = service.open_torrent("magnet:?xt=urn:btih:unknown").await;

        assert!(matches!(
            result,
            Err(StreamingError::Engine(EngineError::AddTimeout { .. }))
        ));
        assert_eq!(engine.cancelled_adds(), vec!["magnet:?xt=urn:btih:unknown"]);
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_list_torrents_newest_first() {
        let first = MemoryTorrent::single_file("first.mkv", 16, Bytes::from_static(b"first file"));
        let second = MemoryTorrent::single_file("second.mkv", 16, Bytes::from_static(b"second file"));
        let (service, _engine) =
            service_with(&[("memory:first", first), ("memory:second", second)]);

        service.open_torrent("memory:first").await.unwrap();
        service.open_torrent("memory:second").await.unwrap();
        service.open_torrent("memory:first").await.unwrap();

        let names: Vec<String> = service.list_torrents().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["second.mkv", "first.mkv"]);
    }

    #[tokio::test]
    async fn test_remove_torrent_destroys_and_unregisters() {
        let torrent = movie();
        let (service, _engine) = service_with(&[("memory:movie", torrent.clone())]);
        service.open_torrent("memory:movie").await.unwrap();

        service.remove_torrent(torrent.info_hash()).await.unwrap();

        assert!(torrent.is_destroyed());
        assert!(matches!(
            service.torrent_info(torrent.info_hash()),
            Err(StreamingError::NotRegistered { .. })
        ));
        assert!(matches!(
            service.remove_torrent(torrent.info_hash()).await,
            Err(StreamingError::NotRegistered { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_during_teardown_waits_for_engine() {
        let torrent = movie();
        torrent.delay_destroy(Duration::from_secs(2));
        let (service, _engine) = service_with(&[("memory:movie", torrent.clone())]);
        let started = tokio::time::Instant::now();
        service.open_torrent("memory:movie").await.unwrap();

        // unwatched for the whole grace period, the engine is destroying it
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(service.registry().is_tearing_down(torrent.info_hash()));

        let open = service
            .open_stream("memory:movie", "viewer", 0, &RangeRequest::parse(Some("bytes=0-99")))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(12));
        assert_eq!(torrent.destroy_count(), 1);
        assert!(!torrent.is_destroyed());
        assert_eq!(service.registry().stream_count(torrent.info_hash()), Some(1));

        let bytes: Vec<Bytes> = open.body.try_collect().await.unwrap();
        let total: usize = bytes.iter().map(Bytes::len).sum();
        assert_eq!(total, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sampler_fills_history() {
        let torrent = movie();
        torrent.set_rates(1000, 10);
        let (service, _engine) = service_with(&[("memory:movie", torrent.clone())]);
        service.open_torrent("memory:movie").await.unwrap();

        service.spawn_background_tasks();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let info = service.torrent_info(torrent.info_hash()).unwrap();
        assert_eq!(info.speed_history.len(), 3);
        assert_eq!(info.download_rate, 1000);

        service.shutdown().await;
        assert!(torrent.is_destroyed());
    }
}
