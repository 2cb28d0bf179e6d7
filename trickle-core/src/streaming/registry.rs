//! Registry of watched torrents and their streams
//!
//! One record per registered torrent owns its piece cache, its live streams
//! and its speed history. Stream count changes and the capacity
//! recomputation they trigger happen under that record's own lock, so
//! streams of unrelated torrents never contend. Lock order is always the
//! record map first, then a record's state, then the teardown table.
//!
//! A torrent being destroyed leaves the map before the engine is asked to
//! destroy it and stays in the teardown table until the engine is done.
//! The same torrent cannot be registered again in between.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::info::TorrentInfo;
use super::speed::{SpeedHistory, SpeedSample};
use super::{StreamingError, StreamingResult};
use crate::cache::{EngineEvictionHook, PieceCache, PieceCacheStats};
use crate::config::StreamingConfig;
use crate::engine::{InfoHash, PieceIndex, PieceStore, TorrentFile, TorrentHandle};

/// One viewer session reading files of a torrent.
///
/// Stays registered while bytes keep flowing; `refresh` must be called for
/// every delivered block or the stream is dropped after the idle timeout.
pub struct Stream {
    id: String,
    info_hash: InfoHash,
    files: Mutex<HashSet<String>>,
    deadline: Mutex<Instant>,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl Stream {
    fn new(id: String, info_hash: InfoHash, idle_timeout: Duration) -> Self {
        Self {
            id,
            info_hash,
            files: Mutex::new(HashSet::new()),
            deadline: Mutex::new(Instant::now() + idle_timeout),
            idle_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Pushes the idle deadline a full idle timeout into the future.
    pub fn refresh(&self) {
        *self.deadline.lock() = Instant::now() + self.idle_timeout;
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Whether this stream has read the file at `path`.
    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().contains(path)
    }

    /// Paths of every file this stream has read, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.files.lock().iter().cloned().collect();
        files.sort();
        files
    }

    /// Whether the stream has been unregistered.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn touch_file(&self, path: &str) {
        self.files.lock().insert(path.to_string());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct TorrentRecord {
    handle: Arc<dyn TorrentHandle>,
    sequence: u64,
    state: Mutex<TorrentState>,
    speeds: Mutex<SpeedHistory>,
}

struct TorrentState {
    cache: PieceCache,
    streams: HashMap<String, Arc<Stream>>,
    /// Set while the torrent has no streams
    idle_since: Option<Instant>,
    /// Set once the record is torn down; a retired record accepts nothing
    retired: bool,
}

impl TorrentRecord {
    fn retire(&self) {
        let mut state = self.state.lock();
        state.retired = true;
        for (_, stream) in state.streams.drain() {
            stream.close();
        }
        state.cache.clear();
    }

    fn info(&self) -> TorrentInfo {
        let (streams, cache) = {
            let state = self.state.lock();
            let streams: Vec<Arc<Stream>> = state.streams.values().cloned().collect();
            (streams, state.cache.stats())
        };
        let history = self.speeds.lock().samples();
        TorrentInfo::new(self.handle.as_ref(), &streams, cache, history)
    }
}

/// Piece storage handed to the engine, backed by a record's piece cache.
///
/// Holds the record weakly so the engine handle never keeps a removed
/// record alive.
struct CachePieceStore {
    record: Weak<TorrentRecord>,
}

impl PieceStore for CachePieceStore {
    fn put(&self, index: PieceIndex, data: Bytes) {
        let Some(record) = self.record.upgrade() else {
            debug!("Dropping piece {} for a removed torrent", index);
            return;
        };

        let mut state = record.state.lock();
        if !state.retired {
            state.cache.store(index, data);
        }
    }

    fn get(&self, index: PieceIndex, range: Option<Range<usize>>) -> Option<Bytes> {
        let record = self.record.upgrade()?;
        let mut state = record.state.lock();
        state.cache.fetch_range(index, range)
    }
}

struct RegistryInner {
    records: RwLock<HashMap<InfoHash, Arc<TorrentRecord>>>,
    config: StreamingConfig,
    history_depth: usize,
    next_sequence: AtomicU64,
    sampler: Mutex<Option<JoinHandle<()>>>,
    /// Torrents the engine is still destroying; flips to true when done
    teardowns: Mutex<HashMap<InfoHash, watch::Receiver<bool>>>,
}

/// Tracks registered torrents, their streams and their piece caches.
///
/// Cheap to clone; clones share the same registry. Background timers hold
/// the registry weakly and stop once it is dropped.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new(config: StreamingConfig, history_depth: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                records: RwLock::new(HashMap::new()),
                config,
                history_depth,
                next_sequence: AtomicU64::new(0),
                sampler: Mutex::new(None),
                teardowns: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    /// Registers a torrent and attaches its piece cache to the engine.
    ///
    /// Returns false if the torrent was already registered or is still
    /// being destroyed; see [`StreamRegistry::wait_for_teardown`]. The
    /// removal grace timer starts immediately so a torrent nobody streams
    /// is reclaimed too.
    pub fn register_torrent(&self, handle: Arc<dyn TorrentHandle>) -> bool {
        let info_hash = handle.info_hash();

        let record = {
            let mut records = self.inner.records.write();
            if records.contains_key(&info_hash) {
                return false;
            }
            if self.inner.teardowns.lock().contains_key(&info_hash) {
                debug!("Torrent {} is still being destroyed, not registering", info_hash);
                return false;
            }
            let record = self.new_record(Arc::clone(&handle));
            records.insert(info_hash, Arc::clone(&record));
            record
        };

        handle.attach_store(Arc::new(CachePieceStore {
            record: Arc::downgrade(&record),
        }));

        info!("Torrent added: {} ({})", handle.name(), info_hash);
        self.arm_removal_timer(&record);
        true
    }

    /// Removes a torrent immediately, whatever its stream count.
    ///
    /// Returns false if it was not registered. The engine torrent is left
    /// alone; destroying it is the caller's decision.
    pub fn unregister_torrent(&self, handle: &dyn TorrentHandle) -> bool {
        let info_hash = handle.info_hash();
        let Some(record) = self.inner.records.write().remove(&info_hash) else {
            return false;
        };

        record.retire();
        info!("Torrent removed: {} ({})", handle.name(), info_hash);
        true
    }

    /// Unregisters a torrent and destroys it in the engine.
    ///
    /// The torrent is unregistered even if the engine fails to destroy it.
    /// Until the engine returns it cannot be registered again.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotRegistered` - If the torrent is not registered
    /// - `StreamingError::Engine` - If the engine failed to destroy it
    pub async fn destroy_torrent(&self, info_hash: InfoHash) -> StreamingResult<()> {
        let (record, teardown) = {
            let mut records = self.inner.records.write();
            let record = records
                .remove(&info_hash)
                .ok_or(StreamingError::NotRegistered { info_hash })?;
            record.retire();
            let teardown = self.begin_teardown(info_hash);
            (record, teardown)
        };
        info!("Torrent removed: {} ({})", record.handle.name(), info_hash);

        let destroyed = record.handle.destroy().await;
        self.finish_teardown(info_hash, teardown);
        destroyed?;
        Ok(())
    }

    /// Whether the engine is still destroying a torrent torn down here.
    pub fn is_tearing_down(&self, info_hash: InfoHash) -> bool {
        self.inner.teardowns.lock().contains_key(&info_hash)
    }

    /// Waits until a teardown of `info_hash` in progress has finished.
    ///
    /// Returns false right away if there is none. A handle obtained before
    /// the teardown finished points at the destroyed torrent and must be
    /// fetched from the engine again.
    pub async fn wait_for_teardown(&self, info_hash: InfoHash) -> bool {
        let pending = self.inner.teardowns.lock().get(&info_hash).cloned();
        let Some(mut pending) = pending else {
            return false;
        };

        // a dropped sender also means the teardown is over
        let _ = pending.wait_for(|done| *done).await;
        true
    }

    /// Registers or refreshes the stream `stream_id` reading `file`.
    ///
    /// A new stream grows the torrent's piece cache. The returned stream
    /// must be refreshed for every block delivered to the client.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotRegistered` - If the torrent is not registered
    pub fn register_stream(
        &self,
        stream_id: &str,
        handle: &dyn TorrentHandle,
        file: &TorrentFile,
    ) -> StreamingResult<Arc<Stream>> {
        let info_hash = handle.info_hash();
        let record = self
            .record(info_hash)
            .ok_or(StreamingError::NotRegistered { info_hash })?;

        let stream = {
            let mut state = record.state.lock();
            if state.retired {
                return Err(StreamingError::NotRegistered { info_hash });
            }

            let existing = state.streams.get(stream_id).cloned();
            match existing {
                Some(stream) => stream,
                None => {
                    let stream = Arc::new(Stream::new(
                        stream_id.to_string(),
                        info_hash,
                        self.inner.config.idle_timeout,
                    ));
                    state
                        .streams
                        .insert(stream_id.to_string(), Arc::clone(&stream));
                    state.idle_since = None;

                    let active = state.streams.len();
                    state
                        .cache
                        .recompute_capacity(active, self.inner.config.memory_limit);

                    info!("Stream started: {} ({})", handle.name(), stream_id);
                    self.spawn_idle_watchdog(&stream);
                    stream
                }
            }
        };

        stream.touch_file(&file.path);
        stream.refresh();
        Ok(stream)
    }

    /// Unregisters a stream, shrinking the torrent's piece cache.
    ///
    /// When the last stream goes, the removal grace timer starts. Returns
    /// false if the stream was not registered.
    pub fn unregister_stream(&self, stream_id: &str, handle: &dyn TorrentHandle) -> bool {
        match self.record(handle.info_hash()) {
            Some(record) => self.remove_stream(&record, stream_id, None),
            None => false,
        }
    }

    pub fn is_registered(&self, info_hash: InfoHash) -> bool {
        self.inner.records.read().contains_key(&info_hash)
    }

    /// Number of registered torrents.
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    pub fn handle(&self, info_hash: InfoHash) -> Option<Arc<dyn TorrentHandle>> {
        self.record(info_hash)
            .map(|record| Arc::clone(&record.handle))
    }

    /// Handles of every registered torrent, most recently registered first.
    pub fn handles(&self) -> Vec<Arc<dyn TorrentHandle>> {
        self.records_newest_first()
            .into_iter()
            .map(|record| Arc::clone(&record.handle))
            .collect()
    }

    /// Live streams of a torrent.
    pub fn streams(&self, info_hash: InfoHash) -> Vec<Arc<Stream>> {
        self.record(info_hash)
            .map(|record| record.state.lock().streams.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stream_count(&self, info_hash: InfoHash) -> Option<usize> {
        self.record(info_hash)
            .map(|record| record.state.lock().streams.len())
    }

    pub fn cache_stats(&self, info_hash: InfoHash) -> Option<PieceCacheStats> {
        self.record(info_hash)
            .map(|record| record.state.lock().cache.stats())
    }

    /// Speed samples of a torrent in chronological order.
    pub fn speed_history(&self, info_hash: InfoHash) -> Vec<SpeedSample> {
        self.record(info_hash)
            .map(|record| record.speeds.lock().samples())
            .unwrap_or_default()
    }

    /// Display snapshot of one torrent.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotRegistered` - If the torrent is not registered
    pub fn torrent_info(&self, info_hash: InfoHash) -> StreamingResult<TorrentInfo> {
        self.record(info_hash)
            .map(|record| record.info())
            .ok_or(StreamingError::NotRegistered { info_hash })
    }

    /// Display snapshots of every torrent, most recently registered first.
    pub fn torrent_infos(&self) -> Vec<TorrentInfo> {
        self.records_newest_first()
            .iter()
            .map(|record| record.info())
            .collect()
    }

    /// Appends the current rates of every registered torrent to its history.
    pub fn sample_speeds(&self) {
        let records: Vec<Arc<TorrentRecord>> =
            self.inner.records.read().values().cloned().collect();
        let now = Utc::now();

        for record in records {
            let stats = record.handle.stats();
            record
                .speeds
                .lock()
                .record(SpeedSample::from_stats(now, &stats));
        }
    }

    /// Starts sampling speeds every `period`, replacing any running sampler.
    pub fn spawn_speed_sampler(&self, period: Duration) {
        let registry = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                StreamRegistry { inner }.sample_speeds();
            }
        });

        if let Some(previous) = self.inner.sampler.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stops the sampler and releases every record.
    ///
    /// Returns the handles that were registered so the caller can destroy
    /// them. Pending timers find their records gone and exit.
    pub fn shutdown(&self) -> Vec<Arc<dyn TorrentHandle>> {
        if let Some(sampler) = self.inner.sampler.lock().take() {
            sampler.abort();
        }

        let records: Vec<Arc<TorrentRecord>> = self
            .inner
            .records
            .write()
            .drain()
            .map(|(_, record)| record)
            .collect();

        for record in &records {
            record.retire();
        }

        info!("Stream registry shut down, released {} torrents", records.len());
        records
            .into_iter()
            .map(|record| Arc::clone(&record.handle))
            .collect()
    }

    fn begin_teardown(&self, info_hash: InfoHash) -> watch::Sender<bool> {
        let (done, pending) = watch::channel(false);
        self.inner.teardowns.lock().insert(info_hash, pending);
        done
    }

    fn finish_teardown(&self, info_hash: InfoHash, done: watch::Sender<bool>) {
        self.inner.teardowns.lock().remove(&info_hash);
        done.send_replace(true);
    }

    fn record(&self, info_hash: InfoHash) -> Option<Arc<TorrentRecord>> {
        self.inner.records.read().get(&info_hash).cloned()
    }

    fn records_newest_first(&self) -> Vec<Arc<TorrentRecord>> {
        let mut records: Vec<Arc<TorrentRecord>> =
            self.inner.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        records
    }

    fn new_record(&self, handle: Arc<dyn TorrentHandle>) -> Arc<TorrentRecord> {
        let hook = Arc::new(EngineEvictionHook::new(Arc::clone(&handle)));
        let mut cache = PieceCache::new(handle.piece_length(), hook);
        cache.recompute_capacity(0, self.inner.config.memory_limit);

        Arc::new(TorrentRecord {
            handle,
            sequence: self.inner.next_sequence.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TorrentState {
                cache,
                streams: HashMap::new(),
                idle_since: Some(Instant::now()),
                retired: false,
            }),
            speeds: Mutex::new(SpeedHistory::new(self.inner.history_depth)),
        })
    }

    /// Removes `stream_id`, or only `expected` if given and still current.
    fn remove_stream(
        &self,
        record: &Arc<TorrentRecord>,
        stream_id: &str,
        expected: Option<&Arc<Stream>>,
    ) -> bool {
        let now_unwatched = {
            let mut state = record.state.lock();
            if state.retired {
                return false;
            }

            let is_current = match (state.streams.get(stream_id), expected) {
                (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !is_current {
                return false;
            }

            if let Some(stream) = state.streams.remove(stream_id) {
                stream.close();
            }

            let active = state.streams.len();
            state
                .cache
                .recompute_capacity(active, self.inner.config.memory_limit);
            info!("Stream ended: {} ({})", record.handle.name(), stream_id);

            if active == 0 {
                state.idle_since = Some(Instant::now());
            }
            active == 0
        };

        if now_unwatched {
            self.arm_removal_timer(record);
        }
        true
    }

    fn spawn_idle_watchdog(&self, stream: &Arc<Stream>) {
        let registry = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(stream);

        tokio::spawn(async move {
            loop {
                let deadline = match watched.upgrade() {
                    Some(stream) if !stream.is_closed() => stream.deadline(),
                    _ => return,
                };
                tokio::time::sleep_until(deadline).await;

                let Some(stream) = watched.upgrade() else {
                    return;
                };
                if stream.is_closed() {
                    return;
                }
                if stream.deadline() > Instant::now() {
                    continue;
                }

                let Some(inner) = registry.upgrade() else {
                    return;
                };
                let registry = StreamRegistry { inner };
                if let Some(record) = registry.record(stream.info_hash()) {
                    if registry.remove_stream(&record, stream.id(), Some(&stream)) {
                        debug!(
                            "Stream {} idle for {:?}, unregistered",
                            stream.id(),
                            registry.inner.config.idle_timeout
                        );
                    }
                }
                return;
            }
        });
    }

    fn arm_removal_timer(&self, record: &Arc<TorrentRecord>) {
        let registry = Arc::downgrade(&self.inner);
        let record = Arc::downgrade(record);
        let grace = self.inner.config.remove_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let (Some(inner), Some(record)) = (registry.upgrade(), record.upgrade()) else {
                return;
            };
            StreamRegistry { inner }
                .reap_if_unwatched(record, grace)
                .await;
        });
    }

    /// Destroys the torrent if it has had no streams for the whole grace
    /// period. Checked when the timer fires rather than cancelled on
    /// re-registration.
    async fn reap_if_unwatched(&self, record: Arc<TorrentRecord>, grace: Duration) {
        let handle = Arc::clone(&record.handle);
        let info_hash = handle.info_hash();

        let teardown = {
            let mut records = self.inner.records.write();
            if !records
                .get(&info_hash)
                .is_some_and(|current| Arc::ptr_eq(current, &record))
            {
                return;
            }

            let mut state = record.state.lock();
            let unwatched = state.streams.is_empty()
                && state
                    .idle_since
                    .is_some_and(|since| since.elapsed() >= grace);
            if !unwatched {
                return;
            }
            records.remove(&info_hash);
            state.retired = true;
            state.cache.clear();
            drop(state);

            self.begin_teardown(info_hash)
        };

        if let Err(e) = handle.destroy().await {
            warn!("Failed to destroy torrent {}: {}", info_hash, e);
        }
        self.finish_teardown(info_hash, teardown);

        info!(
            "Torrent removed after {:?} unwatched: {} ({})",
            grace,
            handle.name(),
            info_hash
        );
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::engine::memory::MemoryTorrent;

    const PIECE: u64 = 1024;

    fn streaming_config() -> StreamingConfig {
        StreamingConfig {
            // four pieces per stream
            memory_limit: 8 * PIECE,
            idle_timeout: Duration::from_secs(5),
            remove_timeout: Duration::from_secs(10),
        }
    }

    fn fixture() -> (StreamRegistry, Arc<MemoryTorrent>) {
        let registry = StreamRegistry::new(streaming_config(), 5);
        let torrent = MemoryTorrent::new(
            "show",
            PIECE,
            vec![
                ("show/e01.mkv".to_string(), Bytes::from(vec![1u8; 32 * PIECE as usize])),
                ("show/e01.srt".to_string(), Bytes::from(vec![2u8; 512])),
            ],
        );
        (registry, torrent)
    }

    fn file(torrent: &MemoryTorrent, index: usize) -> TorrentFile {
        torrent.files()[index].clone()
    }

    #[tokio::test]
    async fn test_register_torrent_is_idempotent() {
        let (registry, torrent) = fixture();

        assert!(registry.register_torrent(torrent.clone()));
        assert!(!registry.register_torrent(torrent.clone()));

        assert!(torrent.has_store());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stream_count(torrent.info_hash()), Some(0));
        assert_eq!(registry.cache_stats(torrent.info_hash()).unwrap().capacity, 4);
    }

    #[tokio::test]
    async fn test_register_stream_requires_registered_torrent() {
        let (registry, torrent) = fixture();

        let result = registry.register_stream("s1", torrent.as_ref(), &file(&torrent, 0));

        assert!(matches!(
            result,
            Err(StreamingError::NotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_count_drives_cache_capacity() {
        let (registry, torrent) = fixture();
        let info_hash = torrent.info_hash();
        registry.register_torrent(torrent.clone());
        let capacity = || registry.cache_stats(info_hash).unwrap().capacity;

        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        let one_stream = capacity();
        registry
            .register_stream("s2", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        let two_streams = capacity();

        assert_eq!(one_stream, 4);
        assert!(two_streams >= one_stream);
        assert_eq!(two_streams, 8);

        // same stream id again does not count twice
        registry
            .register_stream("s2", torrent.as_ref(), &file(&torrent, 1))
            .unwrap();
        assert_eq!(registry.stream_count(info_hash), Some(2));

        assert!(registry.unregister_stream("s1", torrent.as_ref()));
        assert!(registry.unregister_stream("s2", torrent.as_ref()));
        assert!(!registry.unregister_stream("s2", torrent.as_ref()));
        assert_eq!(capacity(), 4);
    }

    #[tokio::test]
    async fn test_shrinking_cache_notifies_engine() {
        let (registry, torrent) = fixture();
        let info_hash = torrent.info_hash();
        registry.register_torrent(torrent.clone());
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        registry
            .register_stream("s2", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();

        let blocks: Vec<Bytes> = torrent
            .read_range(0, 0, 8 * PIECE - 1)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(blocks.len(), 8);
        assert_eq!(registry.cache_stats(info_hash).unwrap().resident, 8);
        assert!(torrent.unverified_pieces().is_empty());

        registry.unregister_stream("s2", torrent.as_ref());

        let evicted: Vec<u32> = torrent.unverified_pieces().iter().map(|p| p.0).collect();
        assert_eq!(evicted, vec![0, 1, 2, 3]);
        assert_eq!(torrent.deselected_pieces(), torrent.unverified_pieces());
        assert_eq!(registry.cache_stats(info_hash).unwrap().resident, 4);
    }

    #[tokio::test]
    async fn test_storing_past_capacity_evicts_through_engine() {
        let (registry, torrent) = fixture();
        let info_hash = torrent.info_hash();
        registry.register_torrent(torrent.clone());
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();

        // each put past four pieces calls back into the torrent mid-read
        let blocks: Vec<Bytes> = torrent
            .read_range(0, 0, 6 * PIECE - 1)
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(blocks.len(), 6);
        let evicted: Vec<u32> = torrent.unverified_pieces().iter().map(|p| p.0).collect();
        assert_eq!(evicted, vec![0, 1]);
        assert_eq!(torrent.deselected_pieces(), torrent.unverified_pieces());
        assert_eq!(registry.cache_stats(info_hash).unwrap().resident, 4);
    }

    #[tokio::test]
    async fn test_torrent_info_counts_streams_per_file() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 1))
            .unwrap();
        registry
            .register_stream("s2", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();

        let info = registry.torrent_info(torrent.info_hash()).unwrap();

        assert_eq!(info.streams, 2);
        assert_eq!(info.file("show/e01.mkv").unwrap().streams, 2);
        assert_eq!(info.file("show/e01.srt").unwrap().streams, 1);
    }

    #[tokio::test]
    async fn test_unregister_torrent_is_immediate() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());
        let stream = registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();

        assert!(registry.unregister_torrent(torrent.as_ref()));

        assert!(!registry.is_registered(torrent.info_hash()));
        assert!(stream.is_closed());
        assert!(!registry.unregister_torrent(torrent.as_ref()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_is_unregistered() {
        let (registry, torrent) = fixture();
        let info_hash = torrent.info_hash();
        registry.register_torrent(torrent.clone());
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        let stream = registry
            .register_stream("s2", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        stream.refresh();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(registry.stream_count(info_hash), Some(1));
        assert_eq!(registry.streams(info_hash)[0].id(), "s2");
        assert_eq!(registry.cache_stats(info_hash).unwrap().capacity, 4);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(registry.stream_count(info_hash), Some(0));
        assert!(stream.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatched_torrent_destroyed_after_grace() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        registry.unregister_stream("s1", torrent.as_ref());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(registry.is_registered(torrent.info_hash()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!registry.is_registered(torrent.info_hash()));
        assert_eq!(torrent.destroy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_prevents_removal() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        registry.unregister_stream("s1", torrent.as_ref());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stream = registry
            .register_stream("s2", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            stream.refresh();
        }

        assert!(registry.is_registered(torrent.info_hash()));
        assert_eq!(torrent.destroy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reconnect_does_not_shorten_grace() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());
        registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        registry.unregister_stream("s1", torrent.as_ref());

        tokio::time::sleep(Duration::from_secs(6)).await;
        registry
            .register_stream("s2", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        registry.unregister_stream("s2", torrent.as_ref());

        // first timer fires at 10s, only 4s after the torrent went unwatched again
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.is_registered(torrent.info_hash()));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!registry.is_registered(torrent.info_hash()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_streamed_torrent_is_reclaimed() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(registry.is_empty());
        assert!(torrent.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_torrent_cannot_return_while_engine_destroys_it() {
        let (registry, torrent) = fixture();
        let info_hash = torrent.info_hash();
        torrent.delay_destroy(Duration::from_secs(2));
        registry.register_torrent(torrent.clone());

        // grace expires at 10s, the engine needs until 12s
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(!registry.is_registered(info_hash));
        assert!(registry.is_tearing_down(info_hash));
        assert!(!torrent.is_destroyed());

        assert!(!registry.register_torrent(torrent.clone()));
        assert!(matches!(
            registry.register_stream("viewer", torrent.as_ref(), &file(&torrent, 0)),
            Err(StreamingError::NotRegistered { .. })
        ));

        assert!(registry.wait_for_teardown(info_hash).await);
        assert!(torrent.is_destroyed());
        assert!(!registry.is_tearing_down(info_hash));
        assert!(!registry.wait_for_teardown(info_hash).await);

        assert!(registry.register_torrent(torrent.clone()));
        assert_eq!(registry.stream_count(info_hash), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_torrent_unregisters_before_engine_returns() {
        let (registry, torrent) = fixture();
        let info_hash = torrent.info_hash();
        registry.register_torrent(torrent.clone());
        let stream = registry
            .register_stream("s1", torrent.as_ref(), &file(&torrent, 0))
            .unwrap();
        torrent.delay_destroy(Duration::from_secs(1));

        let destroying = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.destroy_torrent(info_hash).await })
        };
        tokio::task::yield_now().await;

        assert!(!registry.is_registered(info_hash));
        assert!(stream.is_closed());
        assert!(!registry.register_torrent(torrent.clone()));

        destroying.await.unwrap().unwrap();
        assert!(torrent.is_destroyed());
        assert!(registry.register_torrent(torrent.clone()));
        assert!(matches!(
            registry.destroy_torrent(InfoHash::new([0u8; 20])).await,
            Err(StreamingError::NotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_sample_speeds_records_rates() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());
        torrent.set_rates(4096, 1024);

        registry.sample_speeds();
        torrent.set_rates(8192, 0);
        registry.sample_speeds();

        let history = registry.speed_history(torrent.info_hash());
        let rates: Vec<(u64, u64)> = history.iter().map(|s| (s.download, s.upload)).collect();
        assert_eq!(rates, vec![(4096, 1024), (8192, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_sampler_runs_on_interval() {
        let (registry, torrent) = fixture();
        registry.register_torrent(torrent.clone());

        registry.spawn_speed_sampler(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;

        // immediate first tick plus one per second
        assert_eq!(registry.speed_history(torrent.info_hash()).len(), 4);

        registry.shutdown();
        assert!(registry.is_empty());
    }
}
