use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::errors::CacheError;
use crate::models::candle::{Candle, SeriesKey};
use crate::services::hyperliquid::SnapshotSource;
use crate::services::window_store::{CandleStore, IngestOutcome};

/// Key-value store with per-entry expiry.
#[async_trait]
pub trait CandleCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl CandleCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let _: () = connection.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }
}

/// In-process cache used when no Redis is configured.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

#[async_trait]
impl CandleCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }
}

/// Where a warmed window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmSource {
    Memory,
    Cache,
    Snapshot,
    /// Nothing available; the live feed fills the window
    Empty,
}

struct CacheWrite {
    key: String,
    payload: String,
    ttl_secs: u64,
}

/// Latest unwritten window per cache key. A newer write replaces an older
/// one for the same key, so a stalled backend holds at most one per series.
#[derive(Default)]
struct PendingWrites {
    by_key: std::sync::Mutex<HashMap<String, CacheWrite>>,
    notify: Notify,
    closed: AtomicBool,
}

impl PendingWrites {
    fn put(&self, write: CacheWrite) {
        self.by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(write.key.clone(), write);
        self.notify.notify_one();
    }

    fn take(&self) -> Vec<CacheWrite> {
        self.by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, write)| write)
            .collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Wraps the candle store and mirrors every mutation to the external cache.
///
/// Writes are handed to a background task, so ingest never waits on the
/// cache. Pending writes coalesce per key. Failures are logged and the
/// in-memory window stays authoritative.
pub struct CacheSynchronizer {
    store: CandleStore,
    cache: Arc<dyn CandleCache>,
    snapshots: Arc<dyn SnapshotSource>,
    config: CacheConfig,
    snapshot_fetched: HashSet<SeriesKey>,
    pending: Arc<PendingWrites>,
    writer: JoinHandle<()>,
}

impl CacheSynchronizer {
    pub fn new(
        store: CandleStore,
        cache: Arc<dyn CandleCache>,
        snapshots: Arc<dyn SnapshotSource>,
        config: CacheConfig,
    ) -> Self {
        let pending = Arc::new(PendingWrites::default());
        let writer = tokio::spawn(write_loop(cache.clone(), pending.clone()));

        Self {
            store,
            cache,
            snapshots,
            config,
            snapshot_fetched: HashSet::new(),
            pending,
            writer,
        }
    }

    pub fn ingest(&mut self, candle: Candle, now_ms: u64) -> IngestOutcome {
        let key = candle.series_key();
        let outcome = self.store.ingest(candle, now_ms);
        if outcome.changed() {
            self.write_through(&key);
        }
        outcome
    }

    pub fn window(&self, key: &SeriesKey) -> Vec<Candle> {
        self.store.window(key)
    }

    pub fn latest(&self, key: &SeriesKey) -> Option<&Candle> {
        self.store.latest(key)
    }

    /// Seed an empty window: cache first, then a single snapshot fetch.
    pub async fn warm(&mut self, key: &SeriesKey, now_ms: u64) -> WarmSource {
        if !self.store.is_empty(key) {
            return WarmSource::Memory;
        }

        if let Some(candles) = self.read_cached(key).await {
            let seeded = self.seed(key, candles, now_ms);
            if seeded > 0 {
                tracing::info!("[{}] warmed {} candles from cache", key, seeded);
                return WarmSource::Cache;
            }
        }

        if !self.snapshot_fetched.insert(key.clone()) {
            return WarmSource::Empty;
        }

        let max_candles = self.store.policy().max_candles;
        match self.snapshots.fetch_snapshot(key, max_candles, now_ms).await {
            Ok(candles) => {
                let seeded = self.seed(key, candles, now_ms);
                if seeded == 0 {
                    tracing::warn!("[{}] snapshot had no usable candles", key);
                    return WarmSource::Empty;
                }
                self.write_through(key);
                tracing::info!("[{}] warmed {} candles from snapshot", key, seeded);
                WarmSource::Snapshot
            }
            Err(e) => {
                tracing::warn!("[{}] snapshot fetch failed: {}", key, e);
                WarmSource::Empty
            }
        }
    }

    /// Flush pending cache writes and stop the writer.
    pub async fn shutdown(self) {
        self.pending.close();
        if let Err(e) = self.writer.await {
            tracing::error!("cache writer task failed: {}", e);
        }
    }

    async fn read_cached(&self, key: &SeriesKey) -> Option<Vec<Candle>> {
        let cache_key = key.cache_key();
        match self.cache.get(&cache_key).await {
            Ok(Some(payload)) => match serde_json::from_str::<Vec<Candle>>(&payload) {
                Ok(candles) => Some(candles),
                Err(e) => {
                    tracing::warn!("[{}] ignoring undecodable cache entry: {}", key, e);
                    None
                }
            },
            Ok(None) => {
                tracing::debug!("[{}] cache miss", key);
                None
            }
            Err(e) => {
                tracing::warn!("[{}] cache read failed: {}", key, e);
                None
            }
        }
    }

    fn seed(&mut self, key: &SeriesKey, mut candles: Vec<Candle>, now_ms: u64) -> usize {
        candles.sort_by_key(|c| c.open_time);
        for candle in candles {
            if candle.series_key() != *key || candle.validate().is_err() {
                continue;
            }
            self.store.ingest(candle, now_ms);
        }
        self.store.window(key).len()
    }

    fn write_through(&self, key: &SeriesKey) {
        let window = self.store.window(key);
        let payload = match serde_json::to_string(&window) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("[{}] cache encode failed: {}", key, e);
                return;
            }
        };

        let write = CacheWrite {
            key: key.cache_key(),
            payload,
            ttl_secs: self.config.ttl_secs(&key.interval),
        };
        self.pending.put(write);
    }

    #[cfg(test)]
    fn pending_writes(&self) -> usize {
        self.pending.len()
    }
}

async fn write_loop(cache: Arc<dyn CandleCache>, pending: Arc<PendingWrites>) {
    loop {
        let batch = pending.take();
        if batch.is_empty() {
            if pending.closed.load(Ordering::Acquire) {
                break;
            }
            pending.notify.notified().await;
            continue;
        }
        for write in batch {
            if let Err(e) = cache.set_ex(&write.key, &write.payload, write.ttl_secs).await {
                tracing::warn!("cache write for {} failed: {}", write.key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::config::RetentionPolicy;
    use crate::errors::FeedError;
    use crate::models::candle::make_candle;

    #[derive(Default)]
    struct RecordingCache {
        inner: MemoryCache,
        fail: bool,
        writes: std::sync::Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl CandleCache for RecordingCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            if self.fail {
                return Err(CacheError::Backend("down".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
            if self.fail {
                return Err(CacheError::Backend("down".to_string()));
            }
            self.writes.lock().unwrap().push((key.to_string(), ttl_secs));
            self.inner.set_ex(key, value, ttl_secs).await
        }
    }

    struct FixedSnapshot {
        candles: Vec<Candle>,
        calls: AtomicUsize,
    }

    impl FixedSnapshot {
        fn new(candles: Vec<Candle>) -> Arc<Self> {
            Arc::new(Self {
                candles,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SnapshotSource for FixedSnapshot {
        async fn fetch_snapshot(
            &self,
            _series: &SeriesKey,
            _max_candles: usize,
            _now_ms: u64,
        ) -> Result<Vec<Candle>, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.candles.clone())
        }
    }

    /// Accepts the first write and never finishes it.
    #[derive(Default)]
    struct StalledCache {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CandleCache for StalledCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }

        async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn key() -> SeriesKey {
        SeriesKey::new("BTC", "1m")
    }

    fn synchronizer(
        cache: Arc<dyn CandleCache>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> CacheSynchronizer {
        let policy = RetentionPolicy {
            max_candles: 50,
            max_age: None,
        };
        CacheSynchronizer::new(CandleStore::new(policy), cache, snapshots, CacheConfig::default())
    }

    #[tokio::test]
    async fn ingest_writes_window_under_series_key() {
        let cache = Arc::new(RecordingCache::default());
        let mut sync = synchronizer(cache.clone(), FixedSnapshot::new(Vec::new()));

        sync.ingest(make_candle(0, 99.0, 101.0, 100.0), 0);
        sync.ingest(make_candle(1, 99.0, 101.0, 100.0), 0);
        let window = sync.window(&key());
        sync.shutdown().await;

        let payload = cache.get("candles:BTC:1m").await.unwrap().unwrap();
        let cached: Vec<Candle> = serde_json::from_str(&payload).unwrap();
        assert_eq!(cached, window);

        let writes = cache.writes.lock().unwrap().clone();
        assert!(!writes.is_empty());
        assert!(writes.iter().all(|(k, ttl)| k == "candles:BTC:1m" && *ttl == 300));
    }

    #[tokio::test]
    async fn dropped_updates_are_not_written() {
        let cache = Arc::new(RecordingCache::default());
        let mut sync = synchronizer(cache.clone(), FixedSnapshot::new(Vec::new()));

        sync.ingest(make_candle(0, 99.0, 101.0, 100.0), 0);
        sync.ingest(make_candle(1, 99.0, 101.0, 100.0), 0);
        assert_eq!(
            sync.ingest(make_candle(0, 98.0, 101.0, 100.0), 0),
            IngestOutcome::Sealed
        );
        assert_eq!(sync.pending_writes(), 1);
        let window = sync.window(&key());
        sync.shutdown().await;

        let payload = cache.get("candles:BTC:1m").await.unwrap().unwrap();
        let cached: Vec<Candle> = serde_json::from_str(&payload).unwrap();
        assert_eq!(cached, window);
        assert_eq!(cached[0].low, 99.0);
        assert_eq!(cache.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_cache_holds_one_pending_write_per_series() {
        let cache = Arc::new(StalledCache::default());
        let mut sync = synchronizer(cache.clone(), FixedSnapshot::new(Vec::new()));

        sync.ingest(make_candle(0, 99.0, 101.0, 100.0), 0);
        while cache.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        for index in 1..200 {
            sync.ingest(make_candle(index, 99.0, 101.0, 100.0), 0);
            let mut eth = make_candle(index, 9.0, 11.0, 10.0);
            eth.instrument = "ETH".to_string();
            sync.ingest(eth, 0);
            assert!(sync.pending_writes() <= 2);
        }
        assert_eq!(sync.pending_writes(), 2);
        assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cold_start_reads_cache_before_snapshot() {
        let cache = Arc::new(RecordingCache::default());
        let cached = vec![
            make_candle(0, 99.0, 101.0, 100.0),
            make_candle(1, 99.0, 101.0, 100.0),
            make_candle(2, 99.0, 101.0, 100.0),
        ];
        cache
            .set_ex("candles:BTC:1m", &serde_json::to_string(&cached).unwrap(), 300)
            .await
            .unwrap();

        let snapshots = FixedSnapshot::new(vec![make_candle(9, 99.0, 101.0, 100.0)]);
        let mut sync = synchronizer(cache, snapshots.clone());

        assert_eq!(sync.warm(&key(), 0).await, WarmSource::Cache);
        assert_eq!(sync.window(&key()), cached);
        assert_eq!(snapshots.calls.load(Ordering::SeqCst), 0);

        assert_eq!(sync.warm(&key(), 0).await, WarmSource::Memory);
    }

    #[tokio::test]
    async fn cache_miss_fetches_snapshot_once() {
        let cache = Arc::new(RecordingCache::default());
        let snapshots = FixedSnapshot::new(vec![
            make_candle(1, 99.0, 101.0, 100.0),
            make_candle(0, 99.0, 101.0, 100.0),
        ]);
        let mut sync = synchronizer(cache.clone(), snapshots.clone());

        assert_eq!(sync.warm(&key(), 0).await, WarmSource::Snapshot);
        assert_eq!(sync.window(&key()).len(), 2);
        assert_eq!(snapshots.calls.load(Ordering::SeqCst), 1);

        // a series the snapshot has nothing for is only fetched once
        let eth = SeriesKey::new("ETH", "1m");
        assert_eq!(sync.warm(&eth, 0).await, WarmSource::Empty);
        assert_eq!(sync.warm(&eth, 0).await, WarmSource::Empty);
        assert_eq!(snapshots.calls.load(Ordering::SeqCst), 2);

        sync.shutdown().await;
        // seeded window is written back once
        assert_eq!(cache.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cache_outage_is_not_fatal() {
        let cache = Arc::new(RecordingCache {
            fail: true,
            ..RecordingCache::default()
        });
        let snapshots = FixedSnapshot::new(vec![make_candle(0, 99.0, 101.0, 100.0)]);
        let mut sync = synchronizer(cache, snapshots);

        assert_eq!(sync.warm(&key(), 0).await, WarmSource::Snapshot);
        assert_eq!(
            sync.ingest(make_candle(1, 99.0, 101.0, 100.0), 0),
            IngestOutcome::Inserted
        );
        assert_eq!(sync.window(&key()).len(), 2);
        assert_eq!(sync.latest(&key()).map(|c| c.open_time), Some(60_000));
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn memory_cache_entries_expire() {
        let cache = MemoryCache::default();
        cache.set_ex("k", "v", 300).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
