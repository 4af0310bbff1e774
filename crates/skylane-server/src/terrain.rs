//! Elevation service: cached, deduplicated terrain tile fetching.
//!
//! Tiles are fetched at a fixed zoom, decoded once and kept in a bounded
//! LRU cache with a TTL. Concurrent requests for the same tile share one
//! in-flight fetch, and a semaphore bounds fetches across the process.
//! Failed fetches are retried with backoff and never cached.
//!
//! Route planning is synchronous, so callers prefetch the tiles a stage
//! needs into an [`ElevationSnapshot`] and hand that to the core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use skylane_core::{Coordinate, ElevationLookup};
use tokio::sync::Semaphore;

use crate::backoff::Backoff;
use crate::cache::{prune_cache, CacheEntry};
use crate::config::Config;
use crate::tiles::{TileFetchError, TileKey, TileRaster, TileSource};

#[derive(Debug, Clone)]
pub struct ElevationConfig {
    pub zoom: u8,
    pub cache_tiles: usize,
    pub cache_ttl: Duration,
    pub max_in_flight: usize,
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub fetch_timeout: Duration,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            zoom: 12,
            cache_tiles: 500,
            cache_ttl: Duration::from_secs(3600),
            max_in_flight: 8,
            retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for ElevationConfig {
    fn from(config: &Config) -> Self {
        Self {
            zoom: config.terrain_zoom,
            cache_tiles: config.terrain_cache_tiles,
            cache_ttl: Duration::from_secs(config.terrain_cache_ttl_s),
            max_in_flight: config.terrain_max_in_flight,
            retries: config.terrain_retries,
            backoff_base: Duration::from_millis(config.terrain_backoff_ms),
            backoff_max: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(config.terrain_timeout_s),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ElevationStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct CachedTile {
    raster: Arc<TileRaster>,
    fetched_at: Instant,
    last_used: Instant,
}

impl CacheEntry for CachedTile {
    fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    fn last_used(&self) -> Instant {
        self.last_used
    }
}

type SharedFetch = Shared<BoxFuture<'static, Option<Arc<TileRaster>>>>;

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

struct Inner {
    source: Arc<dyn TileSource>,
    config: ElevationConfig,
    cache: DashMap<TileKey, CachedTile>,
    inflight: DashMap<TileKey, SharedFetch>,
    permits: Semaphore,
    counters: Counters,
}

/// Process-wide elevation source. Cheap to clone.
#[derive(Clone)]
pub struct ElevationService {
    inner: Arc<Inner>,
}

impl ElevationService {
    pub fn new(source: Arc<dyn TileSource>, config: ElevationConfig) -> Self {
        let permits = Semaphore::new(config.max_in_flight.max(1));
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                cache: DashMap::new(),
                inflight: DashMap::new(),
                permits,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ElevationConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ElevationStats {
        let counters = &self.inner.counters;
        ElevationStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }

    pub fn cached_tiles(&self) -> usize {
        self.inner.cache.len()
    }

    /// Height at `coord` in meters, or `None` if its tile is unavailable.
    pub async fn elevation(&self, coord: Coordinate) -> Option<f64> {
        if !coord.is_finite() {
            return None;
        }
        let (key, offset) = TileKey::locate(coord.normalized(), self.inner.config.zoom);
        self.tile(key).await.map(|raster| raster.sample(offset))
    }

    /// Resolve every tile `coords` touch.
    pub async fn prefetch(&self, coords: impl IntoIterator<Item = Coordinate>) -> ElevationSnapshot {
        self.prefetch_until(coords, None).await
    }

    /// Like [`Self::prefetch`], but stop waiting at `deadline`. Tiles still
    /// outstanding then are absent from the snapshot.
    pub async fn prefetch_until(
        &self,
        coords: impl IntoIterator<Item = Coordinate>,
        deadline: Option<tokio::time::Instant>,
    ) -> ElevationSnapshot {
        let mut snapshot = self.snapshot();
        self.prefetch_into(&mut snapshot, coords, deadline).await;
        snapshot
    }

    /// Empty snapshot at this service's zoom.
    pub fn snapshot(&self) -> ElevationSnapshot {
        ElevationSnapshot {
            zoom: self.inner.config.zoom,
            tiles: HashMap::new(),
        }
    }

    /// Add the tiles `coords` touch to `snapshot`. Returns false if
    /// `deadline` cut the wait short.
    pub async fn prefetch_into(
        &self,
        snapshot: &mut ElevationSnapshot,
        coords: impl IntoIterator<Item = Coordinate>,
        deadline: Option<tokio::time::Instant>,
    ) -> bool {
        let zoom = snapshot.zoom;
        let keys = coords
            .into_iter()
            .filter_map(|coord| TileKey::containing(coord, zoom));
        self.prefetch_tiles(snapshot, keys, deadline).await
    }

    /// Resolve `keys` into `snapshot`, skipping tiles it already holds
    /// (including ones that failed). Returns false if `deadline` cut the
    /// wait short.
    pub async fn prefetch_tiles(
        &self,
        snapshot: &mut ElevationSnapshot,
        keys: impl IntoIterator<Item = TileKey>,
        deadline: Option<tokio::time::Instant>,
    ) -> bool {
        let mut keys: Vec<TileKey> = keys
            .into_iter()
            .filter(|key| key.zoom == snapshot.zoom && !snapshot.tiles.contains_key(key))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        if keys.is_empty() {
            return true;
        }

        let mut pending: FuturesUnordered<_> = keys
            .into_iter()
            .map(|key| {
                let service = self.clone();
                async move { (key, service.tile(key).await) }
            })
            .collect();

        let tiles = &mut snapshot.tiles;
        let drain = async {
            while let Some((key, raster)) = pending.next().await {
                tiles.insert(key, raster);
            }
        };
        match deadline {
            Some(deadline) => {
                let finished = tokio::time::timeout_at(deadline, drain).await.is_ok();
                if !finished {
                    tracing::warn!("Terrain prefetch hit the request deadline");
                }
                finished
            }
            None => {
                drain.await;
                true
            }
        }
    }

    async fn tile(&self, key: TileKey) -> Option<Arc<TileRaster>> {
        if let Some(raster) = self.cached(key) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(raster);
        }
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);

        let fetch = match self.inner.inflight.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // A fetch may have landed between the cache miss and here.
                if let Some(raster) = self.cached(key) {
                    return Some(raster);
                }
                let fetch = self.spawn_fetch(key);
                entry.insert(fetch.clone());
                fetch
            }
        };
        fetch.await
    }

    fn cached(&self, key: TileKey) -> Option<Arc<TileRaster>> {
        let now = Instant::now();
        let mut entry = self.inner.cache.get_mut(&key)?;
        if entry.is_expired(now, self.inner.config.cache_ttl) {
            drop(entry);
            self.inner.cache.remove(&key);
            return None;
        }
        entry.last_used = now;
        Some(entry.raster.clone())
    }

    /// The fetch runs on its own task so dropped waiters never strand the
    /// in-flight entry.
    fn spawn_fetch(&self, key: TileKey) -> SharedFetch {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            let raster = service.fetch_with_retry(key).await;
            if let Some(raster) = &raster {
                let now = Instant::now();
                service.inner.cache.insert(
                    key,
                    CachedTile {
                        raster: raster.clone(),
                        fetched_at: now,
                        last_used: now,
                    },
                );
                prune_cache(
                    &service.inner.cache,
                    service.inner.config.cache_tiles,
                    service.inner.config.cache_ttl,
                );
            }
            service.inner.inflight.remove(&key);
            raster
        });
        async move { handle.await.ok().flatten() }.boxed().shared()
    }

    async fn fetch_with_retry(&self, key: TileKey) -> Option<Arc<TileRaster>> {
        let config = &self.inner.config;
        let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);
        let attempts = config.retries.saturating_add(1);

        for attempt in 1..=attempts {
            let result = {
                let _permit = self.inner.permits.acquire().await.ok()?;
                self.inner.counters.fetches.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(config.fetch_timeout, self.inner.source.fetch(key)).await {
                    Ok(result) => result,
                    Err(_) => Err(TileFetchError::Timeout),
                }
            };

            match result {
                Ok(raster) => {
                    tracing::debug!(tile = %key, attempt, "Fetched terrain tile");
                    return Some(Arc::new(raster));
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        tile = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Terrain tile fetch failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tile = %key,
                        attempt,
                        retries = backoff.attempts(),
                        "Terrain tile unavailable: {}",
                        err
                    );
                    return None;
                }
            }
        }
        None
    }
}

/// Tiles resolved for one request. Missing or failed tiles read as absent.
#[derive(Debug, Clone)]
pub struct ElevationSnapshot {
    zoom: u8,
    tiles: HashMap<TileKey, Option<Arc<TileRaster>>>,
}

impl ElevationSnapshot {
    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn missing_tiles(&self) -> usize {
        self.tiles.values().filter(|tile| tile.is_none()).count()
    }
}

impl ElevationLookup for ElevationSnapshot {
    fn elevation_at(&self, coord: Coordinate) -> Option<f64> {
        if !coord.is_finite() {
            return None;
        }
        let (key, offset) = TileKey::locate(coord.normalized(), self.zoom);
        self.tiles
            .get(&key)?
            .as_ref()
            .map(|raster| raster.sample(offset))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Flat terrain, optionally slow, counting every fetch.
    pub(crate) struct FakeTiles {
        pub height_m: f32,
        pub delay: Duration,
        pub fail_first: usize,
        pub calls: AtomicUsize,
    }

    impl FakeTiles {
        pub fn flat(height_m: f32) -> Self {
            Self {
                height_m,
                delay: Duration::ZERO,
                fail_first: 0,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TileSource for FakeTiles {
        fn fetch(&self, _key: TileKey) -> BoxFuture<'static, Result<TileRaster, TileFetchError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            let fail = call < self.fail_first;
            let height_m = self.height_m;
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    Err(TileFetchError::Status(503))
                } else {
                    Ok(TileRaster::uniform(4, 4, height_m))
                }
            }
            .boxed()
        }
    }

    pub(crate) fn fast_config() -> ElevationConfig {
        ElevationConfig {
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            fetch_timeout: Duration::from_secs(1),
            ..ElevationConfig::default()
        }
    }

    fn service(source: Arc<FakeTiles>, config: ElevationConfig) -> ElevationService {
        ElevationService::new(source, config)
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let source = Arc::new(FakeTiles {
            delay: Duration::from_millis(50),
            ..FakeTiles::flat(120.0)
        });
        let elevation = service(source.clone(), fast_config());
        let a = Coordinate::new(8.5417, 47.3769);
        let b = Coordinate::new(8.5418, 47.3770);

        let (ha, hb) = tokio::join!(elevation.elevation(a), elevation.elevation(b));
        assert_eq!(ha, Some(120.0));
        assert_eq!(hb, Some(120.0));
        assert_eq!(source.calls(), 1);

        assert_eq!(elevation.elevation(a).await, Some(120.0));
        assert_eq!(source.calls(), 1);
        assert_eq!(elevation.stats().hits, 1);
    }

    #[tokio::test]
    async fn failures_are_retried_and_not_cached() {
        let source = Arc::new(FakeTiles {
            fail_first: 4,
            ..FakeTiles::flat(10.0)
        });
        let elevation = service(source.clone(), fast_config());
        let point = Coordinate::new(1.0, 1.0);

        // One attempt plus three retries, all failing.
        assert_eq!(elevation.elevation(point).await, None);
        assert_eq!(source.calls(), 4);
        assert_eq!(elevation.stats().failures, 1);
        assert_eq!(elevation.cached_tiles(), 0);

        // The next lookup goes back to the source and succeeds.
        assert_eq!(elevation.elevation(point).await, Some(10.0));
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_retries() {
        let source = Arc::new(FakeTiles {
            fail_first: 2,
            ..FakeTiles::flat(42.0)
        });
        let elevation = service(source.clone(), fast_config());
        assert_eq!(elevation.elevation(Coordinate::new(0.5, 0.5)).await, Some(42.0));
        assert_eq!(source.calls(), 3);
        assert_eq!(elevation.stats().failures, 0);
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let source = Arc::new(FakeTiles {
            delay: Duration::from_millis(200),
            ..FakeTiles::flat(1.0)
        });
        let config = ElevationConfig {
            retries: 1,
            fetch_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let elevation = service(source.clone(), config);
        assert_eq!(elevation.elevation(Coordinate::new(0.0, 0.0)).await, None);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn cache_is_bounded() {
        let source = Arc::new(FakeTiles::flat(0.0));
        let config = ElevationConfig {
            cache_tiles: 3,
            ..fast_config()
        };
        let elevation = service(source.clone(), config);
        for i in 0..6 {
            elevation.elevation(Coordinate::new(i as f64, 0.0)).await;
        }
        assert!(elevation.cached_tiles() <= 3);
        assert_eq!(source.calls(), 6);
    }

    #[tokio::test]
    async fn expired_tiles_are_refetched() {
        let source = Arc::new(FakeTiles::flat(5.0));
        let config = ElevationConfig {
            cache_ttl: Duration::ZERO,
            ..fast_config()
        };
        let elevation = service(source.clone(), config);
        let point = Coordinate::new(3.0, 3.0);
        elevation.elevation(point).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        elevation.elevation(point).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn prefetch_resolves_distinct_tiles_once() {
        let source = Arc::new(FakeTiles::flat(7.0));
        let elevation = service(source.clone(), fast_config());
        let coords: Vec<Coordinate> = (0..50)
            .map(|i| Coordinate::new(0.0001 * i as f64, 0.0))
            .chain(std::iter::once(Coordinate::new(10.0, 10.0)))
            .collect();

        let snapshot = elevation.prefetch(coords.clone()).await;
        assert_eq!(snapshot.tile_count(), 2);
        assert_eq!(source.calls(), 2);
        assert!(coords.iter().all(|c| snapshot.elevation_at(*c) == Some(7.0)));
        assert_eq!(snapshot.elevation_at(Coordinate::new(-50.0, 0.0)), None);
    }

    #[tokio::test]
    async fn prefetch_stops_at_deadline() {
        let source = Arc::new(FakeTiles {
            delay: Duration::from_millis(500),
            ..FakeTiles::flat(7.0)
        });
        let elevation = service(source.clone(), fast_config());
        let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
        let started = Instant::now();
        let snapshot = elevation
            .prefetch_until([Coordinate::new(0.0, 0.0)], Some(deadline))
            .await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(snapshot.elevation_at(Coordinate::new(0.0, 0.0)), None);
    }
}
