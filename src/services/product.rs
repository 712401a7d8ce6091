//! Cached access to isobaric products.
//!
//! Combines the SQLite byte cache, the product download and the grid decoder.
//! Concurrent requests for the same product while it is being fetched share
//! one download: callers serialize on a per-product flight lock and
//! re-check the caches once they hold it.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::db::store::ProductCacheStore;
use crate::errors::IsobaricError;
use crate::services::grib::{self, DecodedGrid, RoleTable};
use crate::services::met::{AvailabilityEntry, ProductFetcher};

/// Identifies one product generation: (update marker, `"{area}/{valid time}"`).
type FlightKey = (String, String);

type FlightMap = Mutex<HashMap<FlightKey, Arc<tokio::sync::Mutex<()>>>>;

/// The most recently decoded grid and the product generation it came from.
struct MemoizedGrid {
    timestamp_key: String,
    marker: String,
    grid: Arc<DecodedGrid>,
}

#[derive(Default)]
struct Counters {
    memo_hits: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fetches: AtomicU64,
    decodes: AtomicU64,
}

/// Repository counters since startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct RepositoryStats {
    /// Queries answered from the in-memory decoded grid
    pub memo_hits: u64,
    /// Products read from the SQLite cache
    pub cache_hits: u64,
    /// Products missing from the SQLite cache
    pub cache_misses: u64,
    /// Upstream downloads
    pub fetches: u64,
    /// Grid decodes
    pub decodes: u64,
}

/// Where [`ProductRepository::load_grid`] found the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridSource {
    /// The in-memory decoded grid.
    Memo,
    /// Bytes from the SQLite cache, decoded again.
    Cache,
    /// Downloaded by this call.
    Upstream,
}

#[derive(Debug, Clone)]
pub struct LoadedGrid {
    pub grid: Arc<DecodedGrid>,
    pub source: GridSource,
}

pub struct ProductRepository {
    store: ProductCacheStore,
    fetcher: ProductFetcher,
    roles: Arc<RoleTable>,
    inflight: Arc<FlightMap>,
    memo: RwLock<Option<MemoizedGrid>>,
    counters: Counters,
}

/// Removes the flight lock from the map once its last user is done,
/// including when the owning future is cancelled.
struct FlightGuard {
    key: FlightKey,
    lock: Arc<tokio::sync::Mutex<()>>,
    inflight: Arc<FlightMap>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

impl ProductRepository {
    pub fn new(store: ProductCacheStore, fetcher: ProductFetcher) -> Self {
        Self::with_roles(store, fetcher, RoleTable::default())
    }

    pub fn with_roles(store: ProductCacheStore, fetcher: ProductFetcher, roles: RoleTable) -> Self {
        Self {
            store,
            fetcher,
            roles: Arc::new(roles),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            memo: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &ProductCacheStore {
        &self.store
    }

    /// Decoded grid of the product `entry` describes.
    ///
    /// Order of lookup: in-memory grid, SQLite cache, upstream download. The
    /// in-memory grid is only reused while both the resolved entry and the
    /// store's marker still match the generation it was decoded from.
    pub async fn load_grid(&self, entry: &AvailabilityEntry) -> Result<LoadedGrid, IsobaricError> {
        let timestamp_key = entry.timestamp_key();
        let marker = entry.marker();

        if let Some(grid) = self.memoized(&timestamp_key, &marker).await? {
            return Ok(LoadedGrid {
                grid,
                source: GridSource::Memo,
            });
        }

        let flight = self.join_flight((marker.clone(), timestamp_key.clone()));
        let _running = flight.lock.lock().await;

        // Another caller may have finished the work while we waited.
        if let Some(grid) = self.memoized(&timestamp_key, &marker).await? {
            return Ok(LoadedGrid {
                grid,
                source: GridSource::Memo,
            });
        }

        let (grid, source) = self.load_uncached(entry, &timestamp_key, &marker).await?;
        let grid = Arc::new(grid);

        *self.memo.write().await = Some(MemoizedGrid {
            timestamp_key,
            marker,
            grid: grid.clone(),
        });
        Ok(LoadedGrid { grid, source })
    }

    /// Drop every cached product, the marker and the decoded grid.
    pub async fn clear(&self) -> Result<u64, IsobaricError> {
        let mut memo = self.memo.write().await;
        let removed = self.store.clear().await?;
        *memo = None;
        Ok(removed)
    }

    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            memo_hits: self.counters.memo_hits.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            decodes: self.counters.decodes.load(Ordering::Relaxed),
        }
    }

    async fn memoized(
        &self,
        timestamp_key: &str,
        marker: &str,
    ) -> Result<Option<Arc<DecodedGrid>>, IsobaricError> {
        let memo = self.memo.read().await;
        let Some(memo) = memo.as_ref() else {
            return Ok(None);
        };
        if memo.timestamp_key != timestamp_key || memo.marker != marker {
            return Ok(None);
        }
        // The store may have been cleared or moved on to a newer marker.
        if self.store.marker().await?.as_deref() != Some(marker) {
            return Ok(None);
        }
        self.counters.memo_hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(memo.grid.clone()))
    }

    fn join_flight(&self, key: FlightKey) -> FlightGuard {
        let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        FlightGuard {
            key,
            lock,
            inflight: self.inflight.clone(),
        }
    }

    /// Decode the cached bytes, or download, decode and then store them on a
    /// miss. Callers hold the flight lock for this product.
    async fn load_uncached(
        &self,
        entry: &AvailabilityEntry,
        timestamp_key: &str,
        marker: &str,
    ) -> Result<(DecodedGrid, GridSource), IsobaricError> {
        if let Some(bytes) = self.store.get_if_fresh(marker, timestamp_key).await? {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache hit for {} (marker {})", timestamp_key, marker);
            let grid = self.decode(Arc::new(bytes)).await?;
            return Ok((grid, GridSource::Cache));
        }

        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Cache miss for {} (marker {}), fetching {}",
            timestamp_key,
            marker,
            entry.uri
        );

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = Arc::new(self.fetcher.fetch(&entry.uri).await?);

        // Only a payload that decodes is cached.
        let grid = match self.decode(bytes.clone()).await {
            Ok(grid) => grid,
            Err(e) => {
                tracing::warn!("Not caching {} (marker {}): {}", timestamp_key, marker, e);
                return Err(e);
            }
        };
        self.store.store(marker, timestamp_key, &bytes).await?;
        Ok((grid, GridSource::Upstream))
    }

    async fn decode(&self, bytes: Arc<Vec<u8>>) -> Result<DecodedGrid, IsobaricError> {
        let roles = self.roles.clone();
        let grid = tokio::task::spawn_blocking(move || grib::decode_with(&bytes, &roles))
            .await
            .map_err(|e| IsobaricError::Parsing(format!("decode task failed: {}", e)))??;
        self.counters.decodes.fetch_add(1, Ordering::Relaxed);
        Ok(grid)
    }
}
