//! Binary product cache on SQLite.
//!
//! Holds at most one raw product, keyed by `"{area}/{valid time}"`, together
//! with a single update marker (the catalog's `updated` stamp). A product is
//! fresh only while the marker equals the `updated` it was stored under and
//! its key matches; storing anything else replaces the row and the marker in
//! one transaction.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::models::CacheStats;
use super::queries;
use crate::errors::IsobaricError;

/// Maximum number of connections for an on-disk cache.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// What a call to [`ProductCacheStore::store`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Previous product (if any) removed, this one inserted, marker set.
    Replaced { removed: u64 },
    /// Same marker and key already cached: nothing written.
    Unchanged,
}

#[derive(Clone)]
pub struct ProductCacheStore {
    pool: SqlitePool,
    /// Serializes writers in this process so marker check and insert are atomic.
    write_lock: Arc<Mutex<()>>,
}

impl ProductCacheStore {
    /// Open (creating if missing) an on-disk cache and apply migrations.
    pub async fn open(database_url: &str) -> Result<Self, IsobaricError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(DB_POOL_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        Self::migrate(pool).await
    }

    /// In-memory cache, lost when the store is dropped.
    #[cfg(test)]
    pub async fn open_memory() -> Result<Self, IsobaricError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Each connection to :memory: is its own database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, IsobaricError> {
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|e| IsobaricError::Cache(e.into()))?;

        tracing::debug!("Product cache migrations completed");

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cached bytes for `timestamp_key`, only if they were stored under
    /// `updated` and that is still the current marker.
    pub async fn get_if_fresh(
        &self,
        updated: &str,
        timestamp_key: &str,
    ) -> Result<Option<Vec<u8>>, IsobaricError> {
        let bytes = queries::get_fresh_product_bytes(&self.pool, updated, timestamp_key).await?;
        Ok(bytes)
    }

    /// Store `bytes` under `timestamp_key` and marker `updated`.
    ///
    /// Unless this exact product is already cached under `updated`, every
    /// stored product is deleted, this one inserted and the marker set, all
    /// in one transaction. A repeated call with the same arguments is a no-op.
    pub async fn store(
        &self,
        updated: &str,
        timestamp_key: &str,
        bytes: &[u8],
    ) -> Result<StoreOutcome, IsobaricError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = queries::get_marker(&mut *tx).await?;
        let cached = current.as_deref() == Some(updated)
            && queries::product_exists(&mut *tx, timestamp_key).await?;
        let outcome = if cached {
            StoreOutcome::Unchanged
        } else {
            let removed = queries::delete_all_products(&mut *tx).await?;
            queries::set_marker(&mut *tx, updated).await?;
            queries::insert_product(&mut *tx, timestamp_key, bytes, Utc::now()).await?;
            StoreOutcome::Replaced { removed }
        };

        tx.commit().await?;

        match outcome {
            StoreOutcome::Replaced { removed } => tracing::info!(
                "Cached {} ({} bytes) under marker {} (was {}), evicted {} products",
                timestamp_key,
                bytes.len(),
                updated,
                current.as_deref().unwrap_or("none"),
                removed
            ),
            StoreOutcome::Unchanged => {
                tracing::debug!("{} already cached under marker {}", timestamp_key, updated)
            }
        }

        Ok(outcome)
    }

    /// Remove every product and the marker.
    pub async fn clear(&self) -> Result<u64, IsobaricError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let removed = queries::delete_all_products(&mut *tx).await?;
        queries::delete_marker(&mut *tx).await?;
        tx.commit().await?;

        tracing::info!("Product cache cleared, {} products removed", removed);
        Ok(removed)
    }

    pub async fn marker(&self) -> Result<Option<String>, IsobaricError> {
        Ok(queries::get_marker(&self.pool).await?)
    }

    pub async fn stats(&self) -> Result<CacheStats, IsobaricError> {
        let mut conn = self.pool.acquire().await?;
        let marker = queries::get_marker(&mut *conn).await?;
        let products = queries::list_product_keys(&mut *conn).await?;

        Ok(CacheStats {
            marker,
            product_count: products.len() as i64,
            total_bytes: products.iter().map(|(_, len)| len).sum(),
            keys: products.into_iter().map(|(key, _)| key).collect(),
        })
    }
}
