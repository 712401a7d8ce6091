use serde::Serialize;
use utoipa::ToSchema;

/// Raw isobaric product bytes as fetched from upstream.
/// Rows are only ever inserted or deleted, never updated. Production reads go
/// through `get_fresh_product_bytes`; full rows are only loaded by tests.
#[cfg(test)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CachedProduct {
    pub timestamp_key: String,
    pub bytes: Vec<u8>,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

/// Summary of the product cache, for the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CacheStats {
    /// Current update marker (catalog `updated` stamp), if any
    pub marker: Option<String>,
    /// Number of cached products
    pub product_count: i64,
    /// Total size of cached payloads in bytes
    pub total_bytes: i64,
    /// Keys of the cached products
    pub keys: Vec<String>,
}
