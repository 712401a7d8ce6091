//! Product cache HTTP endpoints.
//!
//! - GET /api/v1/cache: stored products, update marker and repository counters
//! - DELETE /api/v1/cache: forced refresh, drops every product and the decoded grid

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::models::CacheStats;
use crate::errors::{AppError, ErrorResponse};
use crate::routes::profiles::AppState;
use crate::services::product::RepositoryStats;

#[derive(Debug, Serialize, ToSchema)]
pub struct CacheStatusResponse {
    /// Persistent product cache contents
    pub store: CacheStats,
    /// In-process counters since startup
    pub repository: RepositoryStats,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearCacheResponse {
    /// Number of cached products removed
    pub removed: u64,
}

/// Get the product cache status.
#[utoipa::path(
    get,
    path = "/api/v1/cache",
    tag = "Cache",
    responses(
        (status = 200, description = "Cache status", body = CacheStatusResponse),
        (status = 500, description = "Cache database failure", body = ErrorResponse),
    )
)]
pub(crate) async fn get_cache_status(
    State(state): State<AppState>,
) -> Result<Json<CacheStatusResponse>, AppError> {
    let repository = state.profiles.repository();
    let store = repository.store().stats().await?;
    Ok(Json(CacheStatusResponse {
        store,
        repository: repository.stats(),
    }))
}

/// Clear the product cache.
///
/// The next profile query downloads the current product again.
#[utoipa::path(
    delete,
    path = "/api/v1/cache",
    tag = "Cache",
    responses(
        (status = 200, description = "Cache cleared", body = ClearCacheResponse),
        (status = 500, description = "Cache database failure", body = ErrorResponse),
    )
)]
pub(crate) async fn clear_cache(
    State(state): State<AppState>,
) -> Result<Json<ClearCacheResponse>, AppError> {
    let removed = state.profiles.repository().clear().await?;
    Ok(Json(ClearCacheResponse { removed }))
}
