use axum::extract::State;
use axum::Json;
use serde::Serialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status ("ok" when healthy, "degraded" when the cache DB is unreachable)
    pub status: String,
    /// API version
    pub version: String,
    /// Whether the cache database is reachable
    pub database: bool,
}

/// Health check endpoint.
///
/// Returns the API status and version. Verifies cache database connectivity
/// with a simple query. Returns status "degraded" (still 200) if the
/// DB is unreachable, so load balancers can distinguish partial failures.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_check(State(pool): State<SqlitePool>) -> Json<HealthResponse> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&pool)
        .await
        .is_ok();

    Json(HealthResponse {
        status: if db_ok {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::ProductCacheStore;

    #[tokio::test]
    async fn test_health_ok() {
        let store = ProductCacheStore::open_memory().await.unwrap();
        let Json(body) = health_check(State(store.pool().clone())).await;
        assert_eq!(body.status, "ok");
        assert!(body.database);
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_health_degraded_when_pool_closed() {
        let store = ProductCacheStore::open_memory().await.unwrap();
        store.pool().close().await;
        let Json(body) = health_check(State(store.pool().clone())).await;
        assert_eq!(body.status, "degraded");
        assert!(!body.database);
    }
}
