// Isobaric API v0.1
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::AppConfig;
use db::store::ProductCacheStore;
use routes::profiles::AppState;
use services::met::{AvailabilityResolver, ProductFetcher};
use services::poller::{PollerState, SharedPollerState};
use services::product::ProductRepository;
use services::profile::ProfileService;

/// Isobaric API OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Isobaric API",
        version = "0.1.0",
        description = "Upper-air wind and temperature profiles for launch-safety evaluation. \
            Resolves the current MET Norway isobaric GRIB2 product for an area, caches the \
            raw product until upstream regenerates it, decodes temperature and wind per \
            pressure level, and derives wind speed, direction, altitude and inter-layer shear \
            at the grid point nearest a requested location.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Profiles", description = "Isobaric wind and temperature profiles"),
        (name = "Cache", description = "Product cache status and forced refresh"),
        (name = "Poller", description = "Background cache-warming poller status"),
    ),
    paths(
        routes::health::health_check,
        routes::profiles::get_profile,
        routes::cache::get_cache_status,
        routes::cache::clear_cache,
        routes::poller::get_poller_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::profiles::LayerResponse,
            routes::profiles::ShearResponse,
            routes::profiles::ProfileResponse,
            routes::cache::CacheStatusResponse,
            routes::cache::ClearCacheResponse,
            db::models::CacheStats,
            services::product::RepositoryStats,
            services::poller::PollerState,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "isobaric_api=debug,tower_http=debug".into()),
    );
    if config::json_logs_from_env() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config = AppConfig::from_env();

    // Open the product cache (runs migrations)
    let store = ProductCacheStore::open(&config.database_url)
        .await
        .expect("Failed to open product cache database");

    tracing::info!("Product cache ready at {}", config.database_url);

    // One HTTP client shared by catalog resolution and product download
    let http = reqwest::Client::builder()
        .build()
        .expect("Failed to build HTTP client");

    let resolver = AvailabilityResolver::new(
        http.clone(),
        &config.catalog_url,
        &config.met_user_agent,
        config.catalog_timeout,
    );
    let fetcher = ProductFetcher::new(http, &config.met_user_agent, config.fetch_timeout);
    let repository = Arc::new(ProductRepository::new(store.clone(), fetcher));
    tracing::info!(
        "Serving areas: {}",
        config.areas.names().collect::<Vec<_>>().join(", ")
    );
    let profiles = ProfileService::new(resolver, repository, config.areas.clone(), &config.area);

    let shutdown = CancellationToken::new();

    // Build shared application state
    let app_state = AppState {
        profiles: profiles.clone(),
        shutdown: shutdown.clone(),
    };

    // Create shared poller state and spawn background poller
    let poller_state: SharedPollerState = Arc::new(RwLock::new(PollerState::new(
        &config.area,
        config.poll_interval.as_secs(),
        config.poller_enabled,
    )));
    if config.poller_enabled {
        tokio::spawn(services::poller::run_poller(
            profiles,
            poller_state.clone(),
            config.poll_interval,
            shutdown.clone(),
        ));
    } else {
        tracing::info!("Background poller disabled (POLLER_ENABLED=false)");
    }

    // CORS: read-only API plus the cache refresh endpoint
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::DELETE])
        .allow_headers(Any);

    // Build router
    let profile_routes = Router::new()
        .route("/api/v1/profile", get(routes::profiles::get_profile))
        .route(
            "/api/v1/cache",
            get(routes::cache::get_cache_status).delete(routes::cache::clear_cache),
        )
        .with_state(app_state);

    // Health check uses the SQLite pool to verify DB connectivity
    let health_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .with_state(store.pool().clone());

    // Poller status uses SharedPollerState
    let poller_routes = Router::new()
        .route(
            "/api/v1/poller/status",
            get(routes::poller::get_poller_status),
        )
        .with_state(poller_state);

    let app = Router::new()
        .merge(health_routes)
        .merge(profile_routes)
        .merge(poller_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .expect("Server terminated unexpectedly");

    store.pool().close().await;
    tracing::info!("Shut down cleanly");
}

/// Resolve on Ctrl-C and cancel in-flight work.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C, graceful shutdown disabled: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
