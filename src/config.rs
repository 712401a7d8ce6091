use std::time::Duration;

use crate::services::areas::AreaTable;

/// Default availability catalog for MET Norway isobaric GRIB2 products.
const DEFAULT_CATALOG_URL: &str =
    "https://api.met.no/weatherapi/isobaricgrib/1.0/available.json?type=grib2";

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub met_user_agent: String,
    pub catalog_url: String,
    /// Area the background poller keeps warm (catalog `params.area`).
    pub area: String,
    /// Area tags and their coverage; a query goes to the area containing it.
    pub areas: AreaTable,
    pub catalog_timeout: Duration,
    pub fetch_timeout: Duration,
    pub poll_interval: Duration,
    pub poller_enabled: bool,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://isobaric-cache.db".to_string()),
            met_user_agent: std::env::var("MET_USER_AGENT").unwrap_or_else(|_| {
                "IsobaricApi/0.1 github.com/isobaric-api/isobaric-api".to_string()
            }),
            catalog_url: std::env::var("CATALOG_URL")
                .unwrap_or_else(|_| DEFAULT_CATALOG_URL.to_string()),
            area: std::env::var("ISOBARIC_AREA").unwrap_or_else(|_| "southern_norway".to_string()),
            areas: env_areas("ISOBARIC_AREAS"),
            catalog_timeout: Duration::from_secs(env_u64("CATALOG_TIMEOUT_SECS", 10)),
            fetch_timeout: Duration::from_secs(env_u64("FETCH_TIMEOUT_SECS", 60)),
            poll_interval: Duration::from_secs(env_u64("POLL_INTERVAL_SECS", 900)),
            poller_enabled: std::env::var("POLLER_ENABLED")
                .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(true),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("PORT must be a valid u16"),
        }
    }
}

/// `LOG_FORMAT=json` selects JSON log lines. Read on its own so logging can be
/// set up before the rest of the configuration is parsed.
pub fn json_logs_from_env() -> bool {
    std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Read a `u64` env var, falling back to `default` when unset or unparsable.
fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("{} is not a valid integer ('{}'), using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

/// Read an area table env var, falling back to the default table when unset
/// or malformed.
fn env_areas(key: &str) -> AreaTable {
    match std::env::var(key) {
        Ok(raw) => AreaTable::parse(&raw).unwrap_or_else(|e| {
            tracing::warn!("{} is invalid ({}), using the default areas", key, e);
            AreaTable::default()
        }),
        Err(_) => AreaTable::default(),
    }
}
