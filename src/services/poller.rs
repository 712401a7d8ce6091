//! Background poller that keeps the product cache warm.
//!
//! Every cycle resolves the catalog for the configured area at "now" and loads
//! the selected product through the same single-flight path profile queries
//! use, so a new upstream generation is downloaded and decoded before the
//! first user asks for it.
//!
//! State is in-memory (`Arc<RwLock<PollerState>>`) and exposed via the status
//! endpoint.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::services::met::AvailabilityEntry;
use crate::services::product::GridSource;
use crate::services::profile::ProfileService;

/// Retry delay after a failed cycle (seconds), capped by the poll interval.
const POLLER_ERROR_RETRY_SECS: u64 = 60;

/// Minimum sleep between cycles (seconds).
const POLLER_MIN_SLEEP_SECS: u64 = 5;

/// Global poller state, exposed via the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PollerState {
    pub active: bool,
    pub area: String,
    pub interval_secs: u64,
    pub next_wakeup_at: Option<DateTime<Utc>>,
    pub last_poll_completed_at: Option<DateTime<Utc>>,
    pub last_poll_duration_ms: Option<u64>,
    pub total_polls: u64,
    pub consecutive_errors: u32,
    /// "new_data", "cached", "error: ..." or "pending"
    pub last_poll_result: String,
    /// Valid time of the product selected in the last successful cycle
    pub last_valid_time: Option<DateTime<Utc>>,
    /// Update marker of that product
    pub last_updated: Option<DateTime<Utc>>,
}

impl PollerState {
    pub fn new(area: &str, interval_secs: u64, active: bool) -> Self {
        Self {
            active,
            area: area.to_string(),
            interval_secs,
            next_wakeup_at: None,
            last_poll_completed_at: None,
            last_poll_duration_ms: None,
            total_polls: 0,
            consecutive_errors: 0,
            last_poll_result: "pending".to_string(),
            last_valid_time: None,
            last_updated: None,
        }
    }
}

/// Shared poller state handle.
pub type SharedPollerState = Arc<RwLock<PollerState>>;

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    /// A new product was downloaded and decoded.
    NewData(AvailabilityEntry),
    /// The selected product was already cached.
    Cached(AvailabilityEntry),
    Error(String),
}

impl PollResult {
    fn label(&self) -> String {
        match self {
            PollResult::NewData(_) => "new_data".to_string(),
            PollResult::Cached(_) => "cached".to_string(),
            PollResult::Error(msg) => format!("error: {}", msg),
        }
    }
}

/// Run the background poller until `shutdown` fires.
///
/// Should be spawned via `tokio::spawn(run_poller(...))`.
pub async fn run_poller(
    service: ProfileService,
    state: SharedPollerState,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    tracing::info!(
        "Background poller started for '{}', every {}s",
        service.area(),
        interval.as_secs()
    );

    loop {
        let poll_start = Utc::now();
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = poll_once(&service) => result,
        };
        let sleep_secs = finalize_poll_cycle(&state, &result, poll_start, interval.as_secs()).await;

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
        }
    }

    state.write().await.active = false;
    tracing::info!("Background poller stopped");
}

/// Resolve the current product and make sure it is cached and decoded.
pub async fn poll_once(service: &ProfileService) -> PollResult {
    let entry = match service.resolver().resolve_availability(service.area()).await {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!("Poller: catalog resolution failed: {}", e);
            return PollResult::Error(e.to_string());
        }
    };

    match service.repository().load_grid(&entry).await {
        Ok(loaded) => {
            let fetched = loaded.source == GridSource::Upstream;
            let grid = &loaded.grid;
            tracing::debug!(
                "Poller: {} valid {} ({} levels, {} points, {})",
                entry.timestamp_key(),
                grid.time,
                grid.levels().len(),
                grid.points.len(),
                if fetched { "downloaded" } else { "cached" }
            );
            if fetched {
                PollResult::NewData(entry)
            } else {
                PollResult::Cached(entry)
            }
        }
        Err(e) => {
            tracing::warn!("Poller: loading {} failed: {}", entry.timestamp_key(), e);
            PollResult::Error(e.to_string())
        }
    }
}

/// Seconds to sleep after a cycle with `result`.
pub fn next_sleep_secs(result: &PollResult, interval_secs: u64) -> u64 {
    let secs = match result {
        PollResult::Error(_) => POLLER_ERROR_RETRY_SECS.min(interval_secs),
        _ => interval_secs,
    };
    secs.max(POLLER_MIN_SLEEP_SECS)
}

/// Record the cycle in the shared state and return the sleep duration in seconds.
async fn finalize_poll_cycle(
    state: &SharedPollerState,
    result: &PollResult,
    poll_start: DateTime<Utc>,
    interval_secs: u64,
) -> u64 {
    let sleep_secs = next_sleep_secs(result, interval_secs);
    let poll_duration_ms = (Utc::now() - poll_start).num_milliseconds().max(0) as u64;

    {
        let mut s = state.write().await;
        s.next_wakeup_at = Some(Utc::now() + Duration::seconds(sleep_secs as i64));
        s.last_poll_completed_at = Some(Utc::now());
        s.last_poll_duration_ms = Some(poll_duration_ms);
        s.total_polls += 1;
        s.last_poll_result = result.label();
        match result {
            PollResult::NewData(entry) | PollResult::Cached(entry) => {
                s.consecutive_errors = 0;
                s.last_valid_time = Some(entry.valid_time);
                s.last_updated = Some(entry.updated);
            }
            PollResult::Error(_) => s.consecutive_errors += 1,
        }
    }

    tracing::info!(
        "Poller: cycle complete in {}ms ({}), sleeping {}s",
        poll_duration_ms,
        result.label(),
        sleep_secs
    );

    sleep_secs
}
