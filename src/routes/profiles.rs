//! Isobaric profile HTTP endpoint.
//!
//! - GET /api/v1/profile?lat=..&lon=..&datetime=ISO8601

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use utoipa::{IntoParams, ToSchema};

use crate::errors::{AppError, ErrorResponse};
use crate::helpers::{format_datetime, opt_round_1dp, parse_datetime, round_1dp};
use crate::services::profile::{Profile, ProfileLayer, ProfileService};

/// Shared application state for profile and cache endpoints.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) profiles: ProfileService,
    /// Fires on shutdown; in-flight profile queries stop with 503.
    pub(crate) shutdown: CancellationToken,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ProfileQuery {
    /// Latitude in degrees (-90..=90)
    pub lat: f64,
    /// Longitude in degrees (-180..=180)
    pub lon: f64,
    /// Target datetime in ISO 8601 format (e.g. "2025-05-01T06:00:00Z").
    /// Defaults to now; the product valid closest to it is used.
    pub datetime: Option<String>,
}

/// Values for one pressure level. Missing data is `null`, never zero.
#[derive(Debug, Serialize, ToSchema)]
pub struct LayerResponse {
    /// Pressure level in hPa
    pub pressure_hpa: u32,
    /// Standard-atmosphere altitude in metres
    pub altitude_m: Option<f64>,
    /// Altitude from the hypsometric equation using the profile's temperatures
    pub true_altitude_m: Option<f64>,
    /// Air temperature in Celsius
    pub air_temperature_c: Option<f64>,
    /// Wind speed in metres per second
    pub wind_speed_ms: Option<f64>,
    /// Direction the wind blows from, degrees (0 = north, 90 = east)
    pub wind_from_direction_deg: Option<f64>,
}

impl From<&ProfileLayer> for LayerResponse {
    fn from(layer: &ProfileLayer) -> Self {
        let v = &layer.values;
        Self {
            pressure_hpa: v.pressure_hpa,
            altitude_m: round_1dp(v.altitude_m),
            true_altitude_m: opt_round_1dp(v.true_altitude_m),
            air_temperature_c: opt_round_1dp(v.air_temperature_c),
            wind_speed_ms: opt_round_1dp(v.wind_speed_ms),
            wind_from_direction_deg: opt_round_1dp(v.wind_from_direction_deg),
        }
    }
}

/// Wind shear between two adjacent layers (lower layer minus upper layer).
#[derive(Debug, Serialize, ToSchema)]
pub struct ShearResponse {
    /// Pressure of the lower (higher-pressure) layer, hPa
    pub lower_hpa: u32,
    /// Pressure of the upper layer, hPa
    pub upper_hpa: u32,
    /// Shear magnitude in metres per second
    pub speed_ms: Option<f64>,
    /// Direction of the shear vector, "from" convention, degrees
    pub direction_deg: Option<f64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProfileResponse {
    /// Area tag of the product
    pub area: String,
    /// Valid time of the product (ISO 8601)
    pub valid_time: String,
    /// When the product was last regenerated upstream (ISO 8601)
    pub updated: String,
    /// Latitude of the grid point used
    pub grid_lat: f64,
    /// Longitude of the grid point used
    pub grid_lon: f64,
    /// Distance from the requested point to the grid point, degrees
    pub distance_deg: f64,
    /// Layers ordered by descending pressure (ground first)
    pub layers: Vec<LayerResponse>,
    /// Shear between each pair of adjacent layers, bottom to top
    pub shears: Vec<ShearResponse>,
}

impl From<&Profile> for ProfileResponse {
    fn from(profile: &Profile) -> Self {
        Self {
            area: profile.area.clone(),
            valid_time: format_datetime(profile.time),
            updated: format_datetime(profile.updated),
            grid_lat: profile.grid_point.lat(),
            grid_lon: profile.grid_point.lon(),
            distance_deg: (profile.distance_deg * 1e4).round() / 1e4,
            layers: profile.layers.iter().map(LayerResponse::from).collect(),
            shears: profile
                .shears()
                .into_iter()
                .map(|s| ShearResponse {
                    lower_hpa: s.lower_hpa,
                    upper_hpa: s.upper_hpa,
                    speed_ms: s.shear.and_then(|w| round_1dp(w.speed_ms)),
                    direction_deg: s.shear.and_then(|w| round_1dp(w.direction_deg)),
                })
                .collect(),
        }
    }
}

/// Reject coordinates that cannot be on Earth. Checked before the range
/// comparisons because NaN passes them.
fn validate_coordinates(lat: f64, lon: f64) -> Result<(), AppError> {
    if !lat.is_finite() || !lon.is_finite() {
        return Err(AppError::BadRequest(
            "lat and lon must be finite numbers".to_string(),
        ));
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(AppError::BadRequest(format!(
            "lat must be between -90 and 90, got {}",
            lat
        )));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(AppError::BadRequest(format!(
            "lon must be between -180 and 180, got {}",
            lon
        )));
    }
    Ok(())
}

/// Get the isobaric wind and temperature profile at a location.
///
/// Uses the nearest published grid point of the product valid closest to
/// `datetime`. Fetches and caches the product on first use.
#[utoipa::path(
    get,
    path = "/api/v1/profile",
    tag = "Profiles",
    params(ProfileQuery),
    responses(
        (status = 200, description = "Profile at the nearest grid point", body = ProfileResponse),
        (status = 400, description = "Invalid coordinates or datetime", body = ErrorResponse),
        (status = 404, description = "Coordinate outside the product's grid", body = ErrorResponse),
        (status = 502, description = "Upstream catalog, download or product format failure", body = ErrorResponse),
        (status = 503, description = "Service shutting down", body = ErrorResponse),
    )
)]
pub(crate) async fn get_profile(
    State(state): State<AppState>,
    Query(params): Query<ProfileQuery>,
) -> Result<Json<ProfileResponse>, AppError> {
    validate_coordinates(params.lat, params.lon)?;
    let time = match params.datetime.as_deref() {
        Some(raw) => parse_datetime(raw)?,
        None => Utc::now(),
    };

    let profile = state
        .profiles
        .get_profile_cancellable(params.lat, params.lon, time, &state.shutdown)
        .await?;

    tracing::debug!(
        "Profile at ({}, {}) from grid point ({}, {}), {} layers",
        params.lat,
        params.lon,
        profile.grid_point.lat(),
        profile.grid_point.lon(),
        profile.layers.len()
    );

    Ok(Json(ProfileResponse::from(&profile)))
}
