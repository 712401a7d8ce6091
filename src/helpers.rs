//! Shared helpers for presenting derived values.
//!
//! Profile values are rounded to one decimal place (0.1 m/s, 0.1 °C, 0.1 m)
//! at the HTTP boundary only; everything upstream keeps full precision.
//! Non-finite values never reach a response: they become `None`, so an
//! impossible value shows up as missing data rather than as zero.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::AppError;

/// Round to 1 decimal place, or `None` for NaN / ±Inf.
pub(crate) fn round_1dp(v: f64) -> Option<f64> {
    if !v.is_finite() {
        tracing::warn!("round_1dp received non-finite value {}, reporting as missing", v);
        return None;
    }
    Some((v * 10.0).round() / 10.0)
}

/// Round an optional value to 1 decimal place.
pub(crate) fn opt_round_1dp(v: Option<f64>) -> Option<f64> {
    v.and_then(round_1dp)
}

/// Parse an ISO 8601 / RFC 3339 query parameter into UTC.
pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, AppError> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| AppError::BadRequest(format!("Invalid datetime: {}", e)))
}

/// Canonical RFC 3339 rendering used in responses ("2025-05-01T00:00:00Z").
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}
