use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

/// Failure kinds of the isobaric ingestion pipeline.
///
/// Every stage returns one of these instead of panicking; the profile service
/// propagates the first failure unchanged.
#[derive(Debug, thiserror::Error)]
pub enum IsobaricError {
    #[error("Isobaric data availability could not be resolved: {0}")]
    Availability(String),

    #[error("Isobaric product could not be fetched: {0}")]
    Fetching(String),

    #[error("Isobaric product could not be parsed: {0}")]
    Parsing(String),

    #[error("Coordinate ({lat:.4}, {lon:.4}) is outside the isobaric product's grid")]
    OutOfBounds { lat: f64, lon: f64 },

    #[error("Isobaric data could not be mapped: {0}")]
    DataParsing(String),

    #[error("Isobaric product cache failed: {0}")]
    Cache(#[from] sqlx::Error),

    #[error("Isobaric query was cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Isobaric(#[from] IsobaricError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Isobaric(err) => match err {
                IsobaricError::Availability(_)
                | IsobaricError::Fetching(_)
                | IsobaricError::Parsing(_)
                | IsobaricError::DataParsing(_) => (StatusCode::BAD_GATEWAY, err.to_string()),
                IsobaricError::OutOfBounds { .. } => (StatusCode::NOT_FOUND, err.to_string()),
                IsobaricError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
                IsobaricError::Cache(db_err) => {
                    tracing::error!("Product cache error: {:?}", db_err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal cache error".to_string(),
                    )
                }
            },
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}
