//! Error taxonomy for the booking engine.
//!
//! Core components return `Result<T, Error>`; the HTTP layer maps each kind
//! to a status code here. Bus workers never surface these outward; the bus
//! adapter turns handler errors into retries or dead letters.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Forbidden")]
    Forbidden,

    /// Conflict at hold creation or booking confirmation: a concurrent
    /// winner, or an occupancy row the caller could not see.
    #[error("{0}")]
    SlotUnavailable(&'static str),

    /// Idempotent replay of a hold whose earlier incarnation is no longer
    /// active.
    #[error("Previous hold is no longer active")]
    PreviousHoldDead,

    #[error("Hold has expired")]
    HoldExpired,

    #[error("NDA must be signed before confirming")]
    NdaRequired,

    #[error("Missing or invalid webhook signature")]
    WebhookAuth,

    #[error("transient storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transient event bus error: {0}")]
    Bus(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::SlotUnavailable(_) => StatusCode::CONFLICT,
            Error::PreviousHoldDead => StatusCode::CONFLICT,
            Error::HoldExpired => StatusCode::BAD_REQUEST,
            Error::NdaRequired => StatusCode::BAD_REQUEST,
            Error::WebhookAuth => StatusCode::UNAUTHORIZED,
            Error::Database(_) | Error::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Confirmation surfaces conflicts as 400, not 409: the client is told
    /// the hold went stale, not to retry the same request.
    pub fn conflict_as_bad_request(self) -> Self {
        match self {
            Error::SlotUnavailable(msg) => Error::Validation(msg.to_string()),
            other => other,
        }
    }

    /// True for failures the caller may safely retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Bus(_))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        // Keep the internals out of 500 bodies.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(e: validator::ValidationErrors) -> Self {
        Error::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409_on_create_and_400_on_confirm() {
        let e = Error::SlotUnavailable("Slot already held");
        assert_eq!(e.status(), StatusCode::CONFLICT);
        let e = e.conflict_as_bad_request();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn transient_kinds_surface_as_500() {
        let e = Error::Bus("connection reset".into());
        assert!(e.is_transient());
        assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
