use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error};

/// Failures the relay reports before any stream bytes are written.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("messages array required")]
    Validation,
    #[error("API key not configured")]
    Configuration,
    #[error("API error: {status}")]
    Upstream { status: u16 },
    #[error("Internal server error")]
    Internal,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation => StatusCode::BAD_REQUEST,
            ApiError::Configuration | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Upstream { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        match &self {
            ApiError::Configuration | ApiError::Internal => {
                error!(status = status.as_u16(), message = %message, "API error");
            }
            _ => debug!(status = status.as_u16(), message = %message, "Request rejected"),
        }

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
