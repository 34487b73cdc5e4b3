//! Error types for the admin / query HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Engine error
    #[error(transparent)]
    Engine(cap_common::Error),
}

impl From<cap_common::Error> for ApiError {
    fn from(err: cap_common::Error) -> Self {
        match err {
            cap_common::Error::NotFound(msg) => ApiError::NotFound(msg),
            cap_common::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Engine(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Engine(ref err) => {
                let (status, code) = match err {
                    cap_common::Error::Config(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "CONFIGURATION_ERROR")
                    }
                    e if e.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT_ERROR"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
                };
                (status, code, err.to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for API results
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError::from(cap_common::Error::NotFound("listing".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_config_error_maps_to_422() {
        let response = ApiError::from(cap_common::Error::Config("bad seed".into())).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_queue_error_is_transient() {
        let response = ApiError::from(cap_common::Error::Queue("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
