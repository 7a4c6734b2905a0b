//! Request-level errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No `Authorization` header.
    #[error("Missing Authorization header")]
    MissingAuthorization,

    /// The header is not `Bearer <token>`.
    #[error("Invalid token format")]
    InvalidTokenFormat,

    /// The token is not a known key.
    #[error("Unauthorized")]
    Forbidden,

    /// The body is not valid JSON for this route.
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingAuthorization | ApiError::InvalidTokenFormat => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        crate::metrics::record_error(match self {
            ApiError::Storage(_) => "storage",
            ApiError::InvalidBody(_) => "body",
            _ => "auth",
        });
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::MissingAuthorization.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InvalidTokenFormat.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::InvalidBody("eof".to_string()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Storage("disk full".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_into_response_status() {
        let response = ApiError::Forbidden.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
