//! Error types for OpenFirm
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why an inbound HTTP signature was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Signature header (or a header it claims to cover) is absent or unparseable
    #[error("missing or malformed signature header: {0}")]
    MissingHeader(String),

    /// The key id could not be resolved to a public key
    #[error("unknown signing key: {0}")]
    UnknownKeyId(String),

    /// Digest header does not match the received body
    #[error("digest does not match request body")]
    DigestMismatch,

    /// Signature did not verify against the resolved key
    #[error("signature verification failed")]
    CryptoMismatch,

    /// Date header is outside the accepted clock-skew window
    #[error("request date outside accepted window")]
    Expired,
}

/// Application-wide error type
///
/// This enum represents all possible errors that can occur
/// in the application. It implements `IntoResponse` to
/// automatically convert errors to appropriate HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Resource existed but was tombstoned (410)
    #[error("Resource gone")]
    Gone,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Activity or object type outside the supported set (400)
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// HTTP signature rejected (401)
    #[error("Signature rejected: {0}")]
    Signature(#[from] SignatureError),

    /// Signer, submitter or attribution disagree about the acting actor (403)
    #[error("Actor mismatch: {0}")]
    ActorMismatch(String),

    /// Accept header does not allow an ActivityStreams representation (406)
    #[error("Not acceptable")]
    NotAcceptable,

    /// Content-Type is not an ActivityStreams media type (415)
    #[error("Unsupported media type")]
    UnsupportedMediaType,

    /// Remote discovery or dereference failed (502)
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Destination refused by SSRF guard (403)
    #[error("Destination not allowed: {0}")]
    Forbidden(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Gone => "gone",
            AppError::Validation(_) => "validation",
            AppError::UnsupportedType(_) => "unsupported_type",
            AppError::Signature(_) => "signature",
            AppError::ActorMismatch(_) => "actor_mismatch",
            AppError::NotAcceptable => "not_acceptable",
            AppError::UnsupportedMediaType => "unsupported_media_type",
            AppError::Fetch(_) => "fetch",
            AppError::Forbidden(_) => "forbidden",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Gone => (StatusCode::GONE, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::UnsupportedType(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Signature(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::ActorMismatch(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::NotAcceptable => (StatusCode::NOT_ACCEPTABLE, self.to_string()),
            AppError::UnsupportedMediaType => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, self.to_string())
            }
            AppError::Fetch(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.kind()]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_federation_errors_to_statuses() {
        let cases = [
            (
                AppError::Signature(SignatureError::DigestMismatch),
                StatusCode::UNAUTHORIZED,
            ),
            (
                AppError::ActorMismatch("x".to_string()),
                StatusCode::FORBIDDEN,
            ),
            (
                AppError::UnsupportedType("FooBar".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (AppError::NotAcceptable, StatusCode::NOT_ACCEPTABLE),
            (
                AppError::UnsupportedMediaType,
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (AppError::Gone, StatusCode::GONE),
            (AppError::Fetch("down".to_string()), StatusCode::BAD_GATEWAY),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
