// =============================================================================
// API Error Kinds
// =============================================================================
//
// Every failure a handler can surface maps to one of these kinds. The JSON
// body shape is stable: { "error": <kind>, "message": <detail>, "code": <http> }.
//
// Recoverable failures (sandbox runtime errors, upstream hiccups) never reach
// this type — they are localized to the task or trader that caused them.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or malformed bearer token / missing `sub` claim.
    #[error("{0}")]
    Auth(String),

    /// Authenticated, but not permitted: wrong owner or insufficient tier.
    #[error("{0}")]
    Forbidden(String),

    /// Start denied by the user's tier quota.
    #[error("{0}")]
    Quota(String),

    /// Trader or resource unknown, even after a hydration attempt.
    #[error("{0}")]
    NotFound(String),

    /// Malformed request body or illegal field combination.
    #[error("{0}")]
    Validation(String),

    /// Filter snippet rejected by the sandbox compiler.
    #[error("{0}")]
    Compile(String),

    /// Unexpected internal failure (repository loss, poisoned state).
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::Quota(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::Compile(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind name used in the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::Forbidden(_) => "authorization_error",
            Self::Quota(_) => "quota_error",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Compile(_) => "compile_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

// =============================================================================
// Tests
// =============================================================================
