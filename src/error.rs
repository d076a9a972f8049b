//! Error taxonomy for Parley operations.
//!
//! Every failure an operation can produce is an [`AppError`].  The variant
//! decides the HTTP status, the machine-readable `extensions.code` and the
//! caller-visible message.  Upstream and internal failures carry detail for
//! the server log only; the response body always uses a fixed message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

/// Message returned when a request lacks a usable credential.
pub const PERMISSION_DENIED: &str = "Permission denied";
/// Message returned for insufficient role or unlisted operations.
pub const NOT_AUTHORIZED: &str = "Not authorized to perform this action";
/// Message returned for any provider failure or timeout.
pub const UPSTREAM_FAILED: &str = "Failed to get response from AI service";
const INTERNAL_FAILED: &str = "Internal server error";

/// Discriminant of [`AppError`], used for metrics and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    BadInput,
    PayloadTooLarge,
    RateLimited,
    Upstream,
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Unauthenticated,
        ErrorKind::Forbidden,
        ErrorKind::BadInput,
        ErrorKind::PayloadTooLarge,
        ErrorKind::RateLimited,
        ErrorKind::Upstream,
        ErrorKind::Internal,
    ];

    /// Stable code surfaced in `extensions.code`.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::BadInput => "BAD_USER_INPUT",
            ErrorKind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Upstream => "UPSTREAM_FAILURE",
            ErrorKind::Internal => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::BadInput => StatusCode::BAD_REQUEST,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A single violated constraint reported by the input validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Failure talking to a shared store (counter or conversation).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store returned malformed data: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Permission denied")]
    Unauthenticated,

    #[error("Not authorized to perform this action")]
    Forbidden,

    #[error("{message}")]
    BadUserInput {
        message: String,
        issues: Vec<ValidationIssue>,
    },

    /// Request body over the configured limit (axum's default when unset).
    #[error("{}", too_large_message(*limit))]
    PayloadTooLarge { limit: Option<usize> },

    #[error("Rate limit exceeded. Try again after {reset_at}")]
    RateLimited { limit: u32, reset_at: DateTime<Utc> },

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_input(issues: Vec<ValidationIssue>) -> Self {
        let message = issues
            .first()
            .map(|i| i.message.clone())
            .unwrap_or_else(|| "Validation error".to_string());
        AppError::BadUserInput { message, issues }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Unauthenticated => ErrorKind::Unauthenticated,
            AppError::Forbidden => ErrorKind::Forbidden,
            AppError::BadUserInput { .. } => ErrorKind::BadInput,
            AppError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            AppError::RateLimited { .. } => ErrorKind::RateLimited,
            AppError::Upstream(_) => ErrorKind::Upstream,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to return to the caller.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Upstream(_) => UPSTREAM_FAILED.to_string(),
            AppError::Internal(_) => INTERNAL_FAILED.to_string(),
            other => other.to_string(),
        }
    }

    fn extensions(&self) -> serde_json::Value {
        let code = self.kind().code();
        match self {
            AppError::BadUserInput { issues, .. } => serde_json::json!({
                "code": code,
                "validationErrors": issues,
            }),
            AppError::RateLimited { limit, reset_at } => serde_json::json!({
                "code": code,
                "limit": limit,
                "remaining": 0,
                "resetTime": reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
            _ => serde_json::json!({ "code": code }),
        }
    }

    /// GraphQL-style error envelope `{"errors": [{message, extensions}]}`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "errors": [{
                "message": self.public_message(),
                "extensions": self.extensions(),
            }]
        })
    }
}

fn too_large_message(limit: Option<usize>) -> String {
    match limit {
        Some(limit) => format!("Request too large (body exceeded limit {} bytes)", limit),
        None => "Request too large".to_string(),
    }
}

// Store failures are never surfaced as allow or deny decisions: the
// operation fails closed with an internal error.
impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        match &self {
            AppError::Upstream(detail) => {
                tracing::error!(code = kind.code(), detail = %detail, "upstream failure");
            }
            AppError::Internal(detail) => {
                tracing::error!(code = kind.code(), detail = %detail, "internal failure");
            }
            _ => {
                tracing::debug!(code = kind.code(), message = %self, "operation rejected");
            }
        }
        (kind.status(), Json(self.to_body())).into_response()
    }
}
