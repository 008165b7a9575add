use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy shared across the banking backend.
///
/// Consent, sync and rate-limit variants carry PSD2 semantics: a
/// `ConsentExpired` is always accompanied by the connection state
/// transition, and `RateLimited` is a deferral rather than a fault.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Invalid consent scope: {0}")]
    InvalidScope(String),

    #[error("Consent not yet authorized: {0}")]
    ConsentNotYetAuthorized(String),

    #[error("Consent expired: {0}")]
    ConsentExpired(String),

    /// Second field is the Retry-After hint in seconds.
    #[error("Rate limited: {0}")]
    RateLimited(String, Option<u64>),

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("Invalid rule pattern: {0}")]
    InvalidPattern(String),

    #[error("Upstream provider error: {0}")]
    UpstreamError(String),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code surfaced in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidScope(_) => "INVALID_SCOPE",
            AppError::ConsentNotYetAuthorized(_) => "CONSENT_NOT_AUTHORIZED",
            AppError::ConsentExpired(_) => "CONSENT_EXPIRED",
            AppError::RateLimited(_, _) => "RATE_LIMITED",
            AppError::SyncFailed(_) => "SYNC_FAILED",
            AppError::InvalidPattern(_) => "INVALID_PATTERN",
            AppError::UpstreamError(_) => "UPSTREAM_ERROR",
            AppError::Conflict(_) => "CONFLICT",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::InternalError(_) => "INTERNAL_ERROR",
            AppError::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::InvalidScope(_) | AppError::InvalidPattern(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ConsentNotYetAuthorized(_) | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ConsentExpired(_) => StatusCode::GONE,
            AppError::RateLimited(_, _) => StatusCode::TOO_MANY_REQUESTS,
            AppError::SyncFailed(_) | AppError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            AppError::DatabaseError(_)
            | AppError::InternalError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Internal detail stays in the logs, not the body.
            AppError::DatabaseError(_) => "Database error".to_string(),
            AppError::InternalError(_) => "Internal server error".to_string(),
            AppError::ConfigError(_) => "Configuration error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let retry_after = match &self {
            AppError::RateLimited(_, retry) => *retry,
            _ => None,
        };

        let mut res = (
            status,
            Json(ErrorEnvelope {
                success: false,
                error: ErrorBody {
                    code: self.code(),
                    message: self.public_message(),
                },
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}
