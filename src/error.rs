use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Error kinds surfaced across the sequencer, matching the propagation
/// rules in the error handling design: some are returned to the submitter
/// verbatim and never retried, some drive internal retries, some are
/// opaque until every fallback is exhausted.
#[derive(Debug)]
pub enum AppError {
    InvalidInput(String),
    AuthFailure,
    NonceReplay,
    InsufficientBalance,
    Expired,
    RateLimited,
    BatchFull,
    Timeout(String),
    Transient(String),
    ProviderUnhealthy(String),
    ConsistencyViolation(String),
    Fatal(String),
    NotFound(String),
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::AuthFailure => StatusCode::UNAUTHORIZED,
            AppError::NonceReplay => StatusCode::CONFLICT,
            AppError::InsufficientBalance => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Expired => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::BatchFull => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ProviderUnhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ConsistencyViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::AuthFailure => "AUTH_FAILURE",
            AppError::NonceReplay => "NONCE_REPLAY",
            AppError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            AppError::Expired => "EXPIRED",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::BatchFull => "BATCH_FULL",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Transient(_) => "TRANSIENT",
            AppError::ProviderUnhealthy(_) => "PROVIDER_UNHEALTHY",
            AppError::ConsistencyViolation(_) => "CONSISTENCY_VIOLATION",
            AppError::Fatal(_) => "FATAL",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Sanitized message shown to clients. Internal details are logged
    /// server-side only.
    fn public_message(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid request",
            AppError::AuthFailure => "authentication failed",
            AppError::NonceReplay => "nonce already used",
            AppError::InsufficientBalance => "insufficient balance",
            AppError::Expired => "transaction expired",
            AppError::RateLimited => "rate limited",
            AppError::BatchFull => "service at capacity, try again later",
            AppError::Timeout(_) => "request timed out",
            AppError::Transient(_) => "temporarily unavailable, retry",
            AppError::ProviderUnhealthy(_) => "signing temporarily unavailable",
            AppError::ConsistencyViolation(_) => "internal error",
            AppError::Fatal(_) => "internal error",
            AppError::NotFound(_) => "not found",
            AppError::Internal(_) => "internal error",
        }
    }

    /// True for error kinds the submitter should never retry.
    pub fn is_terminal_for_submitter(&self) -> bool {
        matches!(
            self,
            AppError::InvalidInput(_)
                | AppError::AuthFailure
                | AppError::NonceReplay
                | AppError::InsufficientBalance
                | AppError::Expired
                | AppError::RateLimited
        )
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            AppError::AuthFailure => write!(f, "auth failure"),
            AppError::NonceReplay => write!(f, "nonce replay"),
            AppError::InsufficientBalance => write!(f, "insufficient balance"),
            AppError::Expired => write!(f, "expired"),
            AppError::RateLimited => write!(f, "rate limited"),
            AppError::BatchFull => write!(f, "batch queue is full"),
            AppError::Timeout(msg) => write!(f, "timeout: {msg}"),
            AppError::Transient(msg) => write!(f, "transient: {msg}"),
            AppError::ProviderUnhealthy(msg) => write!(f, "provider unhealthy: {msg}"),
            AppError::ConsistencyViolation(msg) => write!(f, "consistency violation: {msg}"),
            AppError::Fatal(msg) => write!(f, "fatal: {msg}"),
            AppError::NotFound(msg) => write!(f, "not found: {msg}"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // SECURITY: log the full error server-side, never expose internals.
        match &self {
            AppError::ConsistencyViolation(_) | AppError::Fatal(_) | AppError::Internal(_) => {
                error!(error = %self, "request failed");
            }
            AppError::Timeout(_) | AppError::Transient(_) | AppError::ProviderUnhealthy(_) => {
                tracing::warn!(error = %self, "request failed");
            }
            _ => {}
        }

        let status = self.status_code();
        let body = json!({
            "error": self.public_message(),
            "code": self.error_code(),
        });
        (status, axum::Json(body)).into_response()
    }
}
