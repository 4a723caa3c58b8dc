// =============================================================================
// Error taxonomy — component failures and the boundary error envelope
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures produced by the exchange client and the candle cache.
///
/// `Clone` because a single in-flight candle fetch hands the same outcome to
/// every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Network failure, timeout or 5xx after the retry budget was spent.
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    /// OKX answered with a structured error (non-zero `code`) or a 4xx.
    #[error("exchange error {code}: {msg}")]
    UpstreamError { code: String, msg: String },

    /// A success status whose body did not match the expected schema.
    #[error("malformed exchange response: {0}")]
    MalformedResponse(String),
}

impl ExchangeError {
    /// Whether the retry loop may try the same request again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// =============================================================================
// Boundary errors
// =============================================================================

/// Machine-readable error kind returned to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    RateLimited,
    Unavailable,
    UpstreamError,
    NotFound,
    /// Admin endpoints only.
    Forbidden,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamError => StatusCode::BAD_GATEWAY,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

/// Error returned by every `MarketDataService` operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }
}

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::InvalidArgument(msg) => Self::new(ErrorKind::InvalidArgument, msg),
            ExchangeError::Unavailable(msg) => Self::new(ErrorKind::Unavailable, msg),
            ExchangeError::UpstreamError { code, msg } => {
                Self::new(ErrorKind::UpstreamError, format!("OKX error {code}: {msg}"))
            }
            // Parse detail stays in the logs.
            ExchangeError::MalformedResponse(_) => Self::new(
                ErrorKind::Unavailable,
                "exchange returned an unexpected response",
            ),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a ApiError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        (status, Json(ErrorBody { error: &self })).into_response()
    }
}

// =============================================================================
// Tests
// =============================================================================
