//! Transport-level errors and their retry classification.

use std::time::Duration;
use thiserror::Error;

/// Errors from provider transport clients.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed")]
    Auth,

    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("response parse error: {0}")]
    Parse(String),
}

/// Whether a failed attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely temporary: timeout, connection failure, rate limit, 5xx.
    Transient,

    /// Will not succeed on retry: authentication, malformed request.
    Fatal,
}

impl ProviderError {
    /// Whether this error is likely temporary.
    ///
    /// Timeouts, connection failures, rate limits and server-side (5xx)
    /// API errors are transient. Authentication failures, malformed
    /// requests, unparseable responses, and client-side (4xx) API errors
    /// are fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Auth | Self::InvalidRequest(_) | Self::Parse(_) => false,
        }
    }

    /// Classify for retry decisions.
    pub fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}
