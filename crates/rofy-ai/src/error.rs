//! Provider errors

use serde::Deserialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success HTTP status from the provider
    #[error("API error {status} ({kind}): {message}")]
    Status {
        status: u16,
        kind: String,
        message: String,
        /// Seconds, from the `retry-after` header
        retry_after: Option<u64>,
    },

    #[error("Invalid or missing API key")]
    InvalidApiKey,

    #[error("Request aborted")]
    Aborted,

    #[error("SSE error: {0}")]
    Sse(String),
}

/// `{"type":"error","error":{"type":..,"message":..}}`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) message: String,
}

impl Error {
    /// Build from a failed response. The body's error object supplies kind and
    /// message when it parses; otherwise the raw body is the message.
    pub fn from_status(status: u16, retry_after: Option<u64>, body: &str) -> Self {
        let (kind, message) = match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => (parsed.error.kind, parsed.error.message),
            Err(_) => (format!("http_{status}"), body.trim().to_string()),
        };
        Self::Status {
            status,
            kind,
            message,
            retry_after,
        }
    }

    /// Rate limits, overload, 5xx and dropped connections are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Sse(_) => true,
            Error::Status { status, kind, .. } => {
                *status == 429
                    || *status >= 500
                    || matches!(kind.as_str(), "overloaded_error" | "rate_limit_error" | "api_error")
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
