//! Typed failure taxonomy for marketplace HTTP calls.
//!
//! Classification happens once, at the HTTP boundary, from the status code,
//! the structured `error` field of the JSON body and the `reqwest` error kind.

use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Retry policy class for marketplace failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketplaceError {
    /// Access token rejected, or refresh token revoked/already rotated.
    #[error("Marketplace rejected the credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("Marketplace rate limit reached")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Marketplace resource not found")]
    NotFound,

    /// Timeouts, connection failures and 5xx responses.
    #[error("Transient marketplace failure: {0}")]
    Transient(String),

    #[error("Marketplace API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected marketplace payload: {0}")]
    Decode(String),
}

/// Error codes the marketplace reports in the JSON body.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

const RATE_LIMIT_CODES: &[&str] = &["too_many_requests", "local_rate_limited", "quota_exceeded"];

impl MarketplaceError {
    /// Classify a non-success HTTP response.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let code = parsed.error.as_deref().unwrap_or_default();
        let message = parsed
            .message
            .clone()
            .or_else(|| parsed.error.clone())
            .unwrap_or_else(|| truncate(body, 200));

        match status.as_u16() {
            401 => Self::Unauthorized { status: 401 },
            // Token endpoint answers 400 invalid_grant for revoked/rotated refresh tokens.
            400 if code == "invalid_grant" => Self::Unauthorized { status: 400 },
            429 => Self::RateLimited { retry_after },
            403 if RATE_LIMIT_CODES.contains(&code) => Self::RateLimited { retry_after },
            404 => Self::NotFound,
            408 | 500..=599 => Self::Transient(format!("HTTP {status}: {message}")),
            other => Self::Api {
                status: other,
                message,
            },
        }
    }

    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Unauthorized { .. } => ApiRetryClass::ReauthRequired,
            Self::RateLimited { .. } | Self::Transient(_) => ApiRetryClass::Retryable,
            Self::NotFound | Self::Api { .. } | Self::Decode(_) => ApiRetryClass::Permanent,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.retry_class() == ApiRetryClass::ReauthRequired
    }
}

impl From<reqwest::Error> for MarketplaceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status, None, "")
        } else {
            // timeouts, connect failures, broken bodies
            Self::Transient(e.to_string())
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
