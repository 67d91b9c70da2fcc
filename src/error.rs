use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::time::Duration;

use crate::crypto::CryptoError;
use crate::marketplace::MarketplaceError;
use crate::store::StoreError;

/// Unified error type for the claims-sync service.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ── Caller Errors ───────────────────────────────────────────────────
    #[error("Authentication required")]
    Unauthorized,

    #[error("Marketplace account not connected for tenant {0}; please reconnect")]
    NotConnected(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("A claims sync run is already in progress")]
    SyncInProgress,

    // ── Upstream / Infrastructure ───────────────────────────────────────
    #[error(transparent)]
    Marketplace(#[from] MarketplaceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Tenant sync exceeded {0:?}")]
    Timeout(Duration),
}

impl SyncError {
    /// Authorization root cause: the tenant has to reconnect.
    pub fn is_authorization(&self) -> bool {
        match self {
            SyncError::NotConnected(_) => true,
            SyncError::Marketplace(e) => e.is_unauthorized(),
            _ => false,
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SyncError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            SyncError::NotConnected(_) => (StatusCode::CONFLICT, "not_connected"),
            SyncError::Marketplace(e) if e.is_unauthorized() => {
                (StatusCode::CONFLICT, "not_connected")
            }
            SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SyncError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            SyncError::SyncInProgress => (StatusCode::CONFLICT, "sync_in_progress"),
            SyncError::Marketplace(MarketplaceError::RateLimited { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "marketplace_rate_limited")
            }
            SyncError::Marketplace(_) => (StatusCode::BAD_GATEWAY, "marketplace_error"),
            SyncError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            SyncError::Crypto(CryptoError::InvalidState | CryptoError::StateExpired) => {
                (StatusCode::BAD_REQUEST, "invalid_state")
            }
            SyncError::Crypto(_) => (StatusCode::INTERNAL_SERVER_ERROR, "crypto_error"),
            SyncError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        };

        let message = if self.is_authorization() {
            "Marketplace account is not connected. Please reconnect.".to_string()
        } else {
            self.to_string()
        };

        let body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
