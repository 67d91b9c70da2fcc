//! Access-token lifecycle for marketplace connections.
//!
//! The marketplace rotates refresh tokens: each successful refresh kills the
//! token that was submitted. Refreshes are therefore single-flight per tenant.
//! Callers that find an expired token queue on the tenant's lock, and the
//! ones behind the winner re-read the connection and reuse the rotated token
//! instead of calling the provider with a dead refresh token.
//!
//! The lock is process-local. Deployments running several replicas must
//! route the scheduler trigger to a single instance.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::marketplace::OAuthClient;
use crate::store::{Connection, ConnectionStore, RefreshedTokens};

/// A token known to be unexpired at the time it was handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub marketplace_user_id: String,
    pub connected_at: Option<DateTime<Utc>>,
}

impl From<&Connection> for ValidToken {
    fn from(conn: &Connection) -> Self {
        Self {
            access_token: conn.access_token.clone(),
            expires_at: conn.expires_at,
            marketplace_user_id: conn.marketplace_user_id.clone(),
            connected_at: conn.connected_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotConnectedReason {
    NoConnection,
    Inactive,
    MissingRefreshToken,
    /// Refresh token revoked or already rotated.
    RefreshRejected,
    /// The marketplace rejected a freshly refreshed access token.
    AccessRejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenLookup {
    Valid(ValidToken),
    NotConnected(NotConnectedReason),
}

pub struct TokenManager {
    store: Arc<dyn ConnectionStore>,
    oauth: Arc<dyn OAuthClient>,
    margin: chrono::Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        oauth: Arc<dyn OAuthClient>,
        margin: chrono::Duration,
    ) -> Self {
        Self {
            store,
            oauth,
            margin,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// A valid access token for the tenant, refreshing it first when it is
    /// expired or about to expire.
    pub async fn get_valid_access_token(&self, tenant_id: &str) -> Result<TokenLookup, SyncError> {
        let conn = match self.usable_connection(tenant_id).await? {
            Ok(conn) => conn,
            Err(reason) => return Ok(TokenLookup::NotConnected(reason)),
        };

        if !conn.needs_refresh(Utc::now(), self.margin) {
            return Ok(TokenLookup::Valid(ValidToken::from(&conn)));
        }

        self.refresh_single_flight(tenant_id, |conn| conn.needs_refresh(Utc::now(), self.margin))
            .await
    }

    /// Force a refresh after the marketplace rejected `rejected_token`, unless
    /// another caller already replaced it.
    pub async fn refresh_after_rejection(
        &self,
        tenant_id: &str,
        rejected_token: &str,
    ) -> Result<TokenLookup, SyncError> {
        self.refresh_single_flight(tenant_id, |conn| conn.access_token == rejected_token)
            .await
    }

    async fn refresh_single_flight<F>(
        &self,
        tenant_id: &str,
        still_stale: F,
    ) -> Result<TokenLookup, SyncError>
    where
        F: Fn(&Connection) -> bool + Send + Sync,
    {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a caller ahead of us may have rotated the tokens.
        let conn = match self.usable_connection(tenant_id).await? {
            Ok(conn) => conn,
            Err(reason) => return Ok(TokenLookup::NotConnected(reason)),
        };
        if !still_stale(&conn) {
            debug!(tenant_id = %tenant_id, "Token already refreshed by a concurrent caller");
            return Ok(TokenLookup::Valid(ValidToken::from(&conn)));
        }

        let refresh_token = match conn.refresh_token.as_deref() {
            Some(rt) if !rt.is_empty() => rt,
            _ => {
                warn!(tenant_id = %tenant_id, "Token expired and no refresh token stored");
                return Ok(TokenLookup::NotConnected(
                    NotConnectedReason::MissingRefreshToken,
                ));
            }
        };

        let tokens = match self.oauth.refresh_token(refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) if e.is_unauthorized() => {
                warn!(tenant_id = %tenant_id, "Refresh token rejected: {e}");
                // The connection row stays as is; reconnecting is the tenant's call.
                let _ = self
                    .store
                    .log_event(
                        tenant_id,
                        "refresh_failed",
                        json!({ "error": e.to_string() }),
                    )
                    .await;
                return Ok(TokenLookup::NotConnected(NotConnectedReason::RefreshRejected));
            }
            Err(e) => {
                error!(tenant_id = %tenant_id, "Token refresh failed: {e}");
                return Err(e.into());
            }
        };

        let expires_at = match tokens.expires_at(Utc::now()) {
            Ok(at) => at,
            Err(e) => {
                error!(tenant_id = %tenant_id, "Refreshed token has an unusable lifetime: {e}");
                return Err(e.into());
            }
        };
        let refreshed = RefreshedTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
        };

        if let Err(e) = self.store.update_tokens(tenant_id, &refreshed).await {
            // The submitted refresh token is already dead upstream.
            error!(
                tenant_id = %tenant_id,
                "Refreshed tokens could not be persisted; tenant will need to reconnect: {e}"
            );
            return Err(e.into());
        }

        info!(tenant_id = %tenant_id, expires_at = %refreshed.expires_at, "Refreshed marketplace token");

        Ok(TokenLookup::Valid(ValidToken {
            access_token: refreshed.access_token,
            expires_at: refreshed.expires_at,
            marketplace_user_id: conn.marketplace_user_id,
            connected_at: conn.connected_at,
        }))
    }

    async fn usable_connection(
        &self,
        tenant_id: &str,
    ) -> Result<Result<Connection, NotConnectedReason>, SyncError> {
        Ok(match self.store.get_connection(tenant_id).await? {
            None => Err(NotConnectedReason::NoConnection),
            Some(conn) if !conn.is_active => Err(NotConnectedReason::Inactive),
            Some(conn) => Ok(conn),
        })
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
