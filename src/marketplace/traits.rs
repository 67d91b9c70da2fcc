use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::MarketplaceError;

/// Tokens returned by the marketplace after a code exchange or a refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    /// The marketplace rotates refresh tokens: the previous one is dead once this arrives.
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: u64,
    pub scope: Option<String>,
    /// Marketplace seller id; only meaningful on the initial code exchange.
    pub user_id: Option<String>,
}

impl TokenSet {
    /// Absolute expiry of the access token, counted from `now`.
    ///
    /// An `expires_in` that does not fit a timestamp is a malformed payload.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, MarketplaceError> {
        i64::try_from(self.expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                MarketplaceError::Decode(format!("expires_in out of range: {}", self.expires_in))
            })
    }
}

/// One page of the claims search.
#[derive(Debug, Clone, Default)]
pub struct ClaimsPage {
    pub data: Vec<Value>,
    /// Total matching claims as reported by the provider, when it reports one.
    pub total: Option<u64>,
}

/// Parameters for a single claims search call.
#[derive(Debug, Clone)]
pub struct ClaimSearch {
    pub player_user_id: String,
    pub offset: u64,
    pub limit: u32,
    pub status: Option<String>,
}

/// OAuth2 authorization-code flow against the marketplace.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// URL the tenant is redirected to in order to grant access.
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String;

    /// Exchange an authorization code for the first token set.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, MarketplaceError>;

    /// Exchange a refresh token for a new token set.
    ///
    /// On success the submitted refresh token is invalidated upstream.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, MarketplaceError>;
}

/// Read-only claims endpoints.
#[async_trait]
pub trait ClaimsApi: Send + Sync {
    async fn search_claims(
        &self,
        access_token: &str,
        search: &ClaimSearch,
    ) -> Result<ClaimsPage, MarketplaceError>;

    async fn claim_detail(&self, access_token: &str, claim_id: &str)
        -> Result<Value, MarketplaceError>;

    async fn claim_messages(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError>;

    async fn claim_actions_history(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError>;

    async fn claim_status_history(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError>;

    async fn claim_affects_reputation(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Value, MarketplaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tokens(expires_in: u64) -> TokenSet {
        TokenSet {
            access_token: "at-1".into(),
            refresh_token: Some("rt-1".into()),
            token_type: "Bearer".into(),
            expires_in,
            scope: None,
            user_id: None,
        }
    }

    #[test]
    fn expiry_is_counted_from_now() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(
            tokens(21600).expires_at(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap()
        );
    }

    #[test]
    fn oversized_lifetime_is_a_decode_error() {
        let now = Utc::now();
        for expires_in in [u64::MAX, i64::MAX as u64, 10_000_000_000_000_000, 9_000_000_000_000] {
            assert!(
                matches!(tokens(expires_in).expires_at(now), Err(MarketplaceError::Decode(_))),
                "expires_in={expires_in}"
            );
        }
    }
}
