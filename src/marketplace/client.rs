use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::error::{parse_retry_after, MarketplaceError};
use super::normalize::id_string;
use super::retry::{retry_with_backoff, RetryPolicy};
use super::traits::{ClaimSearch, ClaimsApi, ClaimsPage, OAuthClient, TokenSet};

/// Marketplace REST client (OAuth token endpoint + post-purchase claims API).
///
/// Every call carries the client-wide timeout; retryable failures are retried
/// with backoff before surfacing.
pub struct MarketplaceClient {
    client_id: String,
    client_secret: String,
    api_url: String,
    auth_url: String,
    retry: RetryPolicy,
    http: reqwest::Client,
}

// Raw token response from the marketplace token endpoint
#[derive(Debug, Deserialize)]
struct MarketplaceTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: u64,
    scope: Option<String>,
    user_id: Option<Value>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

#[derive(Debug, Deserialize)]
struct Paging {
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Value>,
    paging: Option<Paging>,
}

impl From<MarketplaceTokenResponse> for TokenSet {
    fn from(r: MarketplaceTokenResponse) -> Self {
        TokenSet {
            access_token: r.access_token,
            refresh_token: r.refresh_token,
            token_type: r.token_type,
            expires_in: r.expires_in,
            scope: r.scope,
            user_id: r.user_id.as_ref().and_then(id_string),
        }
    }
}

impl MarketplaceClient {
    pub fn new(
        client_id: String,
        client_secret: String,
        api_url: String,
        auth_url: String,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, MarketplaceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| MarketplaceError::Transient(format!("HTTP client init failed: {e}")))?;

        Ok(Self {
            client_id,
            client_secret,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth_url: auth_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::new(max_retries),
            http,
        })
    }

    async fn decode<T: DeserializeOwned + Send>(resp: reqwest::Response) -> Result<T, MarketplaceError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| MarketplaceError::Decode(e.to_string()));
        }

        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        Err(MarketplaceError::from_status(status, retry_after, &body))
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        operation: &str,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketplaceError> {
        let url = format!("{}{}", self.api_url, path);
        let url = url.as_str();
        retry_with_backoff(&self.retry, operation, move || async move {
            let resp = self
                .http
                .get(url)
                .bearer_auth(access_token)
                .header("Accept", "application/json")
                .query(query)
                .send()
                .await?;
            Self::decode::<T>(resp).await
        })
        .await
    }

    async fn post_token(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        form: &[(&str, &str)],
    ) -> Result<TokenSet, MarketplaceError> {
        let url = format!("{}/oauth/token", self.api_url);
        let url = url.as_str();
        let token_resp: MarketplaceTokenResponse =
            retry_with_backoff(policy, operation, move || async move {
                let resp = self
                    .http
                    .post(url)
                    .header("Accept", "application/json")
                    .form(form)
                    .send()
                    .await?;
                Self::decode(resp).await
            })
            .await?;

        Ok(token_resp.into())
    }

    fn claim_path(claim_id: &str, suffix: &str) -> String {
        format!(
            "/post-purchase/v1/claims/{}{}",
            urlencoding(claim_id),
            suffix
        )
    }
}

#[async_trait]
impl OAuthClient for MarketplaceClient {
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String {
        format!(
            "{base}/authorization?\
             response_type=code\
             &client_id={client_id}\
             &redirect_uri={redirect_uri}\
             &state={state}",
            base = self.auth_url,
            client_id = urlencoding(&self.client_id),
            redirect_uri = urlencoding(redirect_uri),
            state = urlencoding(state),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, MarketplaceError> {
        // Codes are single-use: only retry when the request was rejected before processing.
        let policy = self.retry.rate_limits_only();
        self.post_token(
            "oauth.exchange_code",
            &policy,
            &[
                ("grant_type", "authorization_code"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, MarketplaceError> {
        // A replayed refresh after a lost response would hit an already-rotated token.
        let policy = self.retry.rate_limits_only();
        self.post_token(
            "oauth.refresh_token",
            &policy,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}

#[async_trait]
impl ClaimsApi for MarketplaceClient {
    async fn search_claims(
        &self,
        access_token: &str,
        search: &ClaimSearch,
    ) -> Result<ClaimsPage, MarketplaceError> {
        let mut query = vec![
            ("player_role", "respondent".to_string()),
            ("player_user_id", search.player_user_id.clone()),
            ("offset", search.offset.to_string()),
            ("limit", search.limit.to_string()),
        ];
        if let Some(status) = &search.status {
            query.push(("status", status.clone()));
        }

        let resp: SearchResponse = self
            .get_json(
                "claims.search",
                access_token,
                "/post-purchase/v1/claims/search",
                &query,
            )
            .await?;

        Ok(ClaimsPage {
            data: resp.data,
            total: resp.paging.and_then(|p| p.total),
        })
    }

    async fn claim_detail(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Value, MarketplaceError> {
        self.get_json(
            "claims.detail",
            access_token,
            &Self::claim_path(claim_id, ""),
            &[],
        )
        .await
    }

    async fn claim_messages(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError> {
        let raw: Value = self
            .get_json(
                "claims.messages",
                access_token,
                &Self::claim_path(claim_id, "/messages"),
                &[],
            )
            .await?;
        Ok(into_list(raw))
    }

    async fn claim_actions_history(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError> {
        let raw: Value = self
            .get_json(
                "claims.actions_history",
                access_token,
                &Self::claim_path(claim_id, "/actions-history"),
                &[],
            )
            .await?;
        Ok(into_list(raw))
    }

    async fn claim_status_history(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError> {
        let raw: Value = self
            .get_json(
                "claims.status_history",
                access_token,
                &Self::claim_path(claim_id, "/status-history"),
                &[],
            )
            .await?;
        Ok(into_list(raw))
    }

    async fn claim_affects_reputation(
        &self,
        access_token: &str,
        claim_id: &str,
    ) -> Result<Value, MarketplaceError> {
        self.get_json(
            "claims.affects_reputation",
            access_token,
            &Self::claim_path(claim_id, "/affects-reputation"),
            &[],
        )
        .await
    }
}

/// Sub-resource endpoints answer either a bare array or `{ "data": [...] }`.
fn into_list(raw: Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Simple percent-encoding for URL parameters.
fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
