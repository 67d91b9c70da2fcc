//! Scripted in-memory marketplace used by the pipeline tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::error::MarketplaceError;
use super::normalize::id_string;
use super::traits::{ClaimSearch, ClaimsApi, ClaimsPage, OAuthClient, TokenSet};

#[derive(Default)]
pub struct FakeMarketplace {
    /// Claims per marketplace user id, in provider order.
    claims: Mutex<HashMap<String, Vec<Value>>>,
    /// Injected failures keyed by (user id, offset).
    page_failures: Mutex<HashMap<(String, u64), MarketplaceError>>,
    /// Refresh tokens the provider still honours; consumed on use.
    live_refresh_tokens: Mutex<HashSet<String>>,
    failing_sub_resources: Mutex<HashSet<&'static str>>,
    /// Access tokens with a limited number of accepted searches left.
    access_token_uses: Mutex<HashMap<String, u32>>,
    /// Overrides the `total` reported on search pages, per user id.
    reported_totals: Mutex<HashMap<String, Option<u64>>>,
    /// Overrides `expires_in` on issued token sets.
    token_lifetime: Mutex<Option<u64>>,
    refresh_delay: Mutex<Duration>,
    search_delay: Mutex<Duration>,
    issued: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub search_calls: AtomicU32,
    pub searched_offsets: Mutex<Vec<(String, u64)>>,
    pub tokens_seen: Mutex<Vec<String>>,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_claims(&self, user_id: &str, claims: Vec<Value>) {
        self.claims
            .lock()
            .unwrap()
            .insert(user_id.to_string(), claims);
    }

    pub fn fail_page(&self, user_id: &str, offset: u64, err: MarketplaceError) {
        self.page_failures
            .lock()
            .unwrap()
            .insert((user_id.to_string(), offset), err);
    }

    pub fn accept_refresh_token(&self, token: &str) {
        self.live_refresh_tokens
            .lock()
            .unwrap()
            .insert(token.to_string());
    }

    pub fn fail_sub_resource(&self, name: &'static str) {
        self.failing_sub_resources.lock().unwrap().insert(name);
    }

    /// Report `total` on every search page for `user_id` instead of the real count.
    pub fn report_total(&self, user_id: &str, total: Option<u64>) {
        self.reported_totals
            .lock()
            .unwrap()
            .insert(user_id.to_string(), total);
    }

    pub fn set_token_lifetime(&self, expires_in: u64) {
        *self.token_lifetime.lock().unwrap() = Some(expires_in);
    }

    fn expires_in(&self) -> u64 {
        self.token_lifetime.lock().unwrap().unwrap_or(21600)
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn set_search_delay(&self, delay: Duration) {
        *self.search_delay.lock().unwrap() = delay;
    }

    /// Accept `token` for `uses` more searches, then answer 401.
    pub fn revoke_access_token_after(&self, token: &str, uses: u32) {
        self.access_token_uses
            .lock()
            .unwrap()
            .insert(token.to_string(), uses);
    }

    pub fn search_count(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn sub_resource(&self, name: &'static str) -> Result<(), MarketplaceError> {
        if self.failing_sub_resources.lock().unwrap().contains(name) {
            return Err(MarketplaceError::Transient(format!("{name} unavailable")));
        }
        Ok(())
    }
}

/// Claim payload in the search-result shape.
pub fn claim(id: u64, date_created: &str) -> Value {
    json!({
        "id": id,
        "type": "mediations",
        "stage": "claim",
        "status": "opened",
        "resource": "order",
        "resource_id": 2_000_000_000_u64 + id,
        "reason_id": "PDD9939",
        "date_created": date_created,
        "last_updated": date_created,
    })
}

#[async_trait]
impl OAuthClient for FakeMarketplace {
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String {
        format!("https://auth.fake/authorization?state={state}&redirect_uri={redirect_uri}")
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenSet, MarketplaceError> {
        if code != "good-code" {
            return Err(MarketplaceError::Unauthorized { status: 400 });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let refresh = format!("rt-{n}");
        self.accept_refresh_token(&refresh);
        Ok(TokenSet {
            access_token: format!("at-{n}"),
            refresh_token: Some(refresh),
            token_type: "Bearer".into(),
            expires_in: self.expires_in(),
            scope: Some("offline_access read".into()),
            user_id: Some("9001".into()),
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, MarketplaceError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // Rotation: the submitted token dies whether or not anyone sees the response.
        if !self.live_refresh_tokens.lock().unwrap().remove(refresh_token) {
            return Err(MarketplaceError::Unauthorized { status: 400 });
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let refresh = format!("rt-{n}");
        self.accept_refresh_token(&refresh);
        Ok(TokenSet {
            access_token: format!("at-{n}"),
            refresh_token: Some(refresh),
            token_type: "Bearer".into(),
            expires_in: self.expires_in(),
            scope: None,
            user_id: None,
        })
    }
}

#[async_trait]
impl ClaimsApi for FakeMarketplace {
    async fn search_claims(
        &self,
        access_token: &str,
        search: &ClaimSearch,
    ) -> Result<ClaimsPage, MarketplaceError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen
            .lock()
            .unwrap()
            .push(access_token.to_string());
        self.searched_offsets
            .lock()
            .unwrap()
            .push((search.player_user_id.clone(), search.offset));

        let delay = *self.search_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(left) = self.access_token_uses.lock().unwrap().get_mut(access_token) {
            if *left == 0 {
                return Err(MarketplaceError::Unauthorized { status: 401 });
            }
            *left -= 1;
        }

        let key = (search.player_user_id.clone(), search.offset);
        if let Some(err) = self.page_failures.lock().unwrap().get(&key) {
            return Err(err.clone());
        }

        let claims = self.claims.lock().unwrap();
        let all = claims
            .get(&search.player_user_id)
            .cloned()
            .unwrap_or_default();
        let filtered: Vec<Value> = all
            .into_iter()
            .filter(|c| match &search.status {
                Some(status) => c.get("status").and_then(Value::as_str) == Some(status.as_str()),
                None => true,
            })
            .collect();

        let total = match self.reported_totals.lock().unwrap().get(&search.player_user_id) {
            Some(reported) => *reported,
            None => Some(filtered.len() as u64),
        };
        let data = filtered
            .into_iter()
            .skip(search.offset as usize)
            .take(search.limit as usize)
            .collect();

        Ok(ClaimsPage { data, total })
    }

    async fn claim_detail(
        &self,
        _access_token: &str,
        claim_id: &str,
    ) -> Result<Value, MarketplaceError> {
        self.sub_resource("detail")?;
        let claims = self.claims.lock().unwrap();
        claims
            .values()
            .flatten()
            .find(|c| c.get("id").and_then(id_string).as_deref() == Some(claim_id))
            .cloned()
            .ok_or(MarketplaceError::NotFound)
    }

    async fn claim_messages(
        &self,
        _access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError> {
        self.sub_resource("messages")?;
        Ok(vec![json!({ "claim_id": claim_id, "message": "hello" })])
    }

    async fn claim_actions_history(
        &self,
        _access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError> {
        self.sub_resource("actions_history")?;
        Ok(vec![json!({ "claim_id": claim_id, "action_name": "send_message_to_complainant" })])
    }

    async fn claim_status_history(
        &self,
        _access_token: &str,
        claim_id: &str,
    ) -> Result<Vec<Value>, MarketplaceError> {
        self.sub_resource("status_history")?;
        Ok(vec![json!({ "claim_id": claim_id, "status": "opened" })])
    }

    async fn claim_affects_reputation(
        &self,
        _access_token: &str,
        claim_id: &str,
    ) -> Result<Value, MarketplaceError> {
        self.sub_resource("affects_reputation")?;
        Ok(json!({ "claim_id": claim_id, "affects_reputation": "not_affected" }))
    }
}
