//! Full-history claim retrieval.
//!
//! The search endpoint does not guarantee chronological order, so the walk
//! never stops early at the cutoff: every page is fetched, then filtered.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::marketplace::normalize::claim_created_at;
use crate::marketplace::{ClaimSearch, ClaimsApi, MarketplaceError, RawClaim};

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Claims created at or after the cutoff, in provider order.
    pub claims: Vec<RawClaim>,
    pub pages_processed: u32,
    /// Raw items received across all pages.
    pub total_fetched: usize,
    /// Items left after the cutoff filter.
    pub total_filtered: usize,
}

pub struct ClaimsFetcher {
    api: Arc<dyn ClaimsApi>,
    page_size: u32,
}

impl ClaimsFetcher {
    pub fn new(api: Arc<dyn ClaimsApi>, page_size: u32) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
        }
    }

    /// Walk every page of the tenant's claims, then keep those created at or
    /// after `cutoff`. Any page failure aborts the whole fetch.
    pub async fn fetch_all_claims(
        &self,
        tenant_id: &str,
        access_token: &str,
        marketplace_user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<FetchOutcome, MarketplaceError> {
        let mut all: Vec<RawClaim> = Vec::new();
        let mut offset: u64 = 0;
        let mut pages: u32 = 0;

        loop {
            let search = ClaimSearch {
                player_user_id: marketplace_user_id.to_string(),
                offset,
                limit: self.page_size,
                status: None,
            };
            let page = self.api.search_claims(access_token, &search).await?;
            pages += 1;

            let received = page.data.len() as u64;
            debug!(
                tenant_id = %tenant_id,
                offset,
                received,
                total = ?page.total,
                "Fetched claims page"
            );
            if received == 0 {
                break;
            }

            all.extend(page.data);
            // Advance by what was actually returned so a provider-side limit cap
            // cannot skip items.
            offset += received;
            // A missing or stale total cannot end the walk; only an empty page can.
            if page.total == Some(offset) {
                break;
            }
        }

        let total_fetched = all.len();
        let claims = filter_since(all, cutoff);

        Ok(FetchOutcome {
            total_filtered: claims.len(),
            claims,
            pages_processed: pages,
            total_fetched,
        })
    }
}

/// Keep claims whose `date_created` is at or after `cutoff`. Claims without a
/// readable creation date are dropped.
pub fn filter_since(claims: Vec<RawClaim>, cutoff: DateTime<Utc>) -> Vec<RawClaim> {
    claims
        .into_iter()
        .filter(|c| claim_created_at(c).is_some_and(|created| created >= cutoff))
        .collect()
}
