//! Idempotent persistence of fetched claims plus retention pruning.

use chrono::{DateTime, Months, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::marketplace::{NormalizedClaim, RawClaim};
use crate::store::{ClaimStore, MirroredClaim, StoreError, UpsertOutcome};

/// Mirrored claims older than this are deleted on every sync.
pub const RETENTION_MONTHS: u32 = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Payloads dropped because no claim id could be resolved.
    pub skipped: usize,
    pub pruned: u64,
}

impl PersistOutcome {
    /// Rows written by this run.
    pub fn upserted(&self) -> usize {
        self.created + self.updated
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

pub struct ClaimsSyncEngine {
    store: Arc<dyn ClaimStore>,
    chunk_size: usize,
}

impl ClaimsSyncEngine {
    pub fn new(store: Arc<dyn ClaimStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn persist(
        &self,
        tenant_id: &str,
        claims: Vec<RawClaim>,
    ) -> Result<PersistOutcome, StoreError> {
        self.persist_at(tenant_id, claims, Utc::now()).await
    }

    /// Upsert every claim keyed by (tenant, claim id), in chunks whose upserts
    /// run concurrently, then prune the tenant's claims past retention.
    ///
    /// Complement rows are never read or written here.
    pub async fn persist_at(
        &self,
        tenant_id: &str,
        claims: Vec<RawClaim>,
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError> {
        let mut outcome = PersistOutcome::default();
        let rows = self.normalize_batch(tenant_id, claims, now, &mut outcome);

        for chunk in rows.chunks(self.chunk_size) {
            let results = join_all(chunk.iter().map(|row| self.store.upsert_claim(row))).await;

            // Every upsert of the chunk has settled; surface the first failure.
            let mut first_err = None;
            for result in results {
                match result {
                    Ok(o) => outcome.record(o),
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }

        outcome.pruned = self
            .store
            .prune_claims(tenant_id, retention_threshold(now))
            .await?;

        debug!(
            tenant_id = %tenant_id,
            created = outcome.created,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            skipped = outcome.skipped,
            pruned = outcome.pruned,
            "Persisted claims"
        );
        Ok(outcome)
    }

    /// Normalize payloads, dropping unusable ones and collapsing duplicate ids
    /// (a claim can shift across pages between calls) to the last occurrence.
    fn normalize_batch(
        &self,
        tenant_id: &str,
        claims: Vec<RawClaim>,
        now: DateTime<Utc>,
        outcome: &mut PersistOutcome,
    ) -> Vec<MirroredClaim> {
        let mut rows: Vec<MirroredClaim> = Vec::with_capacity(claims.len());
        let mut index: HashMap<String, usize> = HashMap::new();

        for raw in claims {
            let normalized = match NormalizedClaim::from_payload(&raw) {
                Ok(n) => n,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, "Skipping claim payload: {e}");
                    outcome.skipped += 1;
                    continue;
                }
            };

            let row = MirroredClaim::new(tenant_id, normalized, raw, now);
            match index.get(&row.claim_id) {
                Some(&i) => rows[i] = row,
                None => {
                    index.insert(row.claim_id.clone(), rows.len());
                    rows.push(row);
                }
            }
        }
        rows
    }
}

/// Claims created strictly before this instant are pruned.
pub fn retention_threshold(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(RETENTION_MONTHS))
        .unwrap_or(now - chrono::Duration::days(365))
}
