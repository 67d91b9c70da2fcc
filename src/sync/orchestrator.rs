//! Per-tenant sync runs: token, then full fetch, then persist.
//!
//! Tenants share no state, so a run processes them through a bounded worker
//! pool. Each tenant's failure (fetch, persistence, timeout) is logged,
//! recorded as an integration event and counted; it never stops the others.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::cutoff::resolve_cutoff;
use super::engine::ClaimsSyncEngine;
use super::fetcher::{ClaimsFetcher, FetchOutcome};
use super::tokens::{NotConnectedReason, TokenLookup, TokenManager, ValidToken};
use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::marketplace::ClaimsApi;
use crate::store::{ClaimStore, ConnectionStore};

/// Aggregate counts of one run. `accountsProcessed` and `claimsUpdated` are
/// what the scheduler contract promises; the rest is detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Tenants synced to completion.
    pub accounts_processed: usize,
    /// Mirrored claims written (created or changed).
    pub claims_updated: usize,
    pub claims_created: usize,
    pub claims_pruned: u64,
    pub accounts_failed: usize,
    pub accounts_not_connected: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSyncStats {
    pub cutoff: DateTime<Utc>,
    pub pages_processed: u32,
    pub total_fetched: usize,
    pub total_filtered: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub pruned: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantSyncOutcome {
    Synced(TenantSyncStats),
    /// Skipped with no state change; the tenant has to reconnect.
    NotConnected(NotConnectedReason),
}

pub struct SyncOrchestrator {
    connections: Arc<dyn ConnectionStore>,
    tokens: Arc<TokenManager>,
    fetcher: ClaimsFetcher,
    engine: ClaimsSyncEngine,
    settings: SyncSettings,
    run_lock: tokio::sync::Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        claims: Arc<dyn ClaimStore>,
        claims_api: Arc<dyn ClaimsApi>,
        tokens: Arc<TokenManager>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            connections,
            tokens,
            fetcher: ClaimsFetcher::new(claims_api, settings.page_size),
            engine: ClaimsSyncEngine::new(claims, settings.chunk_size),
            settings,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Sync every tenant with an active connection.
    ///
    /// Only listing the connections can fail the run as a whole. A run that
    /// starts while another is in flight is rejected.
    pub async fn run_sync(&self) -> Result<SyncReport, SyncError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::SyncInProgress)?;

        let started = Instant::now();
        let connections = self.connections.list_active_connections().await?;
        info!(tenants = connections.len(), "Claims sync run started");

        let results: Vec<(String, Result<TenantSyncOutcome, SyncError>)> =
            stream::iter(connections)
                .map(|conn| async move {
                    let result = self.sync_tenant(&conn.tenant_id).await;
                    (conn.tenant_id, result)
                })
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

        let mut report = SyncReport::default();
        for (tenant_id, result) in results {
            match result {
                Ok(TenantSyncOutcome::Synced(stats)) => {
                    report.accounts_processed += 1;
                    report.claims_created += stats.created;
                    report.claims_updated += stats.created + stats.updated;
                    report.claims_pruned += stats.pruned;
                }
                Ok(TenantSyncOutcome::NotConnected(_)) => report.accounts_not_connected += 1,
                Err(e) if e.is_authorization() => {
                    warn!(tenant_id = %tenant_id, "Tenant needs to reconnect: {e}");
                    report.accounts_not_connected += 1;
                }
                Err(_) => report.accounts_failed += 1,
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            accounts_processed = report.accounts_processed,
            claims_updated = report.claims_updated,
            accounts_failed = report.accounts_failed,
            accounts_not_connected = report.accounts_not_connected,
            duration_ms = report.duration_ms,
            "Claims sync run finished"
        );
        Ok(report)
    }

    /// Sync a single tenant, bounded by the per-tenant timeout. Failures are
    /// recorded as a `sync_failed` event before being returned.
    pub async fn sync_tenant(&self, tenant_id: &str) -> Result<TenantSyncOutcome, SyncError> {
        let timeout = self.settings.tenant_timeout;
        let result = match tokio::time::timeout(timeout, self.sync_tenant_inner(tenant_id)).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout)),
        };

        match &result {
            Ok(TenantSyncOutcome::Synced(stats)) => {
                self.record(tenant_id, "sync_completed", json!(stats)).await;
            }
            Ok(TenantSyncOutcome::NotConnected(reason)) => {
                info!(tenant_id = %tenant_id, ?reason, "Skipping tenant: not connected");
            }
            Err(e) => {
                error!(tenant_id = %tenant_id, "Claims sync failed: {e}");
                let class = match e {
                    SyncError::Marketplace(m) => format!("{:?}", m.retry_class()),
                    SyncError::Timeout(_) => "Timeout".to_string(),
                    _ => "Internal".to_string(),
                };
                self.record(
                    tenant_id,
                    "sync_failed",
                    json!({ "error": e.to_string(), "class": class }),
                )
                .await;
            }
        }
        result
    }

    async fn sync_tenant_inner(&self, tenant_id: &str) -> Result<TenantSyncOutcome, SyncError> {
        let token = match self.tokens.get_valid_access_token(tenant_id).await? {
            TokenLookup::Valid(token) => token,
            TokenLookup::NotConnected(reason) => {
                return Ok(TenantSyncOutcome::NotConnected(reason))
            }
        };

        let cutoff = resolve_cutoff(token.connected_at, Utc::now());

        let fetched = match self.fetch(tenant_id, &token, cutoff).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_unauthorized() => {
                // Token died between the expiry check and the walk: refresh once
                // and restart the walk with the new token.
                warn!(tenant_id = %tenant_id, "Access token rejected during fetch; refreshing");
                let token = match self
                    .tokens
                    .refresh_after_rejection(tenant_id, &token.access_token)
                    .await?
                {
                    TokenLookup::Valid(token) => token,
                    TokenLookup::NotConnected(reason) => {
                        return Ok(TenantSyncOutcome::NotConnected(reason))
                    }
                };
                match self.fetch(tenant_id, &token, cutoff).await {
                    Ok(fetched) => fetched,
                    Err(e) if e.is_unauthorized() => {
                        warn!(tenant_id = %tenant_id, "Refreshed access token rejected: {e}");
                        return Ok(TenantSyncOutcome::NotConnected(
                            NotConnectedReason::AccessRejected,
                        ));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let persisted = self.engine.persist(tenant_id, fetched.claims).await?;

        info!(
            tenant_id = %tenant_id,
            pages = fetched.pages_processed,
            fetched = fetched.total_fetched,
            in_scope = fetched.total_filtered,
            created = persisted.created,
            updated = persisted.updated,
            pruned = persisted.pruned,
            "Tenant claims synced"
        );

        Ok(TenantSyncOutcome::Synced(TenantSyncStats {
            cutoff,
            pages_processed: fetched.pages_processed,
            total_fetched: fetched.total_fetched,
            total_filtered: fetched.total_filtered,
            created: persisted.created,
            updated: persisted.updated,
            unchanged: persisted.unchanged,
            skipped: persisted.skipped,
            pruned: persisted.pruned,
        }))
    }

    async fn fetch(
        &self,
        tenant_id: &str,
        token: &ValidToken,
        cutoff: DateTime<Utc>,
    ) -> Result<FetchOutcome, crate::marketplace::MarketplaceError> {
        self.fetcher
            .fetch_all_claims(
                tenant_id,
                &token.access_token,
                &token.marketplace_user_id,
                cutoff,
            )
            .await
    }

    async fn record(&self, tenant_id: &str, event_type: &str, metadata: serde_json::Value) {
        if let Err(e) = self
            .connections
            .log_event(tenant_id, event_type, metadata)
            .await
        {
            warn!(tenant_id = %tenant_id, "Failed to record {event_type} event: {e}");
        }
    }
}
