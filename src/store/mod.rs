//! Persistence seams for connections, mirrored claims and audit events.
//!
//! `PgStore` is the production backend. The sync pipeline only sees the
//! `ConnectionStore` / `ClaimStore` traits.

pub mod db;
#[cfg(test)]
pub mod memory;

pub use db::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::marketplace::{NormalizedClaim, RawClaim};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Token crypto error: {0}")]
    Crypto(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        StoreError::Database(e.to_string())
    }
}

// ── Connections ──────────────────────────────────────────────────────────────

/// A tenant's stored OAuth credential state. At most one per tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub tenant_id: String,
    pub marketplace_user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Always describes the currently stored `access_token`.
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    /// First successful authorization. `None` on rows migrated without it.
    pub connected_at: Option<DateTime<Utc>>,
}

impl Connection {
    /// Whether the access token is expired or expires within `margin`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin >= self.expires_at
    }
}

/// Connection written after a successful authorization-code exchange.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub tenant_id: String,
    pub marketplace_user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

/// Token material persisted after a refresh.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// `None` keeps the stored refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection(&self, tenant_id: &str) -> Result<Option<Connection>, StoreError>;

    async fn list_active_connections(&self) -> Result<Vec<Connection>, StoreError>;

    /// Insert or re-authorize. `connected_at` of an existing row is kept.
    async fn upsert_connection(&self, conn: &NewConnection) -> Result<Connection, StoreError>;

    async fn update_tokens(
        &self,
        tenant_id: &str,
        tokens: &RefreshedTokens,
    ) -> Result<(), StoreError>;

    /// Remove the connection row only. Returns false when there was none.
    async fn delete_connection(&self, tenant_id: &str) -> Result<bool, StoreError>;

    async fn log_event(
        &self,
        tenant_id: &str,
        event_type: &str,
        metadata: Value,
    ) -> Result<(), StoreError>;
}

// ── Claims ───────────────────────────────────────────────────────────────────

/// Local mirror of one marketplace claim, unique per (tenant, claim id).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirroredClaim {
    pub tenant_id: String,
    pub claim_id: String,
    pub status: Option<String>,
    pub stage: Option<String>,
    pub claim_type: Option<String>,
    pub resource_kind: Option<String>,
    pub resource_id: Option<String>,
    pub order_id: Option<String>,
    pub reason_id: Option<String>,
    pub date_created: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub date_closed: Option<DateTime<Utc>>,
    pub raw_payload: Value,
    pub synced_at: DateTime<Utc>,
}

impl MirroredClaim {
    pub fn new(tenant_id: &str, claim: NormalizedClaim, raw: RawClaim, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            resource_kind: claim.resource.kind().map(|k| k.as_str().to_string()),
            resource_id: claim.resource.id().map(str::to_string),
            order_id: claim.resource.order_id().map(str::to_string),
            claim_id: claim.claim_id,
            status: claim.status,
            stage: claim.stage,
            claim_type: claim.claim_type,
            reason_id: claim.reason_id,
            date_created: claim.date_created,
            last_updated: claim.last_updated,
            date_closed: claim.date_closed,
            raw_payload: raw,
            synced_at: now,
        }
    }

    /// Equality on everything the marketplace controls (ignores `synced_at`).
    pub fn same_content(&self, other: &MirroredClaim) -> bool {
        self.status == other.status
            && self.stage == other.stage
            && self.claim_type == other.claim_type
            && self.resource_kind == other.resource_kind
            && self.resource_id == other.resource_id
            && self.order_id == other.order_id
            && self.reason_id == other.reason_id
            && self.date_created == other.date_created
            && self.last_updated == other.last_updated
            && self.date_closed == other.date_closed
            && self.raw_payload == other.raw_payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Operator annotations owned by the ticketing app. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimComplement {
    pub tenant_id: String,
    pub claim_id: String,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimQuery {
    pub limit: i64,
    pub offset: i64,
    pub status: Option<String>,
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn upsert_claim(&self, claim: &MirroredClaim) -> Result<UpsertOutcome, StoreError>;

    /// Delete the tenant's claims created strictly before `older_than`.
    async fn prune_claims(
        &self,
        tenant_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn list_claims(
        &self,
        tenant_id: &str,
        query: &ClaimQuery,
    ) -> Result<Vec<MirroredClaim>, StoreError>;

    async fn get_claim(
        &self,
        tenant_id: &str,
        claim_id: &str,
    ) -> Result<Option<MirroredClaim>, StoreError>;

    async fn get_complement(
        &self,
        tenant_id: &str,
        claim_id: &str,
    ) -> Result<Option<ClaimComplement>, StoreError>;
}
