//! PostgreSQL-backed store for marketplace connections, mirrored claims and
//! integration audit events.
//!
//! Tables:
//! - `marketplace_connections`: encrypted OAuth tokens, one row per tenant
//! - `mirrored_claims`: claim mirror, unique per (tenant_id, claim_id)
//! - `claim_complements`: operator annotations owned by the ticketing app
//! - `integration_events`: audit log for connect/refresh/sync events

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use super::{
    ClaimComplement, ClaimQuery, ClaimStore, Connection, ConnectionStore, MirroredClaim,
    NewConnection, RefreshedTokens, StoreError, UpsertOutcome,
};
use crate::crypto::CryptoEngine;

pub struct PgStore {
    pool: PgPool,
    crypto: Arc<CryptoEngine>,
}

impl PgStore {
    pub async fn new(db_url: &str, crypto: Arc<CryptoEngine>) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(db_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect to PostgreSQL: {e}")))?;

        Ok(Self { pool, crypto })
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS marketplace_connections (
                id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                tenant_id           TEXT NOT NULL UNIQUE,
                marketplace_user_id TEXT NOT NULL,
                access_token        TEXT NOT NULL,
                refresh_token       TEXT,
                expires_at          TIMESTAMPTZ NOT NULL,
                is_active           BOOLEAN NOT NULL DEFAULT true,
                connected_at        TIMESTAMPTZ,
                created_at          TIMESTAMPTZ DEFAULT NOW(),
                updated_at          TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mirrored_claims (
                id             UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                tenant_id      TEXT NOT NULL,
                claim_id       TEXT NOT NULL,
                status         TEXT,
                stage          TEXT,
                claim_type     TEXT,
                resource_kind  TEXT,
                resource_id    TEXT,
                order_id       TEXT,
                reason_id      TEXT,
                date_created   TIMESTAMPTZ,
                last_updated   TIMESTAMPTZ,
                date_closed    TIMESTAMPTZ,
                raw_payload    JSONB NOT NULL DEFAULT '{}',
                synced_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE(tenant_id, claim_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Owned by the ticketing app; created here only when bootstrapping a fresh database.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS claim_complements (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                tenant_id   TEXT NOT NULL,
                claim_id    TEXT NOT NULL,
                data        JSONB NOT NULL DEFAULT '{}',
                created_at  TIMESTAMPTZ DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE(tenant_id, claim_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integration_events (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                tenant_id   TEXT NOT NULL,
                event_type  TEXT NOT NULL,
                metadata    JSONB DEFAULT '{}',
                created_at  TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mirrored_claims_created ON mirrored_claims(tenant_id, date_created)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_marketplace_connections_active ON marketplace_connections(is_active)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_integration_events_tenant ON integration_events(tenant_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn encrypt(&self, token: &str) -> Result<String, StoreError> {
        self.crypto
            .encrypt(token)
            .map_err(|e| StoreError::Crypto(e.to_string()))
    }

    fn decrypt(&self, token: &str) -> Result<String, StoreError> {
        self.crypto
            .decrypt(token)
            .map_err(|e| StoreError::Crypto(e.to_string()))
    }

    fn connection_from_row(&self, row: &PgRow) -> Result<Connection, StoreError> {
        let enc_access: String = row.try_get("access_token")?;
        let enc_refresh: Option<String> = row.try_get("refresh_token")?;

        let refresh_token = match enc_refresh {
            Some(ref rt) if !rt.is_empty() => Some(self.decrypt(rt)?),
            _ => None,
        };

        Ok(Connection {
            tenant_id: row.try_get("tenant_id")?,
            marketplace_user_id: row.try_get("marketplace_user_id")?,
            access_token: self.decrypt(&enc_access)?,
            refresh_token,
            expires_at: row.try_get("expires_at")?,
            is_active: row.try_get("is_active")?,
            connected_at: row.try_get("connected_at")?,
        })
    }
}

const CONNECTION_COLUMNS: &str = "tenant_id, marketplace_user_id, access_token, refresh_token, \
                                  expires_at, is_active, connected_at";

const CLAIM_COLUMNS: &str = "tenant_id, claim_id, status, stage, claim_type, resource_kind, \
                             resource_id, order_id, reason_id, date_created, last_updated, \
                             date_closed, raw_payload, synced_at";

fn claim_from_row(row: &PgRow) -> Result<MirroredClaim, sqlx::Error> {
    Ok(MirroredClaim {
        tenant_id: row.try_get("tenant_id")?,
        claim_id: row.try_get("claim_id")?,
        status: row.try_get("status")?,
        stage: row.try_get("stage")?,
        claim_type: row.try_get("claim_type")?,
        resource_kind: row.try_get("resource_kind")?,
        resource_id: row.try_get("resource_id")?,
        order_id: row.try_get("order_id")?,
        reason_id: row.try_get("reason_id")?,
        date_created: row.try_get("date_created")?,
        last_updated: row.try_get("last_updated")?,
        date_closed: row.try_get("date_closed")?,
        raw_payload: row.try_get("raw_payload")?,
        synced_at: row.try_get("synced_at")?,
    })
}

#[async_trait]
impl ConnectionStore for PgStore {
    async fn get_connection(&self, tenant_id: &str) -> Result<Option<Connection>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM marketplace_connections WHERE tenant_id = $1"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.connection_from_row(&r)).transpose()
    }

    async fn list_active_connections(&self) -> Result<Vec<Connection>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM marketplace_connections \
             WHERE is_active = true ORDER BY tenant_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut conns = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.connection_from_row(row) {
                Ok(conn) => conns.push(conn),
                // One undecryptable row must not hide every other tenant from the run.
                Err(e) => {
                    let tenant_id: String = row.try_get("tenant_id").unwrap_or_default();
                    tracing::error!(tenant_id = %tenant_id, "Skipping unreadable connection: {e}");
                }
            }
        }
        Ok(conns)
    }

    async fn upsert_connection(&self, conn: &NewConnection) -> Result<Connection, StoreError> {
        let enc_access = self.encrypt(&conn.access_token)?;
        let enc_refresh = conn
            .refresh_token
            .as_deref()
            .map(|rt| self.encrypt(rt))
            .transpose()?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO marketplace_connections
                (tenant_id, marketplace_user_id, access_token, refresh_token,
                 expires_at, is_active, connected_at)
            VALUES ($1, $2, $3, $4, $5, true, $6)
            ON CONFLICT (tenant_id)
            DO UPDATE SET
                marketplace_user_id = EXCLUDED.marketplace_user_id,
                access_token = EXCLUDED.access_token,
                refresh_token = COALESCE(EXCLUDED.refresh_token, marketplace_connections.refresh_token),
                expires_at = EXCLUDED.expires_at,
                is_active = true,
                connected_at = COALESCE(marketplace_connections.connected_at, EXCLUDED.connected_at),
                updated_at = NOW()
            RETURNING {CONNECTION_COLUMNS}
            "#
        ))
        .bind(&conn.tenant_id)
        .bind(&conn.marketplace_user_id)
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(conn.expires_at)
        .bind(conn.connected_at)
        .fetch_one(&self.pool)
        .await?;

        self.connection_from_row(&row)
    }

    async fn update_tokens(
        &self,
        tenant_id: &str,
        tokens: &RefreshedTokens,
    ) -> Result<(), StoreError> {
        let enc_access = self.encrypt(&tokens.access_token)?;
        let enc_refresh = tokens
            .refresh_token
            .as_deref()
            .map(|rt| self.encrypt(rt))
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE marketplace_connections
            SET access_token = $1,
                refresh_token = COALESCE($2, refresh_token),
                expires_at = $3,
                updated_at = NOW()
            WHERE tenant_id = $4
            "#,
        )
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(tokens.expires_at)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_connection(&self, tenant_id: &str) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM marketplace_connections WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected > 0)
    }

    async fn log_event(
        &self,
        tenant_id: &str,
        event_type: &str,
        metadata: Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO integration_events (tenant_id, event_type, metadata) VALUES ($1, $2, $3)",
        )
        .bind(tenant_id)
        .bind(event_type)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ClaimStore for PgStore {
    async fn upsert_claim(&self, claim: &MirroredClaim) -> Result<UpsertOutcome, StoreError> {
        // The WHERE clause turns a no-op update into "no row returned", so
        // re-syncing an unchanged claim leaves synced_at alone.
        let row = sqlx::query(
            r#"
            INSERT INTO mirrored_claims
                (tenant_id, claim_id, status, stage, claim_type, resource_kind, resource_id,
                 order_id, reason_id, date_created, last_updated, date_closed, raw_payload,
                 synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (tenant_id, claim_id)
            DO UPDATE SET
                status = EXCLUDED.status,
                stage = EXCLUDED.stage,
                claim_type = EXCLUDED.claim_type,
                resource_kind = EXCLUDED.resource_kind,
                resource_id = EXCLUDED.resource_id,
                order_id = EXCLUDED.order_id,
                reason_id = EXCLUDED.reason_id,
                date_created = EXCLUDED.date_created,
                last_updated = EXCLUDED.last_updated,
                date_closed = EXCLUDED.date_closed,
                raw_payload = EXCLUDED.raw_payload,
                synced_at = EXCLUDED.synced_at
            WHERE (mirrored_claims.status, mirrored_claims.stage, mirrored_claims.claim_type,
                   mirrored_claims.resource_kind, mirrored_claims.resource_id,
                   mirrored_claims.order_id, mirrored_claims.reason_id,
                   mirrored_claims.date_created, mirrored_claims.last_updated,
                   mirrored_claims.date_closed, mirrored_claims.raw_payload)
                IS DISTINCT FROM
                  (EXCLUDED.status, EXCLUDED.stage, EXCLUDED.claim_type,
                   EXCLUDED.resource_kind, EXCLUDED.resource_id,
                   EXCLUDED.order_id, EXCLUDED.reason_id,
                   EXCLUDED.date_created, EXCLUDED.last_updated,
                   EXCLUDED.date_closed, EXCLUDED.raw_payload)
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&claim.tenant_id)
        .bind(&claim.claim_id)
        .bind(&claim.status)
        .bind(&claim.stage)
        .bind(&claim.claim_type)
        .bind(&claim.resource_kind)
        .bind(&claim.resource_id)
        .bind(&claim.order_id)
        .bind(&claim.reason_id)
        .bind(claim.date_created)
        .bind(claim.last_updated)
        .bind(claim.date_closed)
        .bind(&claim.raw_payload)
        .bind(claim.synced_at)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = match row {
            None => UpsertOutcome::Unchanged,
            Some(r) => {
                if r.try_get::<bool, _>("inserted")? {
                    UpsertOutcome::Created
                } else {
                    UpsertOutcome::Updated
                }
            }
        };
        Ok(outcome)
    }

    async fn prune_claims(
        &self,
        tenant_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let affected =
            sqlx::query("DELETE FROM mirrored_claims WHERE tenant_id = $1 AND date_created < $2")
                .bind(tenant_id)
                .bind(older_than)
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(affected)
    }

    async fn list_claims(
        &self,
        tenant_id: &str,
        query: &ClaimQuery,
    ) -> Result<Vec<MirroredClaim>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CLAIM_COLUMNS}
            FROM mirrored_claims
            WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY date_created DESC NULLS LAST, claim_id
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(tenant_id)
        .bind(&query.status)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(claim_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_claim(
        &self,
        tenant_id: &str,
        claim_id: &str,
    ) -> Result<Option<MirroredClaim>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CLAIM_COLUMNS} FROM mirrored_claims WHERE tenant_id = $1 AND claim_id = $2"
        ))
        .bind(tenant_id)
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(claim_from_row).transpose()?)
    }

    async fn get_complement(
        &self,
        tenant_id: &str,
        claim_id: &str,
    ) -> Result<Option<ClaimComplement>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, claim_id, data, updated_at
            FROM claim_complements
            WHERE tenant_id = $1 AND claim_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        Ok(Some(ClaimComplement {
            tenant_id: row.try_get("tenant_id")?,
            claim_id: row.try_get("claim_id")?,
            data: row.try_get("data")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}
