//! In-memory store backing the pipeline tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{
    ClaimComplement, ClaimQuery, ClaimStore, Connection, ConnectionStore, MirroredClaim,
    NewConnection, RefreshedTokens, StoreError, UpsertOutcome,
};

#[derive(Default)]
pub struct MemoryStore {
    connections: Mutex<HashMap<String, Connection>>,
    claims: Mutex<BTreeMap<(String, String), MirroredClaim>>,
    complements: Mutex<BTreeMap<(String, String), ClaimComplement>>,
    events: Mutex<Vec<(String, String, Value)>>,
    failing_tenants: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub token_updates: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_connection(&self, conn: Connection) {
        self.connections
            .lock()
            .unwrap()
            .insert(conn.tenant_id.clone(), conn);
    }

    pub fn put_claim(&self, claim: MirroredClaim) {
        self.claims
            .lock()
            .unwrap()
            .insert((claim.tenant_id.clone(), claim.claim_id.clone()), claim);
    }

    pub fn put_complement(&self, complement: ClaimComplement) {
        self.complements.lock().unwrap().insert(
            (complement.tenant_id.clone(), complement.claim_id.clone()),
            complement,
        );
    }

    /// Make every claim upsert for `tenant_id` fail.
    pub fn fail_upserts_for(&self, tenant_id: &str) {
        self.failing_tenants
            .lock()
            .unwrap()
            .insert(tenant_id.to_string());
    }

    pub fn claims_for(&self, tenant_id: &str) -> Vec<MirroredClaim> {
        self.claims
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn complements(&self) -> Vec<ClaimComplement> {
        self.complements.lock().unwrap().values().cloned().collect()
    }

    pub fn connection(&self, tenant_id: &str) -> Option<Connection> {
        self.connections.lock().unwrap().get(tenant_id).cloned()
    }

    pub fn event_types(&self, tenant_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == tenant_id)
            .map(|(_, e, _)| e.clone())
            .collect()
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn get_connection(&self, tenant_id: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.connection(tenant_id))
    }

    async fn list_active_connections(&self) -> Result<Vec<Connection>, StoreError> {
        let mut conns: Vec<Connection> = self
            .connections
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        conns.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(conns)
    }

    async fn upsert_connection(&self, conn: &NewConnection) -> Result<Connection, StoreError> {
        let mut connections = self.connections.lock().unwrap();
        let previous = connections.get(&conn.tenant_id);
        let stored = Connection {
            tenant_id: conn.tenant_id.clone(),
            marketplace_user_id: conn.marketplace_user_id.clone(),
            access_token: conn.access_token.clone(),
            refresh_token: conn
                .refresh_token
                .clone()
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            expires_at: conn.expires_at,
            is_active: true,
            connected_at: previous
                .and_then(|p| p.connected_at)
                .or(Some(conn.connected_at)),
        };
        connections.insert(conn.tenant_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_tokens(
        &self,
        tenant_id: &str,
        tokens: &RefreshedTokens,
    ) -> Result<(), StoreError> {
        self.token_updates.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = self.connections.lock().unwrap().get_mut(tenant_id) {
            conn.access_token = tokens.access_token.clone();
            if let Some(rt) = &tokens.refresh_token {
                conn.refresh_token = Some(rt.clone());
            }
            conn.expires_at = tokens.expires_at;
        }
        Ok(())
    }

    async fn delete_connection(&self, tenant_id: &str) -> Result<bool, StoreError> {
        Ok(self.connections.lock().unwrap().remove(tenant_id).is_some())
    }

    async fn log_event(
        &self,
        tenant_id: &str,
        event_type: &str,
        metadata: Value,
    ) -> Result<(), StoreError> {
        self.events.lock().unwrap().push((
            tenant_id.to_string(),
            event_type.to_string(),
            metadata,
        ));
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn upsert_claim(&self, claim: &MirroredClaim) -> Result<UpsertOutcome, StoreError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        // Let sibling upserts of the same chunk start before this one finishes.
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_tenants.lock().unwrap().contains(&claim.tenant_id) {
            return Err(StoreError::Database("connection reset by peer".into()));
        }

        let key = (claim.tenant_id.clone(), claim.claim_id.clone());
        let mut claims = self.claims.lock().unwrap();
        let outcome = match claims.get(&key) {
            None => UpsertOutcome::Created,
            Some(existing) if existing.same_content(claim) => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
        };
        claims.insert(key, claim.clone());
        Ok(outcome)
    }

    async fn prune_claims(
        &self,
        tenant_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut claims = self.claims.lock().unwrap();
        let before = claims.len();
        claims.retain(|(tenant, _), c| {
            tenant != tenant_id || c.date_created.map_or(true, |d| d >= older_than)
        });
        Ok((before - claims.len()) as u64)
    }

    async fn list_claims(
        &self,
        tenant_id: &str,
        query: &ClaimQuery,
    ) -> Result<Vec<MirroredClaim>, StoreError> {
        let mut rows: Vec<MirroredClaim> = self
            .claims_for(tenant_id)
            .into_iter()
            .filter(|c| query.status.is_none() || c.status == query.status)
            .collect();
        rows.sort_by(|a, b| b.date_created.cmp(&a.date_created));
        Ok(rows
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn get_claim(
        &self,
        tenant_id: &str,
        claim_id: &str,
    ) -> Result<Option<MirroredClaim>, StoreError> {
        Ok(self
            .claims
            .lock()
            .unwrap()
            .get(&(tenant_id.to_string(), claim_id.to_string()))
            .cloned())
    }

    async fn get_complement(
        &self,
        tenant_id: &str,
        claim_id: &str,
    ) -> Result<Option<ClaimComplement>, StoreError> {
        Ok(self
            .complements
            .lock()
            .unwrap()
            .get(&(tenant_id.to_string(), claim_id.to_string()))
            .cloned())
    }
}
