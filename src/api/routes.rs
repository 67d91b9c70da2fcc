//! API route handlers.
//!
//! All handlers receive `SharedState` via Axum state extraction. The cron
//! trigger authenticates with the scheduler's bearer secret; everything under
//! /tenants is called by the ticketing app with `x-internal-secret`.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::crypto::OAuthState;
use crate::error::SyncError;
use crate::marketplace::MarketplaceError;
use crate::store::{ClaimQuery, NewConnection};
use crate::sync::{SyncReport, TenantSyncOutcome, TokenLookup};
use crate::SharedState;

/// Signed OAuth states older than this are rejected at the callback.
const STATE_MAX_AGE_SECS: i64 = 600;
const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 200;

// =============================================================================
// V1 Router
// =============================================================================

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        // ── Health ───────────────────────────────────────────────────────
        .route("/status", get(status))
        // ── Scheduler ────────────────────────────────────────────────────
        .route("/cron/sync-claims", get(cron_sync).post(cron_sync))
        // ── OAuth ────────────────────────────────────────────────────────
        .route("/oauth/start", get(oauth_start))
        .route("/oauth/callback", get(oauth_callback))
        // ── Tenants ──────────────────────────────────────────────────────
        .route(
            "/tenants/{tenant_id}/connection",
            get(connection_status).delete(connection_delete),
        )
        .route("/tenants/{tenant_id}/claims", get(claims_list))
        .route("/tenants/{tenant_id}/claims/{claim_id}", get(claim_detail))
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn status() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "claims-sync",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// Caller authentication
// =============================================================================

fn require_internal(state: &SharedState, headers: &HeaderMap) -> Result<(), SyncError> {
    let internal = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok())
        .ok_or(SyncError::Unauthorized)?;

    if internal != state.config.internal_secret {
        return Err(SyncError::Unauthorized);
    }
    Ok(())
}

fn require_cron(state: &SharedState, headers: &HeaderMap) -> Result<(), SyncError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(SyncError::Unauthorized)?;

    if token != state.config.cron_secret {
        return Err(SyncError::Unauthorized);
    }
    Ok(())
}

// =============================================================================
// Scheduler trigger
// =============================================================================

/// GET|POST /v1/cron/sync-claims: sync every connected tenant.
async fn cron_sync(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<SyncReport>, SyncError> {
    require_cron(&state, &headers)?;
    let report = state.orchestrator.run_sync().await?;
    Ok(Json(report))
}

// =============================================================================
// OAuth
// =============================================================================

#[derive(Deserialize)]
struct OAuthStartQuery {
    tenant_id: String,
}

/// GET /v1/oauth/start: redirect the tenant to the marketplace consent page.
async fn oauth_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<OAuthStartQuery>,
) -> Result<Response, SyncError> {
    require_internal(&state, &headers)?;
    if q.tenant_id.trim().is_empty() {
        return Err(SyncError::BadRequest("tenant_id is required".into()));
    }

    let signed_state = state.crypto.sign_state(&OAuthState {
        tenant_id: q.tenant_id,
        issued_at: Utc::now().timestamp(),
    })?;

    let auth_url = state
        .oauth
        .authorization_url(&signed_state, &state.config.callback_url());
    Ok(Redirect::temporary(&auth_url).into_response())
}

#[derive(Deserialize)]
struct OAuthCallbackQuery {
    code: Option<String>,
    state: String,
    /// Set by the marketplace when the seller denies access.
    error: Option<String>,
}

/// GET /v1/oauth/callback: store the connection and go back to the dashboard.
async fn oauth_callback(
    State(state): State<SharedState>,
    Query(q): Query<OAuthCallbackQuery>,
) -> Result<Response, SyncError> {
    let oauth_state = state.crypto.verify_state(
        &q.state,
        Utc::now(),
        chrono::Duration::seconds(STATE_MAX_AGE_SECS),
    )?;
    let tenant_id = oauth_state.tenant_id;

    if let Some(error) = q.error {
        warn!(tenant_id = %tenant_id, "Marketplace authorization denied: {error}");
        return Ok(dashboard_redirect(&state, "error", Some(&error)));
    }
    let code = q
        .code
        .ok_or_else(|| SyncError::BadRequest("missing code parameter".into()))?;

    let tokens = state
        .oauth
        .exchange_code(&code, &state.config.callback_url())
        .await?;
    let now = Utc::now();
    let expires_at = tokens.expires_at(now)?;
    let marketplace_user_id = tokens.user_id.ok_or_else(|| {
        MarketplaceError::Decode("token response carried no user_id".into())
    })?;

    let conn = state
        .connections
        .upsert_connection(&NewConnection {
            tenant_id: tenant_id.clone(),
            marketplace_user_id: marketplace_user_id.clone(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
            connected_at: now,
        })
        .await?;

    // Audit log
    let _ = state
        .connections
        .log_event(
            &tenant_id,
            "connected",
            json!({
                "marketplace_user_id": marketplace_user_id,
                "connected_at": conn.connected_at,
            }),
        )
        .await;
    info!(tenant_id = %tenant_id, marketplace_user_id = %marketplace_user_id, "Marketplace account connected");

    Ok(dashboard_redirect(&state, "connected", None))
}

fn dashboard_redirect(state: &SharedState, status: &str, reason: Option<&str>) -> Response {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("status", status);
    if let Some(reason) = reason {
        query.append_pair("reason", reason);
    }
    let url = format!(
        "{}/integrations/marketplace?{}",
        state.config.dashboard_url,
        query.finish()
    );
    Redirect::temporary(&url).into_response()
}

// =============================================================================
// Connection management
// =============================================================================

/// GET /v1/tenants/{tenant_id}/connection: connection status, never tokens.
async fn connection_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, SyncError> {
    require_internal(&state, &headers)?;

    let data = match state.connections.get_connection(&tenant_id).await? {
        Some(conn) => json!({
            "connected": conn.is_active,
            "marketplace_user_id": conn.marketplace_user_id,
            "expires_at": conn.expires_at,
            "connected_at": conn.connected_at,
        }),
        None => json!({ "connected": false }),
    };
    Ok(Json(json!({ "data": data })))
}

/// DELETE /v1/tenants/{tenant_id}/connection: disconnect. Mirrored claims and
/// complements are kept.
async fn connection_delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, SyncError> {
    require_internal(&state, &headers)?;

    if !state.connections.delete_connection(&tenant_id).await? {
        return Err(SyncError::NotFound("Marketplace connection".into()));
    }

    let _ = state
        .connections
        .log_event(&tenant_id, "disconnected", json!({}))
        .await;
    info!(tenant_id = %tenant_id, "Marketplace account disconnected");

    Ok(Json(json!({ "data": { "success": true } })))
}

// =============================================================================
// Claims
// =============================================================================

#[derive(Deserialize)]
struct ClaimsListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    status: Option<String>,
    #[serde(default)]
    refresh: bool,
}

/// GET /v1/tenants/{tenant_id}/claims: mirrored claims, newest first.
/// `refresh=true` syncs the tenant first.
async fn claims_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(q): Query<ClaimsListQuery>,
) -> Result<Json<Value>, SyncError> {
    require_internal(&state, &headers)?;

    let sync = if q.refresh {
        match state.orchestrator.sync_tenant(&tenant_id).await? {
            TenantSyncOutcome::Synced(stats) => Some(stats),
            TenantSyncOutcome::NotConnected(_) => return Err(SyncError::NotConnected(tenant_id)),
        }
    } else {
        None
    };

    let query = ClaimQuery {
        limit: q.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        offset: q.offset.unwrap_or(0).max(0),
        status: q.status.filter(|s| !s.is_empty()),
    };
    let claims = state.claims.list_claims(&tenant_id, &query).await?;

    Ok(Json(json!({
        "data": claims,
        "paging": { "limit": query.limit, "offset": query.offset },
        "sync": sync,
    })))
}

/// GET /v1/tenants/{tenant_id}/claims/{claim_id}: the mirrored claim, its
/// complement, and live sub-resources. A failing sub-resource becomes an
/// empty list or null instead of failing the view.
async fn claim_detail(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((tenant_id, claim_id)): Path<(String, String)>,
) -> Result<Json<Value>, SyncError> {
    require_internal(&state, &headers)?;

    let claim = state
        .claims
        .get_claim(&tenant_id, &claim_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("Claim {claim_id}")))?;
    let complement = state.claims.get_complement(&tenant_id, &claim_id).await?;

    let token = match state.tokens.get_valid_access_token(&tenant_id).await {
        Ok(TokenLookup::Valid(token)) => Some(token.access_token),
        Ok(TokenLookup::NotConnected(reason)) => {
            info!(tenant_id = %tenant_id, ?reason, "Serving claim without live data: not connected");
            None
        }
        Err(e) => {
            warn!(tenant_id = %tenant_id, "Serving claim without live data: {e}");
            None
        }
    };

    let live = match token {
        Some(token) => {
            let api = &state.claims_api;
            let (detail, messages, actions, statuses, reputation) = tokio::join!(
                api.claim_detail(&token, &claim_id),
                api.claim_messages(&token, &claim_id),
                api.claim_actions_history(&token, &claim_id),
                api.claim_status_history(&token, &claim_id),
                api.claim_affects_reputation(&token, &claim_id),
            );
            json!({
                "connected": true,
                "detail": or_null(&claim_id, "detail", detail),
                "messages": or_empty(&claim_id, "messages", messages),
                "actions_history": or_empty(&claim_id, "actions_history", actions),
                "status_history": or_empty(&claim_id, "status_history", statuses),
                "affects_reputation": or_null(&claim_id, "affects_reputation", reputation),
            })
        }
        None => json!({
            "connected": false,
            "detail": null,
            "messages": [],
            "actions_history": [],
            "status_history": [],
            "affects_reputation": null,
        }),
    };

    Ok(Json(json!({
        "data": {
            "claim": claim,
            "complement": complement,
            "live": live,
        }
    })))
}

fn or_empty(claim_id: &str, what: &str, result: Result<Vec<Value>, MarketplaceError>) -> Vec<Value> {
    result.unwrap_or_else(|e| {
        warn!(claim_id = %claim_id, "Claim {what} unavailable: {e}");
        Vec::new()
    })
}

fn or_null(claim_id: &str, what: &str, result: Result<Value, MarketplaceError>) -> Value {
    result.unwrap_or_else(|e| {
        warn!(claim_id = %claim_id, "Claim {what} unavailable: {e}");
        Value::Null
    })
}
