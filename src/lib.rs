pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod marketplace;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::SyncError;

use std::sync::Arc;

use crypto::CryptoEngine;
use marketplace::{ClaimsApi, OAuthClient};
use store::{ClaimStore, ConnectionStore};
use sync::{SyncOrchestrator, TokenManager};

/// Shared application state passed to all API handlers.
pub struct AppState {
    pub config: Config,
    pub connections: Arc<dyn ConnectionStore>,
    pub claims: Arc<dyn ClaimStore>,
    pub crypto: Arc<CryptoEngine>,
    pub oauth: Arc<dyn OAuthClient>,
    pub claims_api: Arc<dyn ClaimsApi>,
    pub tokens: Arc<TokenManager>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    /// Wire the sync pipeline on top of the given stores and marketplace clients.
    pub fn new(
        config: Config,
        connections: Arc<dyn ConnectionStore>,
        claims: Arc<dyn ClaimStore>,
        crypto: Arc<CryptoEngine>,
        oauth: Arc<dyn OAuthClient>,
        claims_api: Arc<dyn ClaimsApi>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(
            connections.clone(),
            oauth.clone(),
            config.sync.refresh_margin,
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            connections.clone(),
            claims.clone(),
            claims_api.clone(),
            tokens.clone(),
            config.sync.clone(),
        ));

        Self {
            config,
            connections,
            claims,
            crypto,
            oauth,
            claims_api,
            tokens,
            orchestrator,
        }
    }
}

pub type SharedState = Arc<AppState>;
