use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use claims_sync::crypto::CryptoEngine;
use claims_sync::marketplace::MarketplaceClient;
use claims_sync::store::PgStore;
use claims_sync::{api, sync, AppState, Config, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claims_sync=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("claims-sync v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.host, config.port);

    let crypto = Arc::new(CryptoEngine::new(&config.master_key, &config.hmac_secret)?);
    let store = Arc::new(PgStore::new(&config.database_url, crypto.clone()).await?);
    store.migrate().await?;
    info!("Database connected and migrated");

    let marketplace = Arc::new(MarketplaceClient::new(
        config.marketplace_client_id.clone(),
        config.marketplace_client_secret.clone(),
        config.marketplace_api_url.clone(),
        config.marketplace_auth_url.clone(),
        config.http_timeout,
        config.http_max_retries,
    )?);

    let state: SharedState = Arc::new(AppState::new(
        config.clone(),
        store.clone(),
        store,
        crypto,
        marketplace.clone(),
        marketplace,
    ));

    match config.sync_interval {
        Some(interval) => {
            let orchestrator = state.orchestrator.clone();
            tokio::spawn(async move {
                sync::sync_daemon(orchestrator, interval).await;
            });
        }
        None => info!("No SYNC_INTERVAL_MINUTES set; runs are driven by the cron trigger"),
    }

    let app = api::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready");
    axum::serve(listener, app).await?;

    Ok(())
}
