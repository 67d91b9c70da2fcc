use anyhow::{Context, Result};
use std::time::Duration;

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,
    pub base_url: String,
    /// Support-app frontend URL for post-OAuth redirects
    pub dashboard_url: String,

    // ── Database (PostgreSQL, shared with the ticketing app) ───────────
    pub database_url: String,

    // ── Crypto ──────────────────────────────────────────────────────────
    /// 32-byte base64-encoded master key for AES-256-GCM token encryption.
    pub master_key: String,
    /// base64-encoded HMAC key for OAuth state signing.
    pub hmac_secret: String,

    // ── Service-to-service auth ─────────────────────────────────────────
    /// Bearer secret the external scheduler presents on the cron trigger.
    pub cron_secret: String,
    /// Shared secret for interactive calls from the ticketing app.
    pub internal_secret: String,

    // ── Marketplace ─────────────────────────────────────────────────────
    pub marketplace_client_id: String,
    pub marketplace_client_secret: String,
    pub marketplace_api_url: String,
    pub marketplace_auth_url: String,

    // ── HTTP client ─────────────────────────────────────────────────────
    pub http_timeout: Duration,
    pub http_max_retries: u32,

    // ── Sync tuning ─────────────────────────────────────────────────────
    pub sync: SyncSettings,
    /// Internal scheduler interval. `None` leaves scheduling to the cron trigger.
    pub sync_interval: Option<Duration>,
}

/// Knobs for the sync pipeline. Defaults match production.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: u32,
    pub chunk_size: usize,
    /// Tenants processed concurrently within one run.
    pub concurrency: usize,
    pub tenant_timeout: Duration,
    /// Tokens expiring within this margin are treated as expired.
    pub refresh_margin: chrono::Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            chunk_size: 200,
            concurrency: 4,
            tenant_timeout: Duration::from_secs(600),
            refresh_margin: chrono::Duration::seconds(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = SyncSettings::default();

        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8430".into())
                .parse()
                .context("Invalid PORT")?,
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8430".into()),
            dashboard_url: std::env::var("DASHBOARD_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),

            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL is required (PostgreSQL connection string)")?,
            master_key: std::env::var("MASTER_KEY")
                .context("MASTER_KEY is required (32 bytes, base64)")?,
            hmac_secret: std::env::var("HMAC_SECRET")
                .context("HMAC_SECRET is required (base64)")?,

            cron_secret: std::env::var("CRON_SECRET")
                .context("CRON_SECRET is required for the scheduler trigger")?,
            internal_secret: std::env::var("INTERNAL_SECRET")
                .context("INTERNAL_SECRET is required for service-to-service auth")?,

            marketplace_client_id: std::env::var("MARKETPLACE_CLIENT_ID")
                .context("MARKETPLACE_CLIENT_ID is required")?,
            marketplace_client_secret: std::env::var("MARKETPLACE_CLIENT_SECRET")
                .context("MARKETPLACE_CLIENT_SECRET is required")?,
            marketplace_api_url: std::env::var("MARKETPLACE_API_URL")
                .unwrap_or_else(|_| "https://api.mercadolibre.com".into()),
            marketplace_auth_url: std::env::var("MARKETPLACE_AUTH_URL")
                .unwrap_or_else(|_| "https://auth.mercadolivre.com.br".into()),

            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30)?),
            http_max_retries: env_parse("HTTP_MAX_RETRIES", 3)?,

            sync: SyncSettings {
                page_size: env_parse("SYNC_PAGE_SIZE", defaults.page_size)?,
                chunk_size: env_parse("SYNC_CHUNK_SIZE", defaults.chunk_size)?,
                concurrency: env_parse("SYNC_CONCURRENCY", defaults.concurrency)?,
                tenant_timeout: Duration::from_secs(env_parse(
                    "SYNC_TENANT_TIMEOUT_SECS",
                    defaults.tenant_timeout.as_secs(),
                )?),
                refresh_margin: chrono::Duration::seconds(env_parse(
                    "TOKEN_REFRESH_MARGIN_SECS",
                    defaults.refresh_margin.num_seconds(),
                )?),
            },
            sync_interval: std::env::var("SYNC_INTERVAL_MINUTES")
                .ok()
                .map(|v| v.parse::<u64>().context("Invalid SYNC_INTERVAL_MINUTES"))
                .transpose()?
                .filter(|m| *m > 0)
                .map(|m| Duration::from_secs(m * 60)),
        })
    }

    /// OAuth redirect URI registered with the marketplace application.
    pub fn callback_url(&self) -> String {
        format!("{}/v1/oauth/callback", self.base_url)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {key}")),
        Err(_) => Ok(default),
    }
}
