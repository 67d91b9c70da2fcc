//! The claims sync pipeline.

pub mod cutoff;
mod daemon;
pub mod engine;
pub mod fetcher;
pub mod orchestrator;
pub mod tokens;

pub use cutoff::resolve_cutoff;
pub use daemon::sync_daemon;
pub use engine::{ClaimsSyncEngine, PersistOutcome};
pub use fetcher::{ClaimsFetcher, FetchOutcome};
pub use orchestrator::{SyncOrchestrator, SyncReport, TenantSyncOutcome, TenantSyncStats};
pub use tokens::{NotConnectedReason, TokenLookup, TokenManager, ValidToken};
