//! Optional in-process scheduler for deployments without an external cron.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::orchestrator::SyncOrchestrator;
use crate::error::SyncError;

/// Run a full sync every `interval`, forever.
pub async fn sync_daemon(orchestrator: Arc<SyncOrchestrator>, interval: Duration) {
    info!("Claims sync daemon started (interval: {}m)", interval.as_secs() / 60);

    loop {
        tokio::time::sleep(interval).await;
        match orchestrator.run_sync().await {
            Ok(_) => {}
            // The external trigger got there first.
            Err(SyncError::SyncInProgress) => warn!("Skipping scheduled sync: run in progress"),
            Err(e) => error!("Scheduled sync error: {e}"),
        }
    }
}
