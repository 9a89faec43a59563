use crate::errors::AuthError;
use crate::storage::Storage;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{error, info, instrument};

/// Periodic storage hygiene. Expiry is always checked on access, so the sweep
/// only reclaims space; it removes nothing that is still valid and can run
/// alongside live traffic.
pub struct CleanupService {
    storage: Arc<dyn Storage>,
}

impl CleanupService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Removes expired credentials, counters, markers and sessions.
    #[instrument(skip(self))]
    pub async fn run_cleanup(&self) -> Result<usize, AuthError> {
        let removed = self.storage.purge_expired().await?;
        info!(removed, "Cleanup job completed");
        Ok(removed)
    }

    /// Starts a background scheduler that runs the cleanup every `interval`.
    /// Runs until the task is dropped.
    pub async fn start_scheduler(self: Arc<Self>, interval: Duration) {
        let mut timer = time::interval(interval);

        info!("Cleanup scheduler started with interval: {:?}", interval);

        loop {
            timer.tick().await;

            // Spawned so a slow sweep does not delay the next tick
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.run_cleanup().await {
                    error!("Cleanup job failed: {:?}", e);
                }
            });
        }
    }
}
