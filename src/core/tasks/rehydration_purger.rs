// src/core/tasks/rehydration_purger.rs

//! Periodic purge of expired rehydration-cache entries.

use crate::core::registry::AppRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Drops cached registrations whose `last_seen_at` exceeds the cache
/// max-age, together with their durable rows.
pub struct RehydrationPurgerTask {
    registry: Arc<AppRegistry>,
    interval: Duration,
}

impl RehydrationPurgerTask {
    pub fn new(registry: Arc<AppRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Runs the main loop for the rehydration purger.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Rehydration purger started (interval {:?}).", self.interval);
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = self.registry.purge_rehydration_cache();
                    if purged > 0 {
                        info!("Purged {} expired registrations.", purged);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Rehydration purger shutting down.");
                    return;
                }
            }
        }
    }
}
