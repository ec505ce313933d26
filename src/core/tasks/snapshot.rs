// src/core/tasks/snapshot.rs

//! Periodic snapshotting and backup rotation for the durable store.

use crate::core::persistence::Persistence;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Rewrites the snapshot on a fixed cadence and takes a timestamped backup
/// every `backups_every` snapshots (0 disables backups).
pub struct SnapshotTask {
    persistence: Arc<Persistence>,
    interval: Duration,
    backups_every: u32,
}

impl SnapshotTask {
    pub fn new(persistence: Arc<Persistence>, interval: Duration, backups_every: u32) -> Self {
        Self {
            persistence,
            interval,
            backups_every,
        }
    }

    /// Runs the main loop for the snapshot saver. Performs a final snapshot
    /// on shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Snapshot saver started (interval {:?}).", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; skip it so we do not
        // snapshot right after startup.
        interval.tick().await;
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks = ticks.wrapping_add(1);
                    if let Err(e) = self.persistence.snapshot() {
                        error!("Periodic snapshot failed: {}", e);
                        continue;
                    }
                    if self.backups_every > 0 && ticks % self.backups_every == 0 {
                        match self.persistence.backup() {
                            Ok(Some(path)) => info!("Backup written to {}.", path.display()),
                            Ok(None) => {}
                            Err(e) => error!("Backup failed: {}", e),
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Snapshot saver received shutdown signal; taking final snapshot.");
                    if let Err(e) = self.persistence.snapshot() {
                        error!("Final snapshot on shutdown failed: {}", e);
                    }
                    return;
                }
            }
        }
    }
}
