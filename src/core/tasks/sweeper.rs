// src/core/tasks/sweeper.rs

//! The straggler sweeper for in-flight trigger records.
//!
//! Every record schedules its own expiry timer; the sweeper is the backstop
//! that walks the table and reaps anything whose timer failed to fire.

use crate::core::metrics;
use crate::core::router::TriggerRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Periodically reaps expired in-flight records the per-record timers missed.
pub struct RecordSweeperTask {
    router: Arc<TriggerRouter>,
    interval: Duration,
}

impl RecordSweeperTask {
    pub fn new(router: Arc<TriggerRouter>, interval: Duration) -> Self {
        Self { router, interval }
    }

    /// Runs the main loop for the record sweeper.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Record sweeper started (interval {:?}).", self.interval);
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.router.reap_stragglers().await;
                    metrics::INFLIGHT_RECORDS.set(self.router.inflight_count() as f64);
                }
                _ = shutdown_rx.recv() => {
                    info!("Record sweeper shutting down.");
                    return;
                }
            }
        }
    }
}
