// src/core/tasks/block_gc.rs

//! Idle memory-block garbage collection and expired-lock reaping.

use crate::core::memory::MemoryManager;
use crate::core::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Sweeps idle, non-persistent, zero-attachment blocks past their idle max
/// age, and reaps expired advisory locks as it goes.
pub struct BlockGcTask {
    memory: Arc<MemoryManager>,
    interval: Duration,
}

impl BlockGcTask {
    pub fn new(memory: Arc<MemoryManager>, interval: Duration) -> Self {
        Self { memory, interval }
    }

    /// Runs the main loop for the block garbage collector.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Block GC started (interval {:?}).", self.interval);
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let collected = self.memory.collect_idle_blocks();
                    if collected > 0 {
                        info!("Block GC removed {} idle blocks.", collected);
                    }
                    metrics::MEMORY_BLOCKS.set(self.memory.block_count() as f64);
                }
                _ = shutdown_rx.recv() => {
                    info!("Block GC shutting down.");
                    return;
                }
            }
        }
    }
}
