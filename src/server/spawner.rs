// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::tasks::{
    block_gc::BlockGcTask, rehydration_purger::RehydrationPurgerTask, snapshot::SnapshotTask,
    sweeper::RecordSweeperTask,
};
use anyhow::Result;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let server_state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    let config_clone = server_state.config.lock().await.clone();

    // --- Metrics Server ---
    if config_clone.metrics.enabled {
        let metrics_state = server_state.clone();
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Router straggler sweeper ---
    let sweeper = RecordSweeperTask::new(
        server_state.router.clone(),
        config_clone.routing.sweep_interval,
    );
    let shutdown_rx_sweeper = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        sweeper.run(shutdown_rx_sweeper).await;
        Ok(())
    });

    // --- Rehydration cache purger ---
    let purger = RehydrationPurgerTask::new(
        server_state.registry.clone(),
        config_clone.registry.purge_interval,
    );
    let shutdown_rx_purger = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        purger.run(shutdown_rx_purger).await;
        Ok(())
    });

    // --- Memory block GC ---
    let gc = BlockGcTask::new(server_state.memory.clone(), config_clone.memory.gc_interval);
    let shutdown_rx_gc = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        gc.run(shutdown_rx_gc).await;
        Ok(())
    });

    // --- Snapshot saver ---
    if !config_clone.memory_mode {
        let saver = SnapshotTask::new(
            server_state.persistence.clone(),
            config_clone.persistence.snapshot_interval,
            config_clone.persistence.backups_every,
        );
        let shutdown_rx_saver = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            saver.run(shutdown_rx_saver).await;
            Ok(())
        });
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
