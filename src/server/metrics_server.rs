// src/server/metrics_server.rs

//! A small HTTP server exposing Prometheus metrics.

use crate::core::metrics;
use crate::core::state::ServerState;
use axum::{Router, routing::get};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Serves `GET /metrics` on the configured metrics port until shutdown.
pub async fn run_metrics_server(
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (host, port) = {
        let config = state.config.lock().await;
        (config.host.clone(), config.metrics.port)
    };

    let app = Router::new().route("/metrics", get(|| async { metrics::render() }));

    let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server on {}:{}: {}", host, port, e);
            return;
        }
    };
    info!("Prometheus metrics server listening on {}:{}.", host, port);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });
    if let Err(e) = serve.await {
        error!("Metrics server error: {}", e);
    }
    info!("Metrics server shut down.");
}
