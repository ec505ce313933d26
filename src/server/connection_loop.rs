// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling
//! graceful shutdown.

use super::context::ServerContext;
use super::stream::TransportStream;
use crate::connection::ConnectionHandler;
use crate::core::metrics;
use crate::core::state::{ConnectionHandle, OUTBOUND_QUEUE_CAPACITY};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal based on the operating system.
/// On Unix, it listens for SIGINT and SIGTERM.
/// On Windows, it listens for Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// The main server loop that accepts connections and handles graceful
/// shutdown.
pub async fn run(mut ctx: ServerContext) {
    let mut session_id_counter: u64 = 0;
    let mut client_tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased; // Prioritize shutdown signals over other events.

            _ = await_shutdown_signal() => {
                break;
            },

            // Monitor background tasks for unexpected termination.
            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => info!("A background task has completed."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            // Accept new incoming TCP connections.
            res = ctx.listener.accept() => {
                let (socket, addr) = match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let Ok(permit) = ctx.connection_permits.clone().try_acquire_owned() else {
                    warn!("Connection ceiling reached; rejecting {}.", addr);
                    drop(socket);
                    continue;
                };

                info!("Accepted new connection from: {}", addr);
                ctx.state.stats.increment_total_connections();
                metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                metrics::CONNECTED_CLIENTS.inc();

                session_id_counter = session_id_counter.wrapping_add(1);
                let session_id = session_id_counter;
                let state_clone = ctx.state.clone();

                // Register the connection handle before the handler runs so
                // the router can address it from the first message on.
                let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
                let (conn_shutdown_tx, conn_shutdown_rx) = broadcast::channel(1);
                let global_shutdown_rx = ctx.shutdown_tx.subscribe();
                let handle = Arc::new(ConnectionHandle::new(
                    session_id,
                    addr,
                    outbound_tx,
                    conn_shutdown_tx,
                ));
                state_clone.connections.insert(session_id, handle);

                let acceptor = ctx.acceptor.clone();
                client_tasks.spawn(async move {
                    let _permit = permit;
                    let stream = match acceptor {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(tls_stream) => {
                                info!("TLS handshake successful for {addr}");
                                TransportStream::Tls(Box::new(tls_stream))
                            }
                            Err(e) => {
                                warn!("TLS handshake error for {addr}: {e}");
                                state_clone.connections.remove(&session_id);
                                metrics::CONNECTED_CLIENTS.dec();
                                return;
                            }
                        },
                        None => TransportStream::Plain(socket),
                    };

                    let mut handler = ConnectionHandler::new(
                        stream,
                        addr,
                        state_clone,
                        session_id,
                        outbound_rx,
                        conn_shutdown_rx,
                        global_shutdown_rx,
                    )
                    .await;
                    if let Err(e) = handler.run().await {
                        warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                    }
                });
            },

            // Reap completed client tasks.
            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("A client handler panicked: {e:?}");
                    }
                }
            },
        }
    }

    // --- Graceful Shutdown Sequence (reverse of initialization) ---
    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }

    // Transport goes first: no new connections, existing handlers drain.
    client_tasks.shutdown().await;
    info!("All client connections closed.");

    // Router: fail whatever is still in flight and cancel its timers.
    ctx.state.router.shutdown();

    // Background tasks, with a timeout so a wedged task cannot hang exit.
    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };

    // Persistence last: registrations were persisted as they changed, so a
    // final snapshot closes the store in a clean state.
    if let Err(e) = ctx.state.persistence.snapshot() {
        error!("Final snapshot on shutdown failed: {}", e);
    }
    info!("Server shutdown complete.");
}
