// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a
//! client connection.

use super::guard::ConnectionGuard;
use super::session::SessionState;
use crate::core::dispatch::{DispatchReply, Dispatcher};
use crate::core::protocol::{ErrorMessage, Message, WireCodec};
use crate::core::state::ServerState;
use crate::core::LatZeroError;
use crate::server::TransportStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Manages the full lifecycle of a client connection: frame assembly,
/// dispatch, outbound delivery, and orderly disconnect.
pub struct ConnectionHandler {
    framed: Framed<TransportStream, WireCodec>,
    addr: SocketAddr,
    state: Arc<ServerState>,
    session_id: u64,
    /// Messages other components queued for this connection.
    outbound_rx: mpsc::Receiver<Message>,
    shutdown_rx: broadcast::Receiver<()>,
    global_shutdown_rx: broadcast::Receiver<()>,
    session: SessionState,
    dispatcher: Dispatcher,
    rate_cap: u32,
}

impl ConnectionHandler {
    /// Creates a new `ConnectionHandler`.
    pub async fn new(
        socket: TransportStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
        session_id: u64,
        outbound_rx: mpsc::Receiver<Message>,
        shutdown_rx: broadcast::Receiver<()>,
        global_shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let rate_cap = state.config.lock().await.limits.messages_per_second;
        let dispatcher = Dispatcher::new(state.clone());
        Self {
            framed: Framed::new(socket, WireCodec),
            addr,
            state,
            session_id,
            outbound_rx,
            shutdown_rx,
            global_shutdown_rx,
            session: SessionState::new(),
            dispatcher,
            rate_cap,
        }
    }

    /// The main event loop for the connection.
    pub async fn run(&mut self) -> Result<(), LatZeroError> {
        let _guard = ConnectionGuard::new(
            self.state.connections.clone(),
            self.session_id,
            self.addr,
        );

        'main_loop: loop {
            tokio::select! {
                // Prioritize shutdown signals over other events.
                biased;
                _ = self.global_shutdown_rx.recv() => {
                    info!("Connection handler for {} received global shutdown signal.", self.addr);
                    break 'main_loop;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Connection handler for {} received kill signal.", self.addr);
                    break 'main_loop;
                }
                Some(outbound) = self.outbound_rx.recv() => {
                    if let Err(e) = self.framed.send(outbound).await {
                        warn!("Outbound write to {} failed: {}", self.addr, e);
                        break 'main_loop;
                    }
                }
                result = self.framed.next() => {
                    match result {
                        Some(Ok(message)) => {
                            if let Err(e) = self.process_message(message).await {
                                if e.is_connection_fatal() {
                                    warn!("Fatal connection error for {}: {}", self.addr, e);
                                    break 'main_loop;
                                }
                                self.send_error(None, &e).await?;
                            }
                        }
                        Some(Err(e)) => {
                            if e.is_connection_fatal() || matches!(e, LatZeroError::Io(_)) {
                                if is_normal_disconnect(&e) {
                                    debug!("Connection from {} closed by peer: {}", self.addr, e);
                                } else {
                                    warn!("Connection error for {}: {}", self.addr, e);
                                }
                                break 'main_loop;
                            }
                            // A schema fault on a decodable frame gets a
                            // best-effort error reply; the stream stays up.
                            self.send_error(None, &e).await?;
                        }
                        None => {
                            debug!("Connection from {} closed by peer.", self.addr);
                            break 'main_loop;
                        }
                    }
                }
            }
        }

        // Disconnect semantics run before the guard clears the map entry:
        // the registry moves the binding into the rehydration cache and the
        // router fails records anchored on this connection.
        self.state.registry.handle_disconnect(self.session_id).await;
        Ok(())
    }

    /// Routes one parsed message through the dispatcher and sends any
    /// immediate reply.
    async fn process_message(&mut self, message: Message) -> Result<(), LatZeroError> {
        let request_id = message.request_id();
        debug!(
            "Session {}: received {} message.",
            self.session_id,
            message.kind()
        );

        if !self.session.admit_message(self.rate_cap) {
            let err = LatZeroError::TooManyRequests(self.rate_cap as usize);
            return self.send_error(request_id, &err).await;
        }

        if let Message::Handshake(hs) = &message {
            self.session.bound_app = Some(hs.app_id.clone());
        }

        match self.dispatcher.dispatch(self.session_id, message).await {
            Ok(DispatchReply::None) => Ok(()),
            Ok(DispatchReply::Message(reply)) => {
                debug!(
                    "Session {}: sending {} reply.",
                    self.session_id,
                    reply.kind()
                );
                self.framed.send(reply).await
            }
            Err(e) if e.is_connection_fatal() => Err(e),
            Err(e) => self.send_error(request_id, &e).await,
        }
    }

    /// Best-effort error reply. Errors without a correlation id still get
    /// one so callers waiting on a reply are not left hanging.
    async fn send_error(
        &mut self,
        correlation_id: Option<Uuid>,
        err: &LatZeroError,
    ) -> Result<(), LatZeroError> {
        let correlation_id = correlation_id.unwrap_or_else(Uuid::new_v4);
        let frame = Message::Error(ErrorMessage::from_error(correlation_id, err));
        debug!(
            "Session {}: sending error {} ({}).",
            self.session_id,
            err.error_code(),
            err
        );
        self.framed.send(frame).await
    }
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &LatZeroError) -> bool {
    matches!(e, LatZeroError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
