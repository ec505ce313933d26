// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests.

use latzero::config::Config;
use latzero::core::LatZeroError;
use latzero::core::dispatch::{DispatchReply, Dispatcher};
use latzero::core::protocol::{
    HandshakeAck, HandshakeMessage, Message, TriggerMessage,
};
use latzero::core::state::{ConnectionHandle, ServerState};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// A fake client connection: the handle is registered in the server's
/// connection map, and everything the server sends arrives on `rx`.
pub struct TestConnection {
    pub session_id: u64,
    pub rx: mpsc::Receiver<Message>,
}

impl TestConnection {
    /// Receives the next message the server queued for this connection,
    /// waiting up to two (virtual) seconds.
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(std::time::Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection channel closed")
    }

    /// True if nothing is currently queued.
    pub fn is_empty(&mut self) -> bool {
        matches!(self.rx.try_recv(), Err(mpsc::error::TryRecvError::Empty))
    }
}

/// TestContext provides a complete server environment backed by a temp data
/// directory, exercised through the dispatcher exactly as the connection
/// layer would.
pub struct TestContext {
    pub state: Arc<ServerState>,
    pub dispatcher: Dispatcher,
    _data_dir: TempDir,
}

impl TestContext {
    /// Creates a test context with default configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Creates a test context after letting the caller adjust the config.
    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let data_dir = TempDir::new().expect("failed to create temp data dir");
        let mut config = Config::default();
        config.data_dir = data_dir.path().to_path_buf();
        adjust(&mut config);

        let state = ServerState::initialize(config)
            .await
            .expect("failed to initialize server state");
        Self {
            dispatcher: Dispatcher::new(state.clone()),
            state,
            _data_dir: data_dir,
        }
    }

    /// Registers a fake connection under `session_id` and returns its
    /// receiving half.
    pub fn connect(&self, session_id: u64) -> TestConnection {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (kill_tx, _) = broadcast::channel(1);
        let handle = Arc::new(ConnectionHandle::new(
            session_id,
            "127.0.0.1:0".parse().unwrap(),
            outbound_tx,
            kill_tx,
        ));
        self.state.connections.insert(session_id, handle);
        TestConnection {
            session_id,
            rx: outbound_rx,
        }
    }

    /// Simulates the connection closing, in the same order the real
    /// handler runs: registry disconnect first, then the map entry goes.
    pub async fn disconnect(&self, session_id: u64) {
        self.state.registry.handle_disconnect(session_id).await;
        self.state.connections.remove(&session_id);
    }

    /// Performs a handshake for `session_id` and returns the ack.
    pub async fn handshake(
        &self,
        session_id: u64,
        app_id: &str,
        pools: &[&str],
        triggers: &[&str],
    ) -> Result<HandshakeAck, LatZeroError> {
        let msg = HandshakeMessage {
            id: Some(Uuid::new_v4()),
            app_id: app_id.to_string(),
            pools: pools.iter().map(|s| s.to_string()).collect(),
            triggers: triggers.iter().map(|s| s.to_string()).collect(),
            metadata: serde_json::Map::new(),
            protocol_version: Some("0.1.0".to_string()),
        };
        match self
            .dispatcher
            .dispatch(session_id, Message::Handshake(msg))
            .await?
        {
            DispatchReply::Message(Message::HandshakeAck(ack)) => Ok(ack),
            _ => panic!("handshake did not return an ack"),
        }
    }

    /// Dispatches a message as if it arrived on `session_id`.
    pub async fn dispatch(
        &self,
        session_id: u64,
        message: Message,
    ) -> Result<DispatchReply, LatZeroError> {
        self.dispatcher.dispatch(session_id, message).await
    }
}

/// Builds a trigger message with the given id.
pub fn trigger_msg(
    id: Uuid,
    origin: &str,
    trigger: &str,
    destination: Option<&str>,
    payload: Value,
    ttl_ms: Option<u64>,
) -> TriggerMessage {
    TriggerMessage {
        id,
        origin: origin.to_string(),
        trigger: trigger.to_string(),
        payload,
        pool: None,
        destination: destination.map(|s| s.to_string()),
        ttl_ms,
        flags: None,
        timestamp: None,
    }
}
