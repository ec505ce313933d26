// src/core/dispatch.rs

//! Routes each parsed inbound message to the component that owns it and
//! shapes the immediate reply, if the message kind has one.

use crate::core::LatZeroError;
use crate::core::protocol::{
    AdminMessage, BinaryFrame, MemoryMessage, MemoryOp, Message, ResponseMessage, ResponseStatus,
    bytes_to_value,
};
use crate::core::state::ServerState;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// What the connection handler should do after a message was processed.
#[derive(Debug)]
pub enum DispatchReply {
    /// Nothing to send now; any response arrives asynchronously.
    None,
    /// Send this message back on the same connection.
    Message(Message),
}

/// Per-message dispatch over the shared server state.
pub struct Dispatcher {
    state: Arc<ServerState>,
}

impl Dispatcher {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Dispatches one inbound message from `session_id`.
    pub async fn dispatch(
        &self,
        session_id: u64,
        message: Message,
    ) -> Result<DispatchReply, LatZeroError> {
        match message {
            Message::Handshake(msg) => {
                let ack = self.state.registry.handshake(session_id, msg).await?;
                Ok(DispatchReply::Message(Message::HandshakeAck(ack)))
            }
            Message::Trigger(msg) => {
                self.state.router.route_trigger(session_id, msg).await?;
                Ok(DispatchReply::None)
            }
            Message::Response(msg) => {
                self.state.router.handle_response(msg);
                Ok(DispatchReply::None)
            }
            Message::Error(msg) => {
                self.state.router.handle_error_reply(msg);
                Ok(DispatchReply::None)
            }
            Message::Emit(msg) => {
                let delivered = self.state.router.handle_emit(session_id, msg)?;
                debug!("Emit delivered to {} handlers.", delivered);
                Ok(DispatchReply::None)
            }
            Message::Memory(msg) => self.dispatch_memory(session_id, msg).await,
            Message::Admin(msg) => self.dispatch_admin(msg),
            Message::Binary(frame) => self.dispatch_binary(session_id, frame).await,
            Message::HandshakeAck(_) => Err(LatZeroError::Validation(
                "handshake_ack is a server-to-client message".into(),
            )),
        }
    }

    /// Resolves the AppID bound on the session; memory and trigger traffic
    /// from an unbound connection is rejected.
    fn bound_app(&self, session_id: u64) -> Result<String, LatZeroError> {
        self.state.registry.app_of_session(session_id).ok_or_else(|| {
            LatZeroError::Validation("connection is not bound; handshake first".into())
        })
    }

    async fn dispatch_memory(
        &self,
        session_id: u64,
        msg: MemoryMessage,
    ) -> Result<DispatchReply, LatZeroError> {
        let origin = self.bound_app(session_id)?;
        let pools = &self.state.pools;
        let memory = &self.state.memory;
        let block_id = msg.block_id.clone();

        let result: Value = match msg.op {
            MemoryOp::Create {
                name,
                pool,
                size,
                kind,
                permissions,
            } => {
                memory
                    .create_block(pools, &origin, &block_id, name, pool, size, kind, permissions)
                    .await?
            }
            MemoryOp::Attach { mode } => {
                memory.attach(pools, &origin, &block_id, mode).await?;
                json!({ "attached": true })
            }
            MemoryOp::Detach => {
                memory.detach(&origin, &block_id)?;
                json!({ "attached": false })
            }
            MemoryOp::Read { offset, length } => {
                let data = memory
                    .read(pools, &origin, &block_id, offset, length)
                    .await?;
                json!({ "data": bytes_to_value(&data), "length": data.len() })
            }
            MemoryOp::Write { offset, data } => {
                let version = memory
                    .write(pools, &origin, &block_id, offset, &data)
                    .await?;
                json!({ "version": version })
            }
            MemoryOp::CompareAndSwap {
                offset,
                expected,
                data,
            } => {
                let outcome = memory
                    .compare_and_swap(pools, &origin, &block_id, offset, &expected, &data)
                    .await?;
                json!({
                    "success": outcome.success,
                    "previous": bytes_to_value(&outcome.previous),
                    "version": outcome.version,
                })
            }
            MemoryOp::Lock { mode, timeout_ms } => {
                let lock_id = memory
                    .lock(
                        pools,
                        &origin,
                        &block_id,
                        mode,
                        Duration::from_millis(timeout_ms),
                    )
                    .await?;
                json!({ "lock_id": lock_id.to_string() })
            }
            MemoryOp::Unlock { lock_id } => {
                memory.unlock(&block_id, lock_id)?;
                json!({ "unlocked": true })
            }
            MemoryOp::Remove => {
                memory.remove_block(pools, &origin, &block_id).await?;
                json!({ "removed": true })
            }
            MemoryOp::Stat => memory.stat(&block_id)?,
        };

        match msg.id {
            Some(id) => Ok(DispatchReply::Message(Message::Response(ResponseMessage {
                correlation_id: id,
                status: ResponseStatus::Success,
                result: Some(result),
                error: None,
            }))),
            None => Ok(DispatchReply::None),
        }
    }

    /// A binary frame is the bulk variant of a memory write: the JSON header
    /// carries the write coordinates, the raw tail carries the bytes.
    async fn dispatch_binary(
        &self,
        session_id: u64,
        frame: BinaryFrame,
    ) -> Result<DispatchReply, LatZeroError> {
        let operation = frame
            .header
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("write");
        if operation != "write" {
            return Err(LatZeroError::Validation(format!(
                "binary frames only carry bulk writes, got '{operation}'"
            )));
        }
        let block_id = frame
            .header
            .get("block_id")
            .and_then(Value::as_str)
            .ok_or_else(|| LatZeroError::Validation("binary frame missing block_id".into()))?
            .to_string();
        let offset = frame
            .header
            .get("offset")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let id = frame
            .header
            .get("id")
            .and_then(Value::as_str)
            .map(|raw| Uuid::try_parse(raw))
            .transpose()?;

        let origin = self.bound_app(session_id)?;
        let version = self
            .state
            .memory
            .write(&self.state.pools, &origin, &block_id, offset, &frame.data)
            .await?;

        match id {
            Some(id) => Ok(DispatchReply::Message(Message::Response(ResponseMessage {
                correlation_id: id,
                status: ResponseStatus::Success,
                result: Some(json!({ "version": version })),
                error: None,
            }))),
            None => Ok(DispatchReply::None),
        }
    }

    /// Introspection-only admin surface.
    fn dispatch_admin(&self, msg: AdminMessage) -> Result<DispatchReply, LatZeroError> {
        let state = &self.state;
        let result = match msg.operation.as_str() {
            "status" => json!({
                "server": "latzero",
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": crate::core::protocol::PROTOCOL_VERSION,
                "instance_id": state.instance_id,
                "uptime_secs": state.started_at.elapsed().as_secs(),
                "connections": state.connections.len(),
                "apps": state.registry.list().len(),
                "in_flight": state.router.inflight_count(),
            }),
            "apps" => Value::Array(
                state
                    .registry
                    .list()
                    .into_iter()
                    .map(|r| {
                        json!({
                            "app_id": r.app_id,
                            "pools": r.pools.iter().collect::<Vec<_>>(),
                            "triggers": r.triggers.iter().collect::<Vec<_>>(),
                            "rehydrated": r.rehydrated,
                            "registered_at": r.registered_at.to_rfc3339(),
                            "last_seen_at": r.last_seen_at.to_rfc3339(),
                        })
                    })
                    .collect(),
            ),
            "pools" => Value::Array(
                state
                    .pools
                    .list()
                    .into_iter()
                    .map(|p| {
                        json!({
                            "name": p.name,
                            "type": p.kind,
                            "encrypted": p.encrypted,
                            "members": p.members.iter().collect::<Vec<_>>(),
                            "created_at": p.created_at.to_rfc3339(),
                        })
                    })
                    .collect(),
            ),
            "blocks" => Value::Array(state.memory.list()),
            "records" => Value::Array(
                state
                    .persistence
                    .list_trigger_rows()
                    .into_iter()
                    .map(|row| row.to_value())
                    .collect(),
            ),
            "stats" => {
                let stats = &state.stats;
                json!({
                    "total_connections": stats.total_connections.load(std::sync::atomic::Ordering::Relaxed),
                    "triggers_routed": stats.triggers_routed.load(std::sync::atomic::Ordering::Relaxed),
                    "triggers_failed": stats.triggers_failed.load(std::sync::atomic::Ordering::Relaxed),
                    "triggers_timed_out": stats.triggers_timed_out.load(std::sync::atomic::Ordering::Relaxed),
                    "emits_delivered": stats.emits_delivered.load(std::sync::atomic::Ordering::Relaxed),
                    "response_time_ema_micros": stats.response_time_ema_micros(),
                    "in_flight": state.router.inflight_count(),
                    "blocks": state.memory.block_count(),
                })
            }
            other => {
                warn!("Unknown admin operation '{}'.", other);
                return Err(LatZeroError::Validation(format!(
                    "unknown admin operation '{other}'"
                )));
            }
        };

        match msg.id {
            Some(id) => Ok(DispatchReply::Message(Message::Response(ResponseMessage {
                correlation_id: id,
                status: ResponseStatus::Success,
                result: Some(result),
                error: None,
            }))),
            None => Ok(DispatchReply::None),
        }
    }
}

/// Notifies attached applications after block writes by sending them an
/// `emit` carrying the block id and new version.
pub struct BlockWriteNotifier {
    pub registry: Arc<crate::core::registry::AppRegistry>,
    pub connections: Arc<crate::core::state::ConnectionMap>,
}

impl crate::core::memory::BlockSubscriber for BlockWriteNotifier {
    fn on_block_written(
        &self,
        block_id: &str,
        pool: &str,
        version: u64,
        attached: &[String],
        writer: &str,
    ) {
        for app in attached {
            if app == writer {
                continue;
            }
            let Some(session) = self.registry.session_of_app(app) else {
                continue;
            };
            if let Some(handle) = self.connections.get(&session) {
                let notification = Message::Emit(crate::core::protocol::EmitMessage {
                    trigger: "memory.updated".to_string(),
                    payload: json!({ "block_id": block_id, "version": version }),
                    pool: Some(pool.to_string()),
                });
                if let Err(e) = handle.send(notification) {
                    debug!("Block notification to '{}' shed: {}", app, e);
                }
            }
        }
    }
}
