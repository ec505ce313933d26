// src/core/protocol/message.rs

//! Typed wire messages and the per-kind schema validation applied to every
//! decoded frame.
//!
//! Payloads are JSON objects tagged by a `type` field. Parsing normalizes the
//! legacy aliases still accepted on input (`process` for `trigger`,
//! `in_reply_to` for `correlation_id`) so higher layers only ever see the
//! canonical names. The same schemas are used to build outbound messages, so
//! the codec is symmetric.

use super::validate::{validate_app_id, validate_pool_name, validate_trigger_name};
use crate::core::errors::{ErrorCode, LatZeroError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// The protocol version string advertised in handshakes.
pub const PROTOCOL_VERSION: &str = "0.1.0";

pub type JsonMap = Map<String, Value>;

/// Permission map attached to pools and memory blocks: operation name to the
/// list of AppIDs allowed to perform it. `*` denotes "any".
pub type PermissionMap = IndexMap<String, Vec<String>>;

/// Block categories understood by the memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Shared,
    Persistent,
    Encrypted,
    Temporary,
    Json,
    Binary,
    Stream,
}

impl Default for BlockKind {
    fn default() -> Self {
        BlockKind::Shared
    }
}

/// Advisory lock modes for memory blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    Write,
    Exclusive,
}

/// Attachment modes for memory blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    Read,
    Write,
}

/// A parsed `handshake` message.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeMessage {
    pub id: Option<Uuid>,
    pub app_id: String,
    pub pools: Vec<String>,
    pub triggers: Vec<String>,
    pub metadata: JsonMap,
    pub protocol_version: Option<String>,
}

/// The server-resolved registration echoed back in a `handshake_ack`.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedFields {
    pub app_id: String,
    pub pools: Vec<String>,
    pub triggers: Vec<String>,
    pub rehydrated: bool,
}

/// A `handshake_ack` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeAck {
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub status: String,
    pub assigned: AssignedFields,
}

/// A parsed `trigger` request.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMessage {
    pub id: Uuid,
    pub origin: String,
    pub trigger: String,
    pub payload: Value,
    pub pool: Option<String>,
    pub destination: Option<String>,
    pub ttl_ms: Option<u64>,
    pub flags: Option<Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Completion status of a `response` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
        }
    }
}

/// A parsed `response` message. `correlation_id` names the in-flight record
/// it answers, normalized from whichever of `correlation_id`, `in_reply_to`,
/// or `id` the sender used.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub correlation_id: Uuid,
    pub status: ResponseStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// A fire-and-forget `emit`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitMessage {
    pub trigger: String,
    pub payload: Value,
    pub pool: Option<String>,
}

/// A terminal `error` reply for a pending request.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub correlation_id: Uuid,
    pub error: String,
    pub error_code: ErrorCode,
}

impl ErrorMessage {
    /// Builds an error message out of a service error, correlated to the
    /// request it terminates.
    pub fn from_error(correlation_id: Uuid, err: &LatZeroError) -> Self {
        Self {
            correlation_id,
            error: err.to_string(),
            error_code: err.error_code(),
        }
    }
}

/// The per-operation sub-schema of a `memory` message.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryOp {
    Create {
        name: Option<String>,
        pool: Option<String>,
        size: u64,
        kind: BlockKind,
        permissions: Option<PermissionMap>,
    },
    Attach {
        mode: AttachMode,
    },
    Detach,
    Read {
        offset: u64,
        length: Option<u64>,
    },
    Write {
        offset: u64,
        data: Vec<u8>,
    },
    CompareAndSwap {
        offset: u64,
        expected: Vec<u8>,
        data: Vec<u8>,
    },
    Lock {
        mode: LockMode,
        timeout_ms: u64,
    },
    Unlock {
        lock_id: Uuid,
    },
    Remove,
    Stat,
}

impl MemoryOp {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryOp::Create { .. } => "create",
            MemoryOp::Attach { .. } => "attach",
            MemoryOp::Detach => "detach",
            MemoryOp::Read { .. } => "read",
            MemoryOp::Write { .. } => "write",
            MemoryOp::CompareAndSwap { .. } => "cas",
            MemoryOp::Lock { .. } => "lock",
            MemoryOp::Unlock { .. } => "unlock",
            MemoryOp::Remove => "remove",
            MemoryOp::Stat => "stat",
        }
    }
}

/// A parsed `memory` message.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMessage {
    pub id: Option<Uuid>,
    pub block_id: String,
    pub op: MemoryOp,
}

/// A parsed `admin` introspection request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminMessage {
    pub id: Option<Uuid>,
    pub operation: String,
}

/// A binary frame: a JSON header with `type == "binary_frame"` followed by
/// `binary_size` raw bytes inside the same length-prefixed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    pub header: JsonMap,
    pub data: Bytes,
}

/// A fully parsed and validated wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeMessage),
    HandshakeAck(HandshakeAck),
    Trigger(TriggerMessage),
    Response(ResponseMessage),
    Emit(EmitMessage),
    Error(ErrorMessage),
    Memory(MemoryMessage),
    Admin(AdminMessage),
    Binary(BinaryFrame),
}

impl Message {
    /// The wire-level `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshake_ack",
            Message::Trigger(_) => "trigger",
            Message::Response(_) => "response",
            Message::Emit(_) => "emit",
            Message::Error(_) => "error",
            Message::Memory(_) => "memory",
            Message::Admin(_) => "admin",
            Message::Binary(_) => "binary_frame",
        }
    }

    /// The request id of this message, when it carries one. Used to correlate
    /// error replies for malformed follow-ups.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Message::Handshake(m) => m.id,
            Message::HandshakeAck(m) => Some(m.id),
            Message::Trigger(m) => Some(m.id),
            Message::Response(m) => Some(m.correlation_id),
            Message::Error(m) => Some(m.correlation_id),
            Message::Memory(m) => m.id,
            Message::Admin(m) => m.id,
            Message::Emit(_) | Message::Binary(_) => None,
        }
    }

    /// Parses and validates a JSON payload into a typed message.
    pub fn from_json(value: Value) -> Result<Message, LatZeroError> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(LatZeroError::Protocol(format!(
                    "payload must be a JSON object, got {}",
                    json_type_name(&other)
                )));
            }
        };

        let kind = req_str(&map, "type")?;
        match kind.as_str() {
            "handshake" => parse_handshake(&map).map(Message::Handshake),
            "handshake_ack" => parse_handshake_ack(&map).map(Message::HandshakeAck),
            // `process` is the legacy alias for `trigger`.
            "trigger" | "process" => parse_trigger(&map).map(Message::Trigger),
            "response" => parse_response(&map).map(Message::Response),
            "emit" => parse_emit(&map).map(Message::Emit),
            "error" => parse_error(&map).map(Message::Error),
            "memory" => parse_memory(&map).map(Message::Memory),
            "admin" => parse_admin(&map).map(Message::Admin),
            "binary_frame" => Err(LatZeroError::Protocol(
                "binary_frame header without binary payload".into(),
            )),
            other => Err(LatZeroError::Protocol(format!(
                "unrecognized message type '{other}'"
            ))),
        }
    }

    /// Assembles a binary frame from its already-parsed header and raw tail.
    pub fn from_binary(header: JsonMap, data: Bytes) -> Result<Message, LatZeroError> {
        let declared = req_u64(&header, "binary_size")? as usize;
        if declared != data.len() {
            return Err(LatZeroError::Protocol(format!(
                "binary_size {declared} does not match {} trailing bytes",
                data.len()
            )));
        }
        Ok(Message::Binary(BinaryFrame { header, data }))
    }

    /// Serializes the message back into its canonical JSON form.
    pub fn to_json(&self) -> Value {
        match self {
            Message::Handshake(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("handshake"));
                if let Some(id) = m.id {
                    map.insert("id".into(), json!(id.to_string()));
                }
                map.insert("app_id".into(), json!(m.app_id));
                map.insert("pools".into(), json!(m.pools));
                map.insert("triggers".into(), json!(m.triggers));
                map.insert("metadata".into(), Value::Object(m.metadata.clone()));
                if let Some(v) = &m.protocol_version {
                    map.insert("protocol_version".into(), json!(v));
                }
                Value::Object(map)
            }
            Message::HandshakeAck(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("handshake_ack"));
                map.insert("id".into(), json!(m.id.to_string()));
                if let Some(cid) = m.correlation_id {
                    map.insert("correlation_id".into(), json!(cid.to_string()));
                }
                map.insert("status".into(), json!(m.status));
                map.insert(
                    "assigned".into(),
                    json!({
                        "app_id": m.assigned.app_id,
                        "pools": m.assigned.pools,
                        "triggers": m.assigned.triggers,
                        "rehydrated": m.assigned.rehydrated,
                    }),
                );
                Value::Object(map)
            }
            Message::Trigger(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("trigger"));
                map.insert("id".into(), json!(m.id.to_string()));
                map.insert("origin".into(), json!(m.origin));
                map.insert("trigger".into(), json!(m.trigger));
                map.insert("payload".into(), m.payload.clone());
                if let Some(p) = &m.pool {
                    map.insert("pool".into(), json!(p));
                }
                if let Some(d) = &m.destination {
                    map.insert("destination".into(), json!(d));
                }
                if let Some(ttl) = m.ttl_ms {
                    map.insert("ttl".into(), json!(ttl));
                }
                if let Some(f) = &m.flags {
                    map.insert("flags".into(), f.clone());
                }
                if let Some(ts) = &m.timestamp {
                    map.insert("timestamp".into(), json!(ts.to_rfc3339()));
                }
                Value::Object(map)
            }
            Message::Response(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("response"));
                map.insert("id".into(), json!(m.correlation_id.to_string()));
                map.insert(
                    "correlation_id".into(),
                    json!(m.correlation_id.to_string()),
                );
                map.insert("status".into(), json!(m.status.as_str()));
                if let Some(r) = &m.result {
                    map.insert("result".into(), r.clone());
                }
                if let Some(e) = &m.error {
                    map.insert("error".into(), json!(e));
                }
                Value::Object(map)
            }
            Message::Emit(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("emit"));
                map.insert("trigger".into(), json!(m.trigger));
                map.insert("payload".into(), m.payload.clone());
                if let Some(p) = &m.pool {
                    map.insert("pool".into(), json!(p));
                }
                Value::Object(map)
            }
            Message::Error(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("error"));
                map.insert(
                    "correlation_id".into(),
                    json!(m.correlation_id.to_string()),
                );
                map.insert("error".into(), json!(m.error));
                map.insert("error_code".into(), json!(m.error_code.as_str()));
                Value::Object(map)
            }
            Message::Memory(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("memory"));
                if let Some(id) = m.id {
                    map.insert("id".into(), json!(id.to_string()));
                }
                map.insert("operation".into(), json!(m.op.name()));
                map.insert("block_id".into(), json!(m.block_id));
                match &m.op {
                    MemoryOp::Create {
                        name,
                        pool,
                        size,
                        kind,
                        permissions,
                    } => {
                        if let Some(n) = name {
                            map.insert("name".into(), json!(n));
                        }
                        if let Some(p) = pool {
                            map.insert("pool".into(), json!(p));
                        }
                        map.insert("size".into(), json!(size));
                        map.insert("block_type".into(), serde_json::to_value(kind).unwrap_or(Value::Null));
                        if let Some(perms) = permissions {
                            map.insert(
                                "permissions".into(),
                                serde_json::to_value(perms).unwrap_or(Value::Null),
                            );
                        }
                    }
                    MemoryOp::Attach { mode } => {
                        map.insert(
                            "mode".into(),
                            serde_json::to_value(mode).unwrap_or(Value::Null),
                        );
                    }
                    MemoryOp::Read { offset, length } => {
                        map.insert("offset".into(), json!(offset));
                        if let Some(len) = length {
                            map.insert("length".into(), json!(len));
                        }
                    }
                    MemoryOp::Write { offset, data } => {
                        map.insert("offset".into(), json!(offset));
                        map.insert("data".into(), bytes_to_value(data));
                    }
                    MemoryOp::CompareAndSwap {
                        offset,
                        expected,
                        data,
                    } => {
                        map.insert("offset".into(), json!(offset));
                        map.insert("expected".into(), bytes_to_value(expected));
                        map.insert("data".into(), bytes_to_value(data));
                    }
                    MemoryOp::Lock { mode, timeout_ms } => {
                        map.insert(
                            "mode".into(),
                            serde_json::to_value(mode).unwrap_or(Value::Null),
                        );
                        map.insert("timeout".into(), json!(timeout_ms));
                    }
                    MemoryOp::Unlock { lock_id } => {
                        map.insert("lock_id".into(), json!(lock_id.to_string()));
                    }
                    MemoryOp::Detach | MemoryOp::Remove | MemoryOp::Stat => {}
                }
                Value::Object(map)
            }
            Message::Admin(m) => {
                let mut map = JsonMap::new();
                map.insert("type".into(), json!("admin"));
                if let Some(id) = m.id {
                    map.insert("id".into(), json!(id.to_string()));
                }
                map.insert("operation".into(), json!(m.operation));
                Value::Object(map)
            }
            Message::Binary(m) => {
                let mut header = m.header.clone();
                header.insert("type".into(), json!("binary_frame"));
                header.insert("binary_size".into(), json!(m.data.len()));
                Value::Object(header)
            }
        }
    }
}

// --- Field accessors -------------------------------------------------------

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn req_field<'a>(map: &'a JsonMap, key: &str) -> Result<&'a Value, LatZeroError> {
    map.get(key)
        .ok_or_else(|| LatZeroError::Protocol(format!("missing required field '{key}'")))
}

fn req_str(map: &JsonMap, key: &str) -> Result<String, LatZeroError> {
    match req_field(map, key)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(LatZeroError::Protocol(format!(
            "field '{key}' must be a string, got {}",
            json_type_name(other)
        ))),
    }
}

fn opt_str(map: &JsonMap, key: &str) -> Result<Option<String>, LatZeroError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(LatZeroError::Protocol(format!(
            "field '{key}' must be a string, got {}",
            json_type_name(other)
        ))),
    }
}

fn req_u64(map: &JsonMap, key: &str) -> Result<u64, LatZeroError> {
    match req_field(map, key)? {
        Value::Number(n) => n.as_u64().ok_or_else(|| {
            LatZeroError::Protocol(format!("field '{key}' must be a non-negative integer"))
        }),
        other => Err(LatZeroError::Protocol(format!(
            "field '{key}' must be a number, got {}",
            json_type_name(other)
        ))),
    }
}

fn opt_u64(map: &JsonMap, key: &str) -> Result<Option<u64>, LatZeroError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            LatZeroError::Protocol(format!("field '{key}' must be a non-negative integer"))
        }),
        Some(other) => Err(LatZeroError::Protocol(format!(
            "field '{key}' must be a number, got {}",
            json_type_name(other)
        ))),
    }
}

fn parse_uuid(raw: &str, key: &str) -> Result<Uuid, LatZeroError> {
    Uuid::try_parse(raw)
        .map_err(|_| LatZeroError::Protocol(format!("field '{key}' is not a valid UUID: '{raw}'")))
}

fn req_uuid(map: &JsonMap, key: &str) -> Result<Uuid, LatZeroError> {
    parse_uuid(&req_str(map, key)?, key)
}

fn opt_uuid(map: &JsonMap, key: &str) -> Result<Option<Uuid>, LatZeroError> {
    match opt_str(map, key)? {
        Some(raw) => parse_uuid(&raw, key).map(Some),
        None => Ok(None),
    }
}

fn str_list(map: &JsonMap, key: &str) -> Result<Vec<String>, LatZeroError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(LatZeroError::Protocol(format!(
                    "field '{key}' must be a list of strings, found {}",
                    json_type_name(other)
                ))),
            })
            .collect(),
        Some(other) => Err(LatZeroError::Protocol(format!(
            "field '{key}' must be an array, got {}",
            json_type_name(other)
        ))),
    }
}

/// Converts a JSON value carrying binary data into raw bytes.
/// Accepts a UTF-8 string or an array of byte-sized numbers.
pub fn value_to_bytes(value: &Value, key: &str) -> Result<Vec<u8>, LatZeroError> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .filter(|n| *n <= u8::MAX as u64)
                    .map(|n| n as u8)
                    .ok_or_else(|| {
                        LatZeroError::Protocol(format!("field '{key}' contains a non-byte value"))
                    })
            })
            .collect(),
        other => Err(LatZeroError::Protocol(format!(
            "field '{key}' must be a string or byte array, got {}",
            json_type_name(other)
        ))),
    }
}

/// Converts raw bytes into their JSON transport form: a string when the data
/// is valid UTF-8, otherwise an array of numbers.
pub fn bytes_to_value(data: &[u8]) -> Value {
    match std::str::from_utf8(data) {
        Ok(s) => Value::String(s.to_string()),
        Err(_) => Value::Array(data.iter().map(|b| json!(b)).collect()),
    }
}

// --- Per-kind parsers ------------------------------------------------------

fn parse_handshake(map: &JsonMap) -> Result<HandshakeMessage, LatZeroError> {
    let app_id = req_str(map, "app_id")?;
    validate_app_id(&app_id)?;

    let pools = str_list(map, "pools")?;
    for pool in &pools {
        validate_pool_name(pool)?;
    }
    let triggers = str_list(map, "triggers")?;
    for trigger in &triggers {
        validate_trigger_name(trigger)?;
    }

    let metadata = match map.get("metadata") {
        None | Some(Value::Null) => JsonMap::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(other) => {
            return Err(LatZeroError::Protocol(format!(
                "field 'metadata' must be an object, got {}",
                json_type_name(other)
            )));
        }
    };

    Ok(HandshakeMessage {
        id: opt_uuid(map, "id")?,
        app_id,
        pools,
        triggers,
        metadata,
        protocol_version: opt_str(map, "protocol_version")?,
    })
}

fn parse_handshake_ack(map: &JsonMap) -> Result<HandshakeAck, LatZeroError> {
    let status = req_str(map, "status")?;
    let correlation_id = req_uuid(map, "correlation_id")?;
    let assigned = match map.get("assigned") {
        Some(Value::Object(a)) => AssignedFields {
            app_id: req_str(a, "app_id").unwrap_or_default(),
            pools: str_list(a, "pools")?,
            triggers: str_list(a, "triggers")?,
            rehydrated: a.get("rehydrated").and_then(Value::as_bool).unwrap_or(false),
        },
        _ => AssignedFields {
            app_id: String::new(),
            pools: Vec::new(),
            triggers: Vec::new(),
            rehydrated: false,
        },
    };
    Ok(HandshakeAck {
        id: opt_uuid(map, "id")?.unwrap_or_else(Uuid::new_v4),
        correlation_id: Some(correlation_id),
        status,
        assigned,
    })
}

fn parse_trigger(map: &JsonMap) -> Result<TriggerMessage, LatZeroError> {
    let id = req_uuid(map, "id")?;
    let origin = req_str(map, "origin")?;
    validate_app_id(&origin)?;

    // `process` is the legacy field alias for `trigger`.
    let trigger = match opt_str(map, "trigger")? {
        Some(t) => t,
        None => req_str(map, "process")
            .map_err(|_| LatZeroError::Protocol("missing required field 'trigger'".into()))?,
    };
    validate_trigger_name(&trigger)?;

    let pool = opt_str(map, "pool")?;
    if let Some(p) = &pool {
        validate_pool_name(p)?;
    }
    let destination = opt_str(map, "destination")?;
    if let Some(d) = &destination {
        validate_app_id(d)?;
    }

    let ttl_ms = match opt_u64(map, "ttl")? {
        Some(t) => Some(t),
        None => opt_u64(map, "ttl_ms")?,
    };

    let timestamp = match opt_str(map, "timestamp")? {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| LatZeroError::Protocol(format!("invalid timestamp: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    Ok(TriggerMessage {
        id,
        origin,
        trigger,
        payload: req_field(map, "payload")?.clone(),
        pool,
        destination,
        ttl_ms,
        flags: map.get("flags").cloned(),
        timestamp,
    })
}

/// Resolves the correlation id of a `response`/`error`, accepting the
/// `in_reply_to` alias and falling back to `id`.
fn correlation_id(map: &JsonMap) -> Result<Uuid, LatZeroError> {
    if let Some(cid) = opt_uuid(map, "correlation_id")? {
        return Ok(cid);
    }
    if let Some(cid) = opt_uuid(map, "in_reply_to")? {
        return Ok(cid);
    }
    opt_uuid(map, "id")?.ok_or_else(|| {
        LatZeroError::Protocol("missing correlation field ('correlation_id' or 'id')".into())
    })
}

fn parse_response(map: &JsonMap) -> Result<ResponseMessage, LatZeroError> {
    let status = match req_str(map, "status")?.as_str() {
        "success" | "ok" => ResponseStatus::Success,
        "error" | "failure" => ResponseStatus::Error,
        other => {
            return Err(LatZeroError::Protocol(format!(
                "unrecognized response status '{other}'"
            )));
        }
    };
    Ok(ResponseMessage {
        correlation_id: correlation_id(map)?,
        status,
        result: map.get("result").cloned(),
        error: opt_str(map, "error")?,
    })
}

fn parse_emit(map: &JsonMap) -> Result<EmitMessage, LatZeroError> {
    let trigger = match opt_str(map, "trigger")? {
        Some(t) => t,
        None => req_str(map, "process")
            .map_err(|_| LatZeroError::Protocol("missing required field 'trigger'".into()))?,
    };
    validate_trigger_name(&trigger)?;
    let pool = opt_str(map, "pool")?;
    if let Some(p) = &pool {
        validate_pool_name(p)?;
    }
    Ok(EmitMessage {
        trigger,
        payload: req_field(map, "payload")?.clone(),
        pool,
    })
}

fn parse_error(map: &JsonMap) -> Result<ErrorMessage, LatZeroError> {
    let code_raw = req_str(map, "error_code")?;
    let error_code = serde_json::from_value::<ErrorCode>(Value::String(code_raw.clone()))
        .map_err(|_| LatZeroError::Protocol(format!("unrecognized error_code '{code_raw}'")))?;
    Ok(ErrorMessage {
        correlation_id: correlation_id(map)?,
        error: req_str(map, "error")?,
        error_code,
    })
}

fn parse_memory(map: &JsonMap) -> Result<MemoryMessage, LatZeroError> {
    let operation = req_str(map, "operation")?;
    let block_id = req_str(map, "block_id")?;
    if block_id.is_empty() {
        return Err(LatZeroError::Protocol("block_id must not be empty".into()));
    }

    let op = match operation.as_str() {
        "create" => {
            let size = req_u64(map, "size")?;
            let kind = match opt_str(map, "block_type")? {
                Some(raw) => serde_json::from_value::<BlockKind>(Value::String(raw.clone()))
                    .map_err(|_| {
                        LatZeroError::Protocol(format!("unrecognized block_type '{raw}'"))
                    })?,
                None => BlockKind::default(),
            };
            let pool = opt_str(map, "pool")?;
            if let Some(p) = &pool {
                validate_pool_name(p)?;
            }
            let permissions = match map.get("permissions") {
                None | Some(Value::Null) => None,
                Some(v) => Some(serde_json::from_value::<PermissionMap>(v.clone()).map_err(
                    |e| LatZeroError::Protocol(format!("malformed permissions map: {e}")),
                )?),
            };
            MemoryOp::Create {
                name: opt_str(map, "name")?,
                pool,
                size,
                kind,
                permissions,
            }
        }
        "attach" => {
            let mode = match opt_str(map, "mode")? {
                Some(raw) => serde_json::from_value::<AttachMode>(Value::String(raw.clone()))
                    .map_err(|_| {
                        LatZeroError::Protocol(format!("unrecognized attach mode '{raw}'"))
                    })?,
                None => AttachMode::Read,
            };
            MemoryOp::Attach { mode }
        }
        "detach" => MemoryOp::Detach,
        "read" => MemoryOp::Read {
            offset: opt_u64(map, "offset")?.unwrap_or(0),
            length: opt_u64(map, "length")?,
        },
        "write" => MemoryOp::Write {
            offset: req_u64(map, "offset")?,
            data: value_to_bytes(req_field(map, "data")?, "data")?,
        },
        "cas" => MemoryOp::CompareAndSwap {
            offset: opt_u64(map, "offset")?.unwrap_or(0),
            expected: value_to_bytes(req_field(map, "expected")?, "expected")?,
            data: value_to_bytes(req_field(map, "data")?, "data")?,
        },
        "lock" => {
            let mode = match opt_str(map, "mode")? {
                Some(raw) => serde_json::from_value::<LockMode>(Value::String(raw.clone()))
                    .map_err(|_| {
                        LatZeroError::Protocol(format!("unrecognized lock mode '{raw}'"))
                    })?,
                None => LockMode::Exclusive,
            };
            MemoryOp::Lock {
                mode,
                timeout_ms: opt_u64(map, "timeout")?.unwrap_or(0),
            }
        }
        "unlock" => MemoryOp::Unlock {
            lock_id: req_uuid(map, "lock_id")?,
        },
        "remove" | "delete" => MemoryOp::Remove,
        "stat" => MemoryOp::Stat,
        other => {
            return Err(LatZeroError::Protocol(format!(
                "unrecognized memory operation '{other}'"
            )));
        }
    };

    Ok(MemoryMessage {
        id: opt_uuid(map, "id")?,
        block_id,
        op,
    })
}

fn parse_admin(map: &JsonMap) -> Result<AdminMessage, LatZeroError> {
    Ok(AdminMessage {
        id: opt_uuid(map, "id")?,
        operation: req_str(map, "operation")?,
    })
}
