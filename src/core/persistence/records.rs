// src/core/persistence/records.rs

//! On-disk row types. Persistence exclusively owns these shapes; the
//! service layers hold richer in-memory mirrors and convert at the edge.

use crate::core::protocol::{BlockKind, JsonMap, PermissionMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Durable registration row for an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub app_id: String,
    pub pools: Vec<String>,
    pub triggers: Vec<String>,
    #[serde(default)]
    pub metadata: JsonMap,
    pub protocol_version: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pool categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    #[default]
    Local,
    Global,
    Encrypted,
}

/// Durable row for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub kind: PoolKind,
    pub encrypted: bool,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub policies: PermissionMap,
    #[serde(default)]
    pub properties: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub max_memory_blocks: Option<u64>,
    #[serde(default)]
    pub max_triggers: Option<u64>,
}

/// Durable row for a memory block's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_id: String,
    pub name: String,
    pub pool: String,
    pub size: u64,
    pub kind: BlockKind,
    #[serde(default)]
    pub permissions: PermissionMap,
    pub version: u64,
    pub persistent: bool,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ephemeral mirror of an in-flight trigger record, kept for introspection
/// and debugging. Never replayed on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRow {
    pub id: Uuid,
    pub origin_app_id: String,
    pub destination_app_id: Option<String>,
    pub pool: String,
    pub trigger_name: String,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub dispatched_to: Option<String>,
    pub state: String,
}

impl TriggerRow {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
