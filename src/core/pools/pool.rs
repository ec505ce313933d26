// src/core/pools/pool.rs

//! In-memory pool state and the updates applied to it.

use crate::core::LatZeroError;
use crate::core::persistence::{PoolKind, PoolRecord};
use crate::core::protocol::{JsonMap, PermissionMap};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;

/// The two pre-created pools that always exist and cannot be deleted.
pub const SENTINEL_POOLS: [&str; 2] = ["default", "system"];

/// The name of the pool used when a message does not specify one.
pub const DEFAULT_POOL: &str = "default";

/// Runtime state of a pool. Membership tracks currently bound applications
/// only; it is rebuilt as apps connect, not loaded from disk.
#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    pub kind: PoolKind,
    pub encrypted: bool,
    pub owners: IndexSet<String>,
    pub policies: PermissionMap,
    pub properties: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub max_memory_blocks: Option<u64>,
    pub max_triggers: Option<u64>,
    pub members: IndexSet<String>,
}

impl Pool {
    /// Builds a fresh pool, enforcing kind/encrypted consistency.
    pub fn new(
        name: String,
        kind: PoolKind,
        encrypted: bool,
        properties: JsonMap,
    ) -> Result<Self, LatZeroError> {
        // `encrypted` is implied by the kind; a contradictory combination is
        // a caller error, not something to silently repair both ways.
        if encrypted && kind != PoolKind::Encrypted {
            return Err(LatZeroError::Validation(format!(
                "pool '{name}': encrypted flag requires the encrypted pool type"
            )));
        }
        let encrypted = encrypted || kind == PoolKind::Encrypted;
        let now = Utc::now();
        Ok(Self {
            name,
            kind,
            encrypted,
            owners: IndexSet::new(),
            policies: PermissionMap::new(),
            properties,
            created_at: now,
            updated_at: now,
            max_memory_blocks: None,
            max_triggers: None,
            members: IndexSet::new(),
        })
    }

    pub fn is_sentinel(&self) -> bool {
        SENTINEL_POOLS.contains(&self.name.as_str())
    }

    pub fn to_record(&self) -> PoolRecord {
        PoolRecord {
            name: self.name.clone(),
            kind: self.kind,
            encrypted: self.encrypted,
            owners: self.owners.iter().cloned().collect(),
            policies: self.policies.clone(),
            properties: self.properties.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            max_memory_blocks: self.max_memory_blocks,
            max_triggers: self.max_triggers,
        }
    }

    pub fn from_record(record: PoolRecord) -> Self {
        Self {
            name: record.name,
            kind: record.kind,
            encrypted: record.encrypted,
            owners: record.owners.into_iter().collect(),
            policies: record.policies,
            properties: record.properties,
            created_at: record.created_at,
            updated_at: record.updated_at,
            max_memory_blocks: record.max_memory_blocks,
            max_triggers: record.max_triggers,
            members: IndexSet::new(),
        }
    }
}

/// A partial update applied to an existing pool.
#[derive(Debug, Clone, Default)]
pub struct PoolUpdate {
    pub kind: Option<PoolKind>,
    pub encrypted: Option<bool>,
    pub owners: Option<IndexSet<String>>,
    pub policies: Option<PermissionMap>,
    pub properties: Option<JsonMap>,
    pub max_memory_blocks: Option<Option<u64>>,
    pub max_triggers: Option<Option<u64>>,
}

impl PoolUpdate {
    /// True if the update touches fields that are frozen on sentinel pools.
    pub fn touches_frozen_fields(&self) -> bool {
        self.kind.is_some() || self.encrypted.is_some()
    }
}
