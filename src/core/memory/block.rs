// src/core/memory/block.rs

//! In-memory representation of a named memory block: metadata plus its
//! backing buffer.

use crate::core::persistence::BlockRecord;
use crate::core::protocol::{AttachMode, BlockKind, PermissionMap};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::time::Instant;

/// Mutable metadata of a block. `version` increments on every successful
/// write and never goes backwards.
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    pub block_id: String,
    pub name: String,
    pub pool: String,
    pub size: u64,
    pub kind: BlockKind,
    pub permissions: PermissionMap,
    pub version: u64,
    pub persistent: bool,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// AppIDs currently attached, with their attachment mode.
    pub attachments: IndexMap<String, AttachMode>,
}

impl BlockMetadata {
    pub fn to_record(&self) -> BlockRecord {
        BlockRecord {
            block_id: self.block_id.clone(),
            name: self.name.clone(),
            pool: self.pool.clone(),
            size: self.size,
            kind: self.kind,
            permissions: self.permissions.clone(),
            version: self.version,
            persistent: self.persistent,
            encrypted: self.encrypted,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn from_record(record: BlockRecord) -> Self {
        Self {
            block_id: record.block_id,
            name: record.name,
            pool: record.pool,
            size: record.size,
            kind: record.kind,
            permissions: record.permissions,
            version: record.version,
            persistent: record.persistent,
            encrypted: record.encrypted,
            created_at: record.created_at,
            updated_at: record.updated_at,
            attachments: IndexMap::new(),
        }
    }
}

/// A block and its backing buffer. The buffer length always equals the
/// metadata `size`.
#[derive(Debug)]
pub struct MemoryBlock {
    pub meta: RwLock<BlockMetadata>,
    pub data: RwLock<Vec<u8>>,
    /// Updated on every access; drives idle garbage collection.
    pub last_accessed: RwLock<Instant>,
}

impl MemoryBlock {
    pub fn new(meta: BlockMetadata, data: Vec<u8>) -> Self {
        Self {
            meta: RwLock::new(meta),
            data: RwLock::new(data),
            last_accessed: RwLock::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_accessed.write() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_accessed.read().elapsed()
    }
}
