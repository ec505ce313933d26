// src/core/memory/mod.rs

//! Named memory blocks: metadata, read/write/CAS primitives, advisory
//! locks, permission checks, and idle garbage collection.
//!
//! Backing storage here is a plain in-memory buffer; `persistent` blocks
//! additionally write through to a file under the data directory's
//! `memory/` folder and reload from it at startup.

pub mod block;
pub mod locks;

pub use block::{BlockMetadata, MemoryBlock};
pub use locks::{LockEntry, LockTable};

use crate::core::LatZeroError;
use crate::core::persistence::Persistence;
use crate::core::pools::PoolManager;
use crate::core::protocol::{AttachMode, BlockKind, LockMode, PermissionMap};
use crate::core::security::SecurityProvider;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notified after every successful write so attached applications can
/// observe block changes. Wired by the orchestrator.
pub trait BlockSubscriber: Send + Sync {
    fn on_block_written(
        &self,
        block_id: &str,
        pool: &str,
        version: u64,
        attached: &[String],
        writer: &str,
    );
}

/// Outcome of a compare-and-swap: on success `previous` holds the bytes
/// that were replaced, on failure the bytes currently in place.
#[derive(Debug, Clone, PartialEq)]
pub struct CasOutcome {
    pub success: bool,
    pub previous: Vec<u8>,
    pub version: u64,
}

/// Owns every live block, the advisory lock table, and the permission
/// checks in front of each operation.
pub struct MemoryManager {
    blocks: DashMap<String, Arc<MemoryBlock>>,
    locks: LockTable,
    persistence: Arc<Persistence>,
    security: Arc<dyn SecurityProvider>,
    /// Backing directory for persistent blocks; `None` in memory mode.
    memory_dir: Option<PathBuf>,
    idle_max_age: Duration,
    subscriber: OnceCell<Arc<dyn BlockSubscriber>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("blocks", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    pub fn new(
        persistence: Arc<Persistence>,
        security: Arc<dyn SecurityProvider>,
        memory_dir: Option<PathBuf>,
        idle_max_age: Duration,
    ) -> Self {
        Self {
            blocks: DashMap::new(),
            locks: LockTable::new(),
            persistence,
            security,
            memory_dir,
            idle_max_age,
            subscriber: OnceCell::new(),
        }
    }

    /// Wires the write subscriber. Called once by the orchestrator.
    pub fn set_subscriber(&self, subscriber: Arc<dyn BlockSubscriber>) {
        if self.subscriber.set(subscriber).is_err() {
            warn!("Block subscriber was already wired; ignoring replacement.");
        }
    }

    /// Rebuilds blocks from persisted metadata. Persistent blocks reload
    /// their backing file; everything else comes back zero-filled.
    pub fn load(&self) -> Result<(), LatZeroError> {
        if let Some(dir) = &self.memory_dir {
            std::fs::create_dir_all(dir)?;
        }
        let records = self.persistence.list_blocks();
        let count = records.len();
        for record in records {
            let meta = BlockMetadata::from_record(record);
            let mut data = vec![0u8; meta.size as usize];
            if meta.persistent {
                if let Some(path) = self.backing_path(&meta.block_id) {
                    match std::fs::read(&path) {
                        Ok(bytes) => {
                            let len = bytes.len().min(data.len());
                            data[..len].copy_from_slice(&bytes[..len]);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(
                                "Failed to reload backing file for '{}': {}",
                                meta.block_id, e
                            );
                        }
                    }
                }
            }
            self.blocks
                .insert(meta.block_id.clone(), Arc::new(MemoryBlock::new(meta, data)));
        }
        info!("Memory manager loaded {} blocks.", count);
        Ok(())
    }

    fn backing_path(&self, block_id: &str) -> Option<PathBuf> {
        self.memory_dir.as_ref().map(|dir| dir.join(format!("{block_id}.bin")))
    }

    fn get_block(&self, block_id: &str) -> Result<Arc<MemoryBlock>, LatZeroError> {
        self.blocks
            .get(block_id)
            .map(|b| b.clone())
            .ok_or_else(|| LatZeroError::NotFound(format!("block '{block_id}' does not exist")))
    }

    /// Permission gate run before every operation: pool membership, the
    /// block's permission map (`*` wildcard), and the security provider for
    /// encrypted pools.
    async fn check_access(
        &self,
        pools: &PoolManager,
        block: &MemoryBlock,
        app_id: &str,
        op: &str,
    ) -> Result<(), LatZeroError> {
        let (pool, encrypted, allowed) = {
            let meta = block.meta.read();
            let allowed = match meta.permissions.get(op) {
                Some(list) => list.iter().any(|a| a == "*" || a == app_id),
                // An absent entry falls back to pool membership.
                None => true,
            };
            (meta.pool.clone(), meta.encrypted, allowed)
        };
        if !pools.validate_membership(app_id, &pool) {
            return Err(LatZeroError::AccessDenied(format!(
                "'{app_id}' is not a member of pool '{pool}'"
            )));
        }
        if !allowed {
            return Err(LatZeroError::AccessDenied(format!(
                "'{app_id}' may not {op} block"
            )));
        }
        if encrypted && !self.security.check_pool_access(app_id, &pool, op).await? {
            return Err(LatZeroError::AccessDenied(format!(
                "security provider denied {op} on encrypted pool '{pool}'"
            )));
        }
        Ok(())
    }

    /// Creates a block. The backing store is allocated before the metadata
    /// is recorded, so a backing failure leaves no metadata behind.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_block(
        &self,
        pools: &PoolManager,
        origin: &str,
        block_id: &str,
        name: Option<String>,
        pool: Option<String>,
        size: u64,
        kind: BlockKind,
        permissions: Option<PermissionMap>,
    ) -> Result<Value, LatZeroError> {
        if size == 0 {
            return Err(LatZeroError::Validation("block size must be positive".into()));
        }
        if self.blocks.contains_key(block_id) {
            return Err(LatZeroError::Validation(format!(
                "block '{block_id}' already exists"
            )));
        }

        let pool = pool.unwrap_or_else(|| crate::core::pools::DEFAULT_POOL.to_string());
        let pool_meta = pools
            .get(&pool)
            .ok_or_else(|| LatZeroError::NotFound(format!("pool '{pool}' does not exist")))?;
        if !pools.validate_membership(origin, &pool) {
            return Err(LatZeroError::AccessDenied(format!(
                "'{origin}' is not a member of pool '{pool}'"
            )));
        }
        if let Some(max) = pool_meta.max_memory_blocks {
            let in_pool = self.persistence.blocks_in_pool(&pool).len() as u64;
            if in_pool >= max {
                return Err(LatZeroError::Validation(format!(
                    "pool '{pool}' is at its block limit ({max})"
                )));
            }
        }

        let encrypted = pool_meta.encrypted || kind == BlockKind::Encrypted;
        let persistent = kind == BlockKind::Persistent;
        if kind == BlockKind::Encrypted && !pool_meta.encrypted {
            return Err(LatZeroError::Validation(format!(
                "encrypted block '{block_id}' requires an encrypted pool"
            )));
        }

        let data = vec![0u8; size as usize];
        if persistent {
            let path = self.backing_path(block_id).ok_or_else(|| {
                LatZeroError::Validation(
                    "persistent blocks are unavailable in memory mode".into(),
                )
            })?;
            std::fs::write(&path, &data)?;
        }

        let now = Utc::now();
        let meta = BlockMetadata {
            block_id: block_id.to_string(),
            name: name.unwrap_or_else(|| block_id.to_string()),
            pool,
            size,
            kind,
            permissions: permissions.unwrap_or_default(),
            version: 0,
            persistent,
            encrypted,
            created_at: now,
            updated_at: now,
            attachments: indexmap::IndexMap::new(),
        };
        self.persistence.put_block(meta.to_record())?;

        let record = meta.to_record();
        self.blocks
            .insert(block_id.to_string(), Arc::new(MemoryBlock::new(meta, data)));
        debug!("Created block '{}' ({} bytes).", block_id, size);
        Ok(json!({
            "block_id": record.block_id,
            "size": record.size,
            "pool": record.pool,
            "version": record.version,
        }))
    }

    /// Attaches an app to a block. Re-attaching updates the mode.
    pub async fn attach(
        &self,
        pools: &PoolManager,
        origin: &str,
        block_id: &str,
        mode: AttachMode,
    ) -> Result<(), LatZeroError> {
        let block = self.get_block(block_id)?;
        let op = match mode {
            AttachMode::Read => "read",
            AttachMode::Write => "write",
        };
        self.check_access(pools, &block, origin, op).await?;
        block.meta.write().attachments.insert(origin.to_string(), mode);
        block.touch();
        Ok(())
    }

    /// Detaches an app from a block. Idempotent.
    pub fn detach(&self, origin: &str, block_id: &str) -> Result<(), LatZeroError> {
        let block = self.get_block(block_id)?;
        block.meta.write().attachments.shift_remove(origin);
        block.touch();
        Ok(())
    }

    /// Reads `[offset, offset+length)` from the block. `length` defaults to
    /// the remainder; a read at `offset == size` returns empty.
    pub async fn read(
        &self,
        pools: &PoolManager,
        origin: &str,
        block_id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, LatZeroError> {
        let block = self.get_block(block_id)?;
        self.check_access(pools, &block, origin, "read").await?;

        let size = block.meta.read().size;
        if offset > size {
            return Err(LatZeroError::OutOfBounds(format!(
                "read offset {offset} beyond block size {size}"
            )));
        }
        let length = length.unwrap_or(size - offset);
        if offset + length > size {
            return Err(LatZeroError::OutOfBounds(format!(
                "read of {length} bytes at {offset} exceeds block size {size}"
            )));
        }

        let slice = {
            let data = block.data.read();
            data[offset as usize..(offset + length) as usize].to_vec()
        };
        block.touch();

        let (encrypted, pool) = {
            let meta = block.meta.read();
            (meta.encrypted, meta.pool.clone())
        };
        if encrypted {
            return self.security.decrypt_block(&pool, &slice).await;
        }
        Ok(slice)
    }

    /// Writes bytes into `[offset, offset+len)`, bumps `version`, and fires
    /// the block's subscribers. A zero-byte write is a no-op that does not
    /// bump anything.
    pub async fn write(
        &self,
        pools: &PoolManager,
        origin: &str,
        block_id: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, LatZeroError> {
        let block = self.get_block(block_id)?;
        self.check_access(pools, &block, origin, "write").await?;

        let (size, encrypted, pool) = {
            let meta = block.meta.read();
            (meta.size, meta.encrypted, meta.pool.clone())
        };
        if data.is_empty() {
            return Ok(block.meta.read().version);
        }
        if offset >= size || offset + data.len() as u64 > size {
            return Err(LatZeroError::OutOfBounds(format!(
                "write of {} bytes at {offset} exceeds block size {size}",
                data.len()
            )));
        }

        let payload = if encrypted {
            self.security.encrypt_block(&pool, data).await?
        } else {
            data.to_vec()
        };

        let (version, attached) = self.apply_write(&block, offset, &payload)?;
        block.touch();

        if let Some(subscriber) = self.subscriber.get() {
            subscriber.on_block_written(block_id, &pool, version, &attached, origin);
        }
        Ok(version)
    }

    /// Applies a bounds-checked write under the block locks: durable row
    /// first, then buffer and version, so the mirror never runs ahead of
    /// the store.
    fn apply_write(
        &self,
        block: &MemoryBlock,
        offset: u64,
        payload: &[u8],
    ) -> Result<(u64, Vec<String>), LatZeroError> {
        let mut data = block.data.write();
        let mut meta = block.meta.write();

        let next_version = meta.version + 1;
        let mut record = meta.to_record();
        record.version = next_version;
        record.updated_at = Utc::now();
        self.persistence.put_block(record)?;

        data[offset as usize..offset as usize + payload.len()].copy_from_slice(payload);
        meta.version = next_version;
        meta.updated_at = Utc::now();

        if meta.persistent {
            if let Some(path) = self.backing_path(&meta.block_id) {
                if let Err(e) = std::fs::write(&path, &*data) {
                    warn!("Write-through for '{}' failed: {}", meta.block_id, e);
                }
            }
        }

        let attached = meta.attachments.keys().cloned().collect();
        Ok((next_version, attached))
    }

    /// Compare-and-swap: writes `data` at `offset` only if the bytes there
    /// equal `expected`. Returns the previous bytes on success, the current
    /// bytes on failure.
    pub async fn compare_and_swap(
        &self,
        pools: &PoolManager,
        origin: &str,
        block_id: &str,
        offset: u64,
        expected: &[u8],
        data: &[u8],
    ) -> Result<CasOutcome, LatZeroError> {
        let block = self.get_block(block_id)?;
        self.check_access(pools, &block, origin, "write").await?;

        let (size, encrypted, pool) = {
            let meta = block.meta.read();
            (meta.size, meta.encrypted, meta.pool.clone())
        };
        let span = expected.len().max(data.len()) as u64;
        if offset + span > size {
            return Err(LatZeroError::OutOfBounds(format!(
                "cas of {span} bytes at {offset} exceeds block size {size}"
            )));
        }

        let payload = if encrypted {
            self.security.encrypt_block(&pool, data).await?
        } else {
            data.to_vec()
        };

        let outcome = {
            let current = {
                let buf = block.data.read();
                buf[offset as usize..offset as usize + expected.len()].to_vec()
            };
            if current != expected {
                CasOutcome {
                    success: false,
                    previous: current,
                    version: block.meta.read().version,
                }
            } else {
                let (version, attached) = self.apply_write(&block, offset, &payload)?;
                if let Some(subscriber) = self.subscriber.get() {
                    subscriber.on_block_written(block_id, &pool, version, &attached, origin);
                }
                CasOutcome {
                    success: true,
                    previous: current,
                    version,
                }
            }
        };
        block.touch();

        if encrypted && !outcome.success {
            let previous = self.security.decrypt_block(&pool, &outcome.previous).await?;
            return Ok(CasOutcome { previous, ..outcome });
        }
        Ok(outcome)
    }

    /// Acquires an advisory lock. The returned lock id is the release
    /// capability.
    pub async fn lock(
        &self,
        pools: &PoolManager,
        origin: &str,
        block_id: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Uuid, LatZeroError> {
        let block = self.get_block(block_id)?;
        let op = match mode {
            LockMode::Read => "read",
            LockMode::Write | LockMode::Exclusive => "write",
        };
        self.check_access(pools, &block, origin, op).await?;
        block.touch();
        self.locks.acquire(block_id, origin, mode, timeout)
    }

    /// Releases a lock by id. Holder identity is not re-checked; the id is
    /// the capability.
    pub fn unlock(&self, block_id: &str, lock_id: Uuid) -> Result<(), LatZeroError> {
        if self.locks.release(block_id, lock_id) {
            Ok(())
        } else {
            Err(LatZeroError::NotFound(format!(
                "no live lock {lock_id} on block '{block_id}'"
            )))
        }
    }

    /// Removes a block. Fails while any app is attached.
    pub async fn remove_block(
        &self,
        pools: &PoolManager,
        origin: &str,
        block_id: &str,
    ) -> Result<(), LatZeroError> {
        let block = self.get_block(block_id)?;
        self.check_access(pools, &block, origin, "write").await?;
        {
            let meta = block.meta.read();
            if !meta.attachments.is_empty() {
                return Err(LatZeroError::Validation(format!(
                    "block '{block_id}' still has {} attachments",
                    meta.attachments.len()
                )));
            }
        }
        self.persistence.delete_block(block_id)?;
        self.blocks.remove(block_id);
        self.locks.clear(block_id);
        if let Some(path) = self.backing_path(block_id) {
            let _ = std::fs::remove_file(path);
        }
        debug!("Removed block '{}'.", block_id);
        Ok(())
    }

    /// Introspection snapshot of a block.
    pub fn stat(&self, block_id: &str) -> Result<Value, LatZeroError> {
        let block = self.get_block(block_id)?;
        let meta = block.meta.read();
        Ok(json!({
            "block_id": meta.block_id,
            "name": meta.name,
            "pool": meta.pool,
            "size": meta.size,
            "type": meta.kind,
            "version": meta.version,
            "persistent": meta.persistent,
            "encrypted": meta.encrypted,
            "created_at": meta.created_at.to_rfc3339(),
            "updated_at": meta.updated_at.to_rfc3339(),
            "attachments": meta.attachments.keys().collect::<Vec<_>>(),
            "locks": self.locks.held(&meta.block_id).len(),
        }))
    }

    pub fn list(&self) -> Vec<Value> {
        self.blocks
            .iter()
            .filter_map(|entry| self.stat(entry.key()).ok())
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Garbage-collects idle, non-persistent blocks with zero attachments
    /// past the idle max age, and reaps expired locks. Returns the number of
    /// blocks removed.
    pub fn collect_idle_blocks(&self) -> usize {
        let reaped_locks = self.locks.purge_expired();
        if reaped_locks > 0 {
            debug!("Reaped {} expired block locks.", reaped_locks);
        }

        let idle: Vec<String> = self
            .blocks
            .iter()
            .filter(|entry| {
                let block = entry.value();
                let meta = block.meta.read();
                !meta.persistent
                    && meta.attachments.is_empty()
                    && block.idle_for() >= self.idle_max_age
            })
            .map(|entry| entry.key().clone())
            .collect();

        for block_id in &idle {
            if let Err(e) = self.persistence.delete_block(block_id) {
                warn!("Failed to delete idle block '{}': {}", block_id, e);
                continue;
            }
            self.blocks.remove(block_id);
            self.locks.clear(block_id);
            info!("Garbage-collected idle block '{}'.", block_id);
        }
        idle.len()
    }
}
