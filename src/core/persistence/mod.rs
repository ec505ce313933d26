// src/core/persistence/mod.rs

//! Durable metadata storage for apps, pools, and memory blocks, plus the
//! ephemeral table of in-flight trigger rows.
//!
//! The service layers hold the authoritative runtime mirrors; every mutation
//! funnels through here first, so a failed write never leaves a mirror ahead
//! of the durable state.

pub mod backup;
pub mod records;
pub mod store;

pub use records::{AppRecord, BlockRecord, PoolKind, PoolRecord, TriggerRow};
pub use store::{Store, Tables, WalOp};

use crate::core::LatZeroError;
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The persistence facade handed to every component.
#[derive(Debug)]
pub struct Persistence {
    store: Store,
    /// Ephemeral mirror of in-flight trigger records for introspection.
    trigger_rows: DashMap<Uuid, TriggerRow>,
    backups_dir: Option<PathBuf>,
    max_backups: usize,
}

impl Persistence {
    /// Opens the durable store under `data_dir`. With `memory_mode` the
    /// durable side collapses to an in-memory table and nothing touches disk.
    pub fn open(
        data_dir: &Path,
        memory_mode: bool,
        max_backups: usize,
    ) -> Result<Self, LatZeroError> {
        let (store, backups_dir) = if memory_mode {
            (Store::in_memory(), None)
        } else {
            (Store::open(data_dir)?, Some(data_dir.join("backups")))
        };
        Ok(Self {
            store,
            trigger_rows: DashMap::new(),
            backups_dir,
            max_backups,
        })
    }

    // --- Apps --------------------------------------------------------------

    pub fn put_app(&self, mut row: AppRecord) -> Result<(), LatZeroError> {
        row.updated_at = Utc::now();
        self.store.mutate(WalOp::PutApp { row })
    }

    pub fn get_app(&self, app_id: &str) -> Option<AppRecord> {
        self.store.read(|t| t.apps.get(app_id).cloned())
    }

    pub fn delete_app(&self, app_id: &str) -> Result<(), LatZeroError> {
        self.store.mutate(WalOp::DeleteApp {
            app_id: app_id.to_string(),
        })
    }

    pub fn list_apps(&self) -> Vec<AppRecord> {
        self.store.read(|t| t.apps.values().cloned().collect())
    }

    pub fn apps_in_pool(&self, pool: &str) -> Vec<AppRecord> {
        self.store.read(|t| {
            t.apps
                .values()
                .filter(|a| a.pools.iter().any(|p| p == pool))
                .cloned()
                .collect()
        })
    }

    // --- Pools -------------------------------------------------------------

    pub fn put_pool(&self, mut row: PoolRecord) -> Result<(), LatZeroError> {
        row.updated_at = Utc::now();
        self.store.mutate(WalOp::PutPool { row })
    }

    pub fn get_pool(&self, name: &str) -> Option<PoolRecord> {
        self.store.read(|t| t.pools.get(name).cloned())
    }

    pub fn delete_pool(&self, name: &str) -> Result<(), LatZeroError> {
        self.store.mutate(WalOp::DeletePool {
            name: name.to_string(),
        })
    }

    pub fn list_pools(&self) -> Vec<PoolRecord> {
        self.store.read(|t| t.pools.values().cloned().collect())
    }

    // --- Memory blocks -----------------------------------------------------

    pub fn put_block(&self, mut row: BlockRecord) -> Result<(), LatZeroError> {
        row.updated_at = Utc::now();
        self.store.mutate(WalOp::PutBlock { row })
    }

    pub fn get_block(&self, block_id: &str) -> Option<BlockRecord> {
        self.store.read(|t| t.blocks.get(block_id).cloned())
    }

    pub fn delete_block(&self, block_id: &str) -> Result<(), LatZeroError> {
        self.store.mutate(WalOp::DeleteBlock {
            block_id: block_id.to_string(),
        })
    }

    pub fn list_blocks(&self) -> Vec<BlockRecord> {
        self.store.read(|t| t.blocks.values().cloned().collect())
    }

    pub fn blocks_in_pool(&self, pool: &str) -> Vec<BlockRecord> {
        self.store.read(|t| {
            t.blocks
                .values()
                .filter(|b| b.pool == pool)
                .cloned()
                .collect()
        })
    }

    pub fn blocks_by_kind(&self, kind: crate::core::protocol::BlockKind) -> Vec<BlockRecord> {
        self.store.read(|t| {
            t.blocks
                .values()
                .filter(|b| b.kind == kind)
                .cloned()
                .collect()
        })
    }

    // --- Server config -----------------------------------------------------

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<(), LatZeroError> {
        self.store.mutate(WalOp::SetConfig {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn get_config_value(&self, key: &str) -> Option<String> {
        self.store.read(|t| t.server_config.get(key).cloned())
    }

    // --- Transactions ------------------------------------------------------

    /// Runs a closure collecting mutations applied atomically: either every
    /// op is logged and applied, or none are.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Tables, &mut Vec<WalOp>) -> Result<T, LatZeroError>,
    ) -> Result<T, LatZeroError> {
        self.store.transaction(f)
    }

    // --- Ephemeral trigger rows --------------------------------------------

    pub fn put_trigger_row(&self, row: TriggerRow) {
        self.trigger_rows.insert(row.id, row);
    }

    pub fn update_trigger_row_state(&self, id: Uuid, state: &str) {
        if let Some(mut row) = self.trigger_rows.get_mut(&id) {
            row.state = state.to_string();
        }
    }

    pub fn remove_trigger_row(&self, id: Uuid) {
        self.trigger_rows.remove(&id);
    }

    pub fn list_trigger_rows(&self) -> Vec<TriggerRow> {
        self.trigger_rows
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    // --- Snapshot / backup -------------------------------------------------

    /// Rewrites the snapshot and truncates the WAL. A no-op in memory mode.
    pub fn snapshot(&self) -> Result<(), LatZeroError> {
        self.store.snapshot()
    }

    /// Produces a timestamped backup of the durable store, pruning retention
    /// beyond `max_backups`. Returns the backup path, or `None` in memory
    /// mode.
    pub fn backup(&self) -> Result<Option<PathBuf>, LatZeroError> {
        let (Some(backups_dir), Some(snapshot_path)) =
            (&self.backups_dir, self.store.snapshot_path())
        else {
            return Ok(None);
        };
        // Fold any WAL tail into the snapshot so the backup is complete.
        self.store.snapshot()?;
        backup::create_backup(&snapshot_path, backups_dir, self.max_backups).map(Some)
    }
}
