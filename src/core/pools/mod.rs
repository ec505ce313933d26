// src/core/pools/mod.rs

//! Pool lifecycle, the bidirectional app-to-pool membership index, and
//! pool-scoped access policy checks.

pub mod pool;

pub use pool::{DEFAULT_POOL, Pool, PoolUpdate, SENTINEL_POOLS};

use crate::core::LatZeroError;
use crate::core::persistence::{Persistence, PoolKind};
use crate::core::protocol::JsonMap;
use crate::core::protocol::validate::validate_pool_name;
use crate::core::security::SecurityProvider;
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexSet;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Owns pool metadata and enforces pool-scoped access policies.
#[derive(Debug)]
pub struct PoolManager {
    pools: DashMap<String, Pool>,
    /// The reverse side of the membership index: app id to the pools it is
    /// currently joined to. Both sides are updated together.
    app_pools: DashMap<String, IndexSet<String>>,
    persistence: Arc<Persistence>,
    security: Arc<dyn SecurityProvider>,
}

impl PoolManager {
    pub fn new(persistence: Arc<Persistence>, security: Arc<dyn SecurityProvider>) -> Self {
        Self {
            pools: DashMap::new(),
            app_pools: DashMap::new(),
            persistence,
            security,
        }
    }

    /// Rehydrates all pools from the durable store and re-creates missing
    /// sentinel pools.
    pub async fn load(&self) -> Result<(), LatZeroError> {
        for record in self.persistence.list_pools() {
            let name = record.name.clone();
            self.pools.insert(name, Pool::from_record(record));
        }
        for sentinel in SENTINEL_POOLS {
            if !self.pools.contains_key(sentinel) {
                info!("Creating missing sentinel pool '{}'.", sentinel);
                self.create(sentinel, PoolKind::Local, false, JsonMap::new())
                    .await?;
            }
        }
        info!("Pool manager loaded {} pools.", self.pools.len());
        Ok(())
    }

    /// Creates a pool. Fails if the name is taken or the kind/encrypted
    /// combination is inconsistent.
    pub async fn create(
        &self,
        name: &str,
        kind: PoolKind,
        encrypted: bool,
        properties: JsonMap,
    ) -> Result<(), LatZeroError> {
        validate_pool_name(name)?;
        if self.pools.contains_key(name) {
            return Err(LatZeroError::Validation(format!(
                "pool '{name}' already exists"
            )));
        }

        let pool = Pool::new(name.to_string(), kind, encrypted, properties)?;
        if pool.encrypted {
            // Encrypted pools carry a key-material record from the moment
            // they exist.
            let key_ref = self.security.prepare_encrypted_pool(name).await?;
            self.persistence
                .set_config_value(&format!("pool_key.{name}"), &key_ref)?;
        }

        self.persistence.put_pool(pool.to_record())?;
        self.pools.insert(name.to_string(), pool);
        Ok(())
    }

    /// Applies a partial update. Sentinel pools refuse updates to their
    /// frozen fields (kind, encrypted).
    pub fn update(&self, name: &str, update: PoolUpdate) -> Result<(), LatZeroError> {
        let mut entry = self
            .pools
            .get_mut(name)
            .ok_or_else(|| LatZeroError::NotFound(format!("pool '{name}' does not exist")))?;

        if entry.is_sentinel() && update.touches_frozen_fields() {
            return Err(LatZeroError::AccessDenied(format!(
                "sentinel pool '{name}' cannot change type"
            )));
        }

        if let Some(kind) = update.kind {
            entry.kind = kind;
            entry.encrypted = kind == PoolKind::Encrypted;
        }
        if let Some(encrypted) = update.encrypted {
            if encrypted && entry.kind != PoolKind::Encrypted {
                return Err(LatZeroError::Validation(format!(
                    "pool '{name}': encrypted flag requires the encrypted pool type"
                )));
            }
            entry.encrypted = encrypted;
        }
        if let Some(owners) = update.owners {
            entry.owners = owners;
        }
        if let Some(policies) = update.policies {
            entry.policies = policies;
        }
        if let Some(properties) = update.properties {
            entry.properties = properties;
        }
        if let Some(max_blocks) = update.max_memory_blocks {
            entry.max_memory_blocks = max_blocks;
        }
        if let Some(max_triggers) = update.max_triggers {
            entry.max_triggers = max_triggers;
        }
        entry.updated_at = Utc::now();
        self.persistence.put_pool(entry.to_record())
    }

    /// Removes a pool. Sentinels and non-empty pools refuse removal.
    pub fn remove(&self, name: &str) -> Result<(), LatZeroError> {
        {
            let pool = self
                .pools
                .get(name)
                .ok_or_else(|| LatZeroError::NotFound(format!("pool '{name}' does not exist")))?;
            if pool.is_sentinel() {
                return Err(LatZeroError::AccessDenied(format!(
                    "sentinel pool '{name}' cannot be removed"
                )));
            }
            if !pool.members.is_empty() {
                return Err(LatZeroError::Validation(format!(
                    "pool '{name}' still has {} members",
                    pool.members.len()
                )));
            }
        }
        self.persistence.delete_pool(name)?;
        self.pools.remove(name);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Pool> {
        self.pools.get(name).map(|p| p.clone())
    }

    pub fn list(&self) -> Vec<Pool> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Adds an app to a pool, maintaining both directions of the index.
    /// Idempotent; the pool must exist.
    pub fn add_app_to_pool(&self, app_id: &str, pool: &str) -> Result<(), LatZeroError> {
        {
            let mut entry = self
                .pools
                .get_mut(pool)
                .ok_or_else(|| LatZeroError::NotFound(format!("pool '{pool}' does not exist")))?;
            entry.members.insert(app_id.to_string());
        }
        self.app_pools
            .entry(app_id.to_string())
            .or_default()
            .insert(pool.to_string());
        debug!("App '{}' joined pool '{}'.", app_id, pool);
        Ok(())
    }

    /// Removes an app from a pool, maintaining both directions. Idempotent.
    pub fn remove_app_from_pool(&self, app_id: &str, pool: &str) {
        if let Some(mut entry) = self.pools.get_mut(pool) {
            entry.members.shift_remove(app_id);
        }
        let emptied = if let Some(mut pools) = self.app_pools.get_mut(app_id) {
            pools.shift_remove(pool);
            pools.is_empty()
        } else {
            false
        };
        if emptied {
            self.app_pools.remove(app_id);
        }
    }

    /// The bound members of a pool, in join order.
    pub fn members(&self, pool: &str) -> Vec<String> {
        self.pools
            .get(pool)
            .map(|p| p.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The pools a bound app currently belongs to.
    pub fn pools_of_app(&self, app_id: &str) -> Vec<String> {
        self.app_pools
            .get(app_id)
            .map(|pools| pools.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn validate_membership(&self, app_id: &str, pool: &str) -> bool {
        self.pools
            .get(pool)
            .map(|p| p.members.contains(app_id))
            .unwrap_or(false)
    }

    /// True if the two apps share at least one pool.
    pub fn share_a_pool(&self, a: &str, b: &str) -> bool {
        let Some(pools_a) = self.app_pools.get(a) else {
            return false;
        };
        pools_a
            .iter()
            .any(|pool| self.validate_membership(b, pool))
    }

    pub fn get_property(&self, pool: &str, key: &str) -> Option<Value> {
        self.pools
            .get(pool)
            .and_then(|p| p.properties.get(key).cloned())
    }

    pub fn set_property(&self, pool: &str, key: &str, value: Value) -> Result<(), LatZeroError> {
        let mut entry = self
            .pools
            .get_mut(pool)
            .ok_or_else(|| LatZeroError::NotFound(format!("pool '{pool}' does not exist")))?;
        entry.properties.insert(key.to_string(), value);
        entry.updated_at = Utc::now();
        self.persistence.put_pool(entry.to_record())
    }

    /// Access check for a pool-scoped operation.
    ///
    /// Encrypted pools defer to the security provider. Otherwise the policy
    /// map decides: an entry for the operation grants access to the listed
    /// apps (`*` meaning any), and absence of an entry falls back to plain
    /// membership.
    pub async fn check_access(
        &self,
        app_id: &str,
        pool: &str,
        op: &str,
    ) -> Result<bool, LatZeroError> {
        let (encrypted, allowed) = {
            let entry = self
                .pools
                .get(pool)
                .ok_or_else(|| LatZeroError::NotFound(format!("pool '{pool}' does not exist")))?;
            if entry.encrypted {
                (true, false)
            } else {
                let allowed = match entry.policies.get(op) {
                    Some(list) => list.iter().any(|a| a == "*" || a == app_id),
                    None => entry.members.contains(app_id),
                };
                (false, allowed)
            }
        };
        if encrypted {
            return self.security.check_pool_access(app_id, pool, op).await;
        }
        Ok(allowed)
    }
}
