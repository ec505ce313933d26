// src/core/memory/locks.rs

//! Advisory, non-queued block locks with caller-supplied timeouts.
//!
//! Acquisition fails immediately when a conflicting lock is held; nothing
//! waits. Expired locks are purged lazily on every acquisition and by the
//! periodic reaper.

use crate::core::LatZeroError;
use crate::core::protocol::LockMode;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A held advisory lock. The `lock_id` is the release capability.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub lock_id: Uuid,
    pub holder: String,
    pub mode: LockMode,
    pub expires_at: Instant,
}

/// Conflict matrix: `read` conflicts only with `exclusive`; `write`
/// conflicts with `write` and `exclusive`; `exclusive` conflicts with all.
fn conflicts(held: LockMode, requested: LockMode) -> bool {
    match (held, requested) {
        (LockMode::Exclusive, _) | (_, LockMode::Exclusive) => true,
        (LockMode::Write, LockMode::Write) => true,
        (LockMode::Read, _) | (_, LockMode::Read) => false,
    }
}

/// All advisory locks, keyed by block id.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<String, Vec<LockEntry>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to acquire a lock on `block_id`. Returns the lock id on
    /// success; fails without queuing when a live conflicting lock exists.
    pub fn acquire(
        &self,
        block_id: &str,
        holder: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Uuid, LatZeroError> {
        let now = Instant::now();
        let mut entry = self.locks.entry(block_id.to_string()).or_default();
        entry.retain(|lock| lock.expires_at > now);

        if let Some(conflicting) = entry.iter().find(|lock| conflicts(lock.mode, mode)) {
            return Err(LatZeroError::Locking(format!(
                "block '{block_id}' is locked in {:?} mode by '{}'",
                conflicting.mode, conflicting.holder
            )));
        }

        let lock_id = Uuid::new_v4();
        entry.push(LockEntry {
            lock_id,
            holder: holder.to_string(),
            mode,
            expires_at: now + timeout,
        });
        Ok(lock_id)
    }

    /// Releases a lock by its id. Returns false when no live lock matches
    /// (already released or expired).
    pub fn release(&self, block_id: &str, lock_id: Uuid) -> bool {
        let Some(mut entry) = self.locks.get_mut(block_id) else {
            return false;
        };
        let now = Instant::now();
        entry.retain(|lock| lock.expires_at > now);
        let before = entry.len();
        entry.retain(|lock| lock.lock_id != lock_id);
        before != entry.len()
    }

    /// Drops every lock on a block (used when the block is removed).
    pub fn clear(&self, block_id: &str) {
        self.locks.remove(block_id);
    }

    /// Purges expired locks everywhere. Returns how many were reaped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for mut entry in self.locks.iter_mut() {
            let before = entry.len();
            entry.retain(|lock| lock.expires_at > now);
            reaped += before - entry.len();
        }
        self.locks.retain(|_, locks| !locks.is_empty());
        reaped
    }

    /// Live locks currently held on a block.
    pub fn held(&self, block_id: &str) -> Vec<LockEntry> {
        let now = Instant::now();
        self.locks
            .get(block_id)
            .map(|locks| {
                locks
                    .iter()
                    .filter(|lock| lock.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
