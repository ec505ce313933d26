// src/core/registry/mod.rs

//! The live map of AppID to registration, the trigger-name index, handshake
//! processing with rehydration, and orderly disconnection handling.
//!
//! A per-AppID async mutex serializes handshake, update, and disconnect for
//! the same app, so that app's registration changes are linearizable with
//! respect to its own operations.

pub mod registration;

pub use registration::{AppRegistration, CachedRegistration};

use crate::core::LatZeroError;
use crate::core::persistence::Persistence;
use crate::core::pools::{DEFAULT_POOL, PoolManager};
use crate::core::persistence::PoolKind;
use crate::core::protocol::{
    AssignedFields, HandshakeAck, HandshakeMessage, PROTOCOL_VERSION,
};
use crate::core::state::ConnectionMap;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Map as JsonMapInner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The narrow interface through which interested components learn that a
/// bound application went away.
pub trait DisconnectListener: Send + Sync {
    fn on_app_disconnected(&self, app_id: &str, session_id: u64);
}

/// Maintains registrations, the trigger index, and the rehydration cache.
pub struct AppRegistry {
    /// Live registrations, keyed by AppID.
    apps: DashMap<String, AppRegistration>,
    /// Session id to the AppID bound on that connection.
    session_bindings: DashMap<u64, String>,
    /// Trigger name to the AppIDs that handle it, in registration order.
    trigger_index: DashMap<String, Vec<String>>,
    /// Offline registrations awaiting rehydration, keyed by AppID.
    rehydration: DashMap<String, CachedRegistration>,
    /// Per-AppID critical section for handshake/update/disconnect.
    app_locks: DashMap<String, Arc<Mutex<()>>>,
    persistence: Arc<Persistence>,
    pools: Arc<PoolManager>,
    connections: Arc<ConnectionMap>,
    disconnect_listener: OnceCell<Arc<dyn DisconnectListener>>,
    rehydration_ttl: Duration,
}

impl std::fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRegistry")
            .field("apps", &self.apps.len())
            .field("rehydration", &self.rehydration.len())
            .finish_non_exhaustive()
    }
}

impl AppRegistry {
    pub fn new(
        persistence: Arc<Persistence>,
        pools: Arc<PoolManager>,
        connections: Arc<ConnectionMap>,
        rehydration_ttl: Duration,
    ) -> Self {
        Self {
            apps: DashMap::new(),
            session_bindings: DashMap::new(),
            trigger_index: DashMap::new(),
            rehydration: DashMap::new(),
            app_locks: DashMap::new(),
            persistence,
            pools,
            connections,
            disconnect_listener: OnceCell::new(),
            rehydration_ttl,
        }
    }

    /// Wires the disconnect listener. Called once by the orchestrator.
    pub fn set_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) {
        if self.disconnect_listener.set(listener).is_err() {
            warn!("Disconnect listener was already wired; ignoring replacement.");
        }
    }

    /// Populates the rehydration cache from the durable store. All apps are
    /// offline at startup, so every persisted registration starts cached.
    pub fn load(&self) {
        let records = self.persistence.list_apps();
        let count = records.len();
        for record in records {
            self.rehydration
                .insert(record.app_id.clone(), CachedRegistration::from_record(&record));
        }
        info!("App registry loaded {} cached registrations.", count);
    }

    fn app_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        self.app_locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Processes a `handshake` for the given session and returns the ack.
    ///
    /// A handshake with triggers present (or from an AppID with no cached
    /// state) is a full registration; an empty handshake from a known AppID
    /// restores the cached pools/triggers/metadata instead. A repeat
    /// handshake from an already-bound connection is an in-place update.
    pub async fn handshake(
        &self,
        session_id: u64,
        msg: HandshakeMessage,
    ) -> Result<HandshakeAck, LatZeroError> {
        let app_id = msg.app_id.clone();
        let lock = self.app_lock(&app_id);
        let _guard = lock.lock().await;

        // A session already bound to a different AppID cannot re-handshake
        // as someone else.
        if let Some(bound) = self.session_bindings.get(&session_id) {
            if *bound != app_id {
                return Err(LatZeroError::Handshake(format!(
                    "connection is already bound to '{}'",
                    *bound
                )));
            }
        }

        // Newer handshake wins: a live binding for this AppID on another
        // connection is evicted before the new one is installed, so at most
        // one bound connection per AppID ever exists.
        if let Some(existing) = self.apps.get(&app_id) {
            let old_session = existing.session_id;
            drop(existing);
            if old_session != session_id {
                info!(
                    "AppID '{}' re-registered from session {}; evicting session {}.",
                    app_id, session_id, old_session
                );
                if let Some(handle) = self.connections.get(&old_session) {
                    handle.kill();
                }
                self.session_bindings.remove(&old_session);
            }
        }

        let cached = if msg.triggers.is_empty() {
            self.rehydration.get(&app_id).map(|c| c.clone())
        } else {
            None
        };

        let now = Utc::now();
        let registration = if let Some(cached) = cached {
            debug!("Rehydrating registration for '{}'.", app_id);
            AppRegistration {
                app_id: app_id.clone(),
                pools: cached.pools,
                triggers: cached.triggers,
                metadata: if msg.metadata.is_empty() {
                    cached.metadata
                } else {
                    msg.metadata
                },
                protocol_version: msg
                    .protocol_version
                    .unwrap_or(cached.protocol_version),
                registered_at: cached.registered_at,
                last_seen_at: now,
                rehydrated: true,
                session_id,
            }
        } else {
            let mut pools: indexmap::IndexSet<String> = msg.pools.iter().cloned().collect();
            if pools.is_empty() {
                // Every app belongs somewhere; an empty list means the
                // default pool.
                pools.insert(DEFAULT_POOL.to_string());
            }
            AppRegistration {
                app_id: app_id.clone(),
                pools,
                triggers: msg.triggers.iter().cloned().collect(),
                metadata: msg.metadata,
                protocol_version: msg
                    .protocol_version
                    .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
                registered_at: self
                    .apps
                    .get(&app_id)
                    .map(|r| r.registered_at)
                    .unwrap_or(now),
                last_seen_at: now,
                rehydrated: false,
                session_id,
            }
        };

        // Pools named in a handshake are created implicitly when absent.
        for pool in registration.pools.clone() {
            if !self.pools.exists(&pool) {
                self.pools
                    .create(&pool, PoolKind::Local, false, JsonMapInner::new())
                    .await
                    .map_err(|e| LatZeroError::Handshake(e.to_string()))?;
            }
        }

        // Durability first: the in-memory mirror must not run ahead of the
        // store when the write fails.
        self.persistence.put_app(registration.to_record())?;

        // Replacing a prior registration for the same AppID drops its old
        // trigger-index entries and pool memberships before the new ones go
        // in.
        if let Some((_, previous)) = self.apps.remove(&app_id) {
            self.remove_index_entries(&previous);
        }

        for trigger in &registration.triggers {
            self.index_trigger(trigger, &app_id);
        }
        for pool in &registration.pools {
            self.pools.add_app_to_pool(&app_id, pool)?;
        }

        let assigned = AssignedFields {
            app_id: app_id.clone(),
            pools: registration.pools.iter().cloned().collect(),
            triggers: registration.triggers.iter().cloned().collect(),
            rehydrated: registration.rehydrated,
        };

        self.session_bindings.insert(session_id, app_id.clone());
        self.rehydration.remove(&app_id);
        self.apps.insert(app_id, registration);

        let ack_id = Uuid::new_v4();
        Ok(HandshakeAck {
            id: ack_id,
            // A handshake without an id still gets a correlated ack.
            correlation_id: Some(msg.id.unwrap_or(ack_id)),
            status: "success".to_string(),
            assigned,
        })
    }

    fn index_trigger(&self, trigger: &str, app_id: &str) {
        let mut entry = self.trigger_index.entry(trigger.to_string()).or_default();
        if !entry.iter().any(|a| a == app_id) {
            entry.push(app_id.to_string());
        }
    }

    fn remove_index_entries(&self, registration: &AppRegistration) {
        for trigger in &registration.triggers {
            let emptied = if let Some(mut entry) = self.trigger_index.get_mut(trigger) {
                entry.retain(|a| a != &registration.app_id);
                entry.is_empty()
            } else {
                false
            };
            if emptied {
                self.trigger_index.remove(trigger);
            }
        }
        for pool in &registration.pools {
            self.pools.remove_app_from_pool(&registration.app_id, pool);
        }
    }

    /// Registers an additional trigger for a bound app.
    pub fn add_trigger(&self, app_id: &str, trigger: &str) -> Result<(), LatZeroError> {
        let mut registration = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| LatZeroError::NotFound(format!("app '{app_id}' is not bound")))?;
        if registration.triggers.insert(trigger.to_string()) {
            self.persistence.put_app(registration.to_record())?;
            self.index_trigger(trigger, app_id);
        }
        Ok(())
    }

    /// Deregisters a trigger from a bound app.
    pub fn remove_trigger(&self, app_id: &str, trigger: &str) -> Result<(), LatZeroError> {
        let mut registration = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| LatZeroError::NotFound(format!("app '{app_id}' is not bound")))?;
        if registration.triggers.shift_remove(trigger) {
            self.persistence.put_app(registration.to_record())?;
            let emptied = if let Some(mut entry) = self.trigger_index.get_mut(trigger) {
                entry.retain(|a| a != app_id);
                entry.is_empty()
            } else {
                false
            };
            if emptied {
                self.trigger_index.remove(trigger);
            }
        }
        Ok(())
    }

    /// Handles a connection closing: retains the registration in the
    /// rehydration cache, clears the indexes, and notifies the disconnect
    /// listener so in-flight records anchored on this app fail.
    pub async fn handle_disconnect(&self, session_id: u64) {
        let Some((_, app_id)) = self.session_bindings.remove(&session_id) else {
            return;
        };
        let lock = self.app_lock(&app_id);
        let _guard = lock.lock().await;

        let Some((_, mut registration)) = self.apps.remove(&app_id) else {
            return;
        };
        // The binding may have been replaced by a newer connection while we
        // awaited the lock; leave the newer registration alone.
        if registration.session_id != session_id {
            self.apps.insert(app_id.clone(), registration);
            return;
        }

        registration.last_seen_at = Utc::now();
        self.remove_index_entries(&registration);

        if let Err(e) = self.persistence.put_app(registration.to_record()) {
            warn!(
                "Failed to persist last_seen for '{}' on disconnect: {}",
                app_id, e
            );
        }

        self.rehydration.insert(
            app_id.clone(),
            CachedRegistration {
                pools: registration.pools.clone(),
                triggers: registration.triggers.clone(),
                metadata: registration.metadata.clone(),
                protocol_version: registration.protocol_version.clone(),
                registered_at: registration.registered_at,
                last_seen_at: registration.last_seen_at,
            },
        );
        info!(
            "App '{}' disconnected; registration retained for rehydration.",
            app_id
        );

        if let Some(listener) = self.disconnect_listener.get() {
            listener.on_app_disconnected(&app_id, session_id);
        }
    }

    /// Explicitly removes a registration everywhere: live map, cache, store.
    pub async fn remove_app(&self, app_id: &str) -> Result<(), LatZeroError> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;
        if let Some((_, registration)) = self.apps.remove(app_id) {
            self.session_bindings.remove(&registration.session_id);
            self.remove_index_entries(&registration);
        }
        self.rehydration.remove(app_id);
        self.persistence.delete_app(app_id)?;
        self.app_locks.remove(app_id);
        Ok(())
    }

    /// Drops rehydration entries whose `last_seen_at` exceeds the cache
    /// max-age, along with their durable rows. Returns how many were purged.
    pub fn purge_rehydration_cache(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.rehydration_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let expired: Vec<String> = self
            .rehydration
            .iter()
            .filter(|entry| entry.value().last_seen_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for app_id in &expired {
            self.rehydration.remove(app_id);
            if let Err(e) = self.persistence.delete_app(app_id) {
                warn!("Failed to delete expired registration '{}': {}", app_id, e);
            }
            self.app_locks.remove(app_id);
            debug!("Purged expired rehydration entry for '{}'.", app_id);
        }
        expired.len()
    }

    // --- Lookups -----------------------------------------------------------

    /// The AppID bound on a session, if any.
    pub fn app_of_session(&self, session_id: u64) -> Option<String> {
        self.session_bindings.get(&session_id).map(|a| a.clone())
    }

    /// The session an AppID is bound on, if it is live.
    pub fn session_of_app(&self, app_id: &str) -> Option<u64> {
        self.apps.get(app_id).map(|r| r.session_id)
    }

    pub fn is_bound(&self, app_id: &str) -> bool {
        self.apps.contains_key(app_id)
    }

    pub fn get(&self, app_id: &str) -> Option<AppRegistration> {
        self.apps.get(app_id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<AppRegistration> {
        self.apps.iter().map(|entry| entry.value().clone()).collect()
    }

    /// True if the bound app lists the trigger in its registration.
    pub fn handles_trigger(&self, app_id: &str, trigger: &str) -> bool {
        self.apps
            .get(app_id)
            .map(|r| r.triggers.contains(trigger))
            .unwrap_or(false)
    }

    /// The bound handlers for a trigger name, in registration order.
    pub fn handlers_for(&self, trigger: &str) -> Vec<String> {
        self.trigger_index
            .get(trigger)
            .map(|apps| apps.clone())
            .unwrap_or_default()
    }

    /// Whether the rehydration cache currently holds this AppID.
    pub fn has_cached(&self, app_id: &str) -> bool {
        self.rehydration.contains_key(app_id)
    }
}
