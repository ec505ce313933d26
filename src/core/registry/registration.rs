// src/core/registry/registration.rs

//! Registration state for a bound application and the offline form kept in
//! the rehydration cache.

use crate::core::persistence::AppRecord;
use crate::core::protocol::JsonMap;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;

/// The live registration of a bound application.
#[derive(Debug, Clone)]
pub struct AppRegistration {
    pub app_id: String,
    pub pools: IndexSet<String>,
    pub triggers: IndexSet<String>,
    pub metadata: JsonMap,
    pub protocol_version: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub rehydrated: bool,
    /// The session currently bound to this AppID.
    pub session_id: u64,
}

impl AppRegistration {
    pub fn to_record(&self) -> AppRecord {
        AppRecord {
            app_id: self.app_id.clone(),
            pools: self.pools.iter().cloned().collect(),
            triggers: self.triggers.iter().cloned().collect(),
            metadata: self.metadata.clone(),
            protocol_version: self.protocol_version.clone(),
            registered_at: self.registered_at,
            last_seen_at: self.last_seen_at,
            updated_at: self.last_seen_at,
        }
    }
}

/// The offline remnant of a registration: everything needed to restore the
/// app's pools, triggers, and metadata on a minimal handshake.
#[derive(Debug, Clone)]
pub struct CachedRegistration {
    pub pools: IndexSet<String>,
    pub triggers: IndexSet<String>,
    pub metadata: JsonMap,
    pub protocol_version: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl CachedRegistration {
    pub fn from_record(record: &AppRecord) -> Self {
        Self {
            pools: record.pools.iter().cloned().collect(),
            triggers: record.triggers.iter().cloned().collect(),
            metadata: record.metadata.clone(),
            protocol_version: record.protocol_version.clone(),
            registered_at: record.registered_at,
            last_seen_at: record.last_seen_at,
        }
    }
}
