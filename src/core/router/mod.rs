// src/core/router/mod.rs

//! The request-routing state machine: handler resolution, the in-flight
//! record table, response correlation, TTL expiry, and disconnect-driven
//! cleanup.
//!
//! The ordering discipline that makes correlation safe: a record is inserted
//! into the table (and its expiry scheduled) before the trigger is written
//! to the destination's connection, so a response can never arrive ahead of
//! the record it answers.

pub mod policy;
pub mod record;

pub use policy::{DestinationSelector, RoutingPolicy};
pub use record::{RecordState, TriggerRecord};

use crate::config::RoutingConfig;
use crate::core::LatZeroError;
use crate::core::persistence::Persistence;
use crate::core::pools::{DEFAULT_POOL, PoolManager};
use crate::core::protocol::{EmitMessage, ErrorMessage, Message, ResponseMessage, TriggerMessage};
use crate::core::registry::{AppRegistry, DisconnectListener};
use crate::core::state::{ConnectionMap, StatsState};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Routes triggers to handlers and correlates their responses.
pub struct TriggerRouter {
    records: DashMap<Uuid, TriggerRecord>,
    selector: DestinationSelector,
    registry: Arc<AppRegistry>,
    pools: Arc<PoolManager>,
    persistence: Arc<Persistence>,
    connections: Arc<ConnectionMap>,
    stats: Arc<StatsState>,
    config: RoutingConfig,
}

impl std::fmt::Debug for TriggerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRouter")
            .field("in_flight", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl TriggerRouter {
    pub fn new(
        registry: Arc<AppRegistry>,
        pools: Arc<PoolManager>,
        persistence: Arc<Persistence>,
        connections: Arc<ConnectionMap>,
        stats: Arc<StatsState>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            records: DashMap::new(),
            selector: DestinationSelector::new(),
            registry,
            pools,
            persistence,
            connections,
            stats,
            config,
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.records.len()
    }

    /// Checks that `destination` both registers the trigger and shares at
    /// least one pool with `origin`. Used by the explicit-destination path.
    pub fn validate_routing(
        &self,
        origin: &str,
        destination: &str,
        trigger: &str,
    ) -> Result<(), LatZeroError> {
        if !self.registry.handles_trigger(destination, trigger) {
            return Err(LatZeroError::AccessDenied(format!(
                "app '{destination}' does not handle trigger '{trigger}'"
            )));
        }
        if !self.pools.share_a_pool(origin, destination) {
            return Err(LatZeroError::AccessDenied(format!(
                "'{origin}' and '{destination}' share no pool"
            )));
        }
        Ok(())
    }

    /// Processes a `trigger` request from a bound connection.
    ///
    /// On success the message has been dispatched and an in-flight record
    /// awaits the response. Every error return is delivered to the caller as
    /// a correlated `error` message by the dispatcher.
    pub async fn route_trigger(
        self: &Arc<Self>,
        session_id: u64,
        mut msg: TriggerMessage,
    ) -> Result<(), LatZeroError> {
        let origin = self.registry.app_of_session(session_id).ok_or_else(|| {
            LatZeroError::Validation("connection is not bound; handshake first".into())
        })?;
        // The connection binding is authoritative for the origin.
        msg.origin = origin.clone();

        let pool = msg.pool.clone().unwrap_or_else(|| DEFAULT_POOL.to_string());
        if !self.pools.exists(&pool) {
            self.stats.increment_triggers_failed();
            return Err(LatZeroError::NotFound(format!(
                "pool '{pool}' does not exist"
            )));
        }
        if !self.pools.validate_membership(&origin, &pool) {
            self.stats.increment_triggers_failed();
            return Err(LatZeroError::AccessDenied(format!(
                "'{origin}' is not a member of pool '{pool}'"
            )));
        }

        let candidates = self.resolve_candidates(&origin, &pool, &msg)?;
        let index = self
            .selector
            .select(self.config.policy, &msg.trigger, candidates.len());
        let destination = candidates[index].clone();

        if destination == origin {
            self.stats.increment_triggers_failed();
            return Err(LatZeroError::ShortCircuitNotImplemented);
        }

        if self.records.len() >= self.config.max_inflight {
            self.stats.increment_triggers_failed();
            return Err(LatZeroError::TooManyRequests(self.config.max_inflight));
        }

        let ttl_ms = msg
            .ttl_ms
            .unwrap_or(self.config.default_ttl_ms)
            .min(self.config.max_ttl_ms);
        let ttl = Duration::from_millis(ttl_ms);

        if self.records.contains_key(&msg.id) {
            self.stats.increment_triggers_failed();
            return Err(LatZeroError::Validation(format!(
                "trigger id {} is already in flight",
                msg.id
            )));
        }

        let record = TriggerRecord {
            id: msg.id,
            origin_app_id: origin,
            origin_session: session_id,
            destination_app_id: Some(destination.clone()),
            pool,
            trigger_name: msg.trigger.clone(),
            created_at: Utc::now(),
            created_instant: Instant::now(),
            ttl,
            dispatched_to: None,
            state: RecordState::Pending,
            original: msg.clone(),
            timer: None,
        };
        let record_id = record.id;

        // Insert before dispatch: the record must exist before the
        // destination can possibly answer. The timer attaches after the
        // insert so a zero TTL expires a record that is actually present.
        self.persistence.put_trigger_row(record.to_row());
        self.records.insert(record_id, record);

        let router = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            router.expire(record_id).await;
        });
        match self.records.get_mut(&record_id) {
            Some(mut entry) => entry.timer = Some(timer),
            // Already completed or expired in the meantime.
            None => timer.abort(),
        }

        let dest_session = self.registry.session_of_app(&destination);
        let send_result = dest_session
            .and_then(|sid| self.connections.get(&sid))
            .ok_or(LatZeroError::ConnectionClosed)
            .and_then(|handle| handle.send(Message::Trigger(msg)));

        match send_result {
            Ok(()) => {
                if let Some(mut entry) = self.records.get_mut(&record_id) {
                    entry.state = RecordState::Dispatched;
                    entry.dispatched_to = Some(destination);
                    self.persistence
                        .update_trigger_row_state(record_id, RecordState::Dispatched.as_str());
                }
                self.stats.increment_triggers_routed();
                Ok(())
            }
            Err(e) => {
                // The write failed; the record is dead on arrival.
                self.drop_record(record_id, RecordState::Failed);
                self.stats.increment_triggers_failed();
                Err(LatZeroError::Routing(format!(
                    "failed to dispatch to '{destination}': {e}"
                )))
            }
        }
    }

    /// Resolves the candidate handler set: the explicit destination when the
    /// message names one, otherwise the trigger index intersected with the
    /// pool membership; filtered to bound handlers that register the trigger.
    fn resolve_candidates(
        &self,
        origin: &str,
        pool: &str,
        msg: &TriggerMessage,
    ) -> Result<Vec<String>, LatZeroError> {
        let raw: Vec<String> = match &msg.destination {
            Some(dest) => vec![dest.clone()],
            None => self.registry.handlers_for(&msg.trigger),
        };

        let candidates: Vec<String> = raw
            .into_iter()
            .filter(|app| {
                self.registry.is_bound(app)
                    && self.registry.handles_trigger(app, &msg.trigger)
                    && self.pools.validate_membership(app, pool)
            })
            .collect();

        if candidates.is_empty() {
            self.stats.increment_triggers_failed();
            if let Some(dest) = &msg.destination {
                if self.registry.is_bound(dest) {
                    // The destination exists but fails a routing constraint.
                    self.validate_routing(origin, dest, &msg.trigger)?;
                    return Err(LatZeroError::AccessDenied(format!(
                        "'{dest}' is not a member of pool '{pool}'"
                    )));
                }
            }
            return Err(LatZeroError::NotFound(format!(
                "no active handler for trigger '{}' in pool '{pool}'",
                msg.trigger
            )));
        }
        Ok(candidates)
    }

    /// Routes a `response` back to the originator of its record.
    pub fn handle_response(&self, msg: ResponseMessage) {
        let correlation_id = msg.correlation_id;
        self.complete(correlation_id, Message::Response(msg));
    }

    /// Routes a received `error` identically to an error-status response.
    pub fn handle_error_reply(&self, msg: ErrorMessage) {
        let correlation_id = msg.correlation_id;
        self.complete(correlation_id, Message::Error(msg));
    }

    fn complete(&self, correlation_id: Uuid, reply: Message) {
        let Some((_, mut record)) = self.records.remove(&correlation_id) else {
            // Usually a response that lost the race with its timeout.
            warn!(
                "Dropping reply for unknown trigger id {} (already timed out?).",
                correlation_id
            );
            return;
        };
        record.cancel_timer();
        record.state = RecordState::Completed;

        self.stats
            .record_response_time(record.created_instant.elapsed(), self.config.response_ema_alpha);
        self.persistence.remove_trigger_row(correlation_id);

        match self.connections.get(&record.origin_session) {
            Some(handle) => {
                if let Err(e) = handle.send(reply) {
                    warn!(
                        "Failed to deliver reply for {} to '{}': {}",
                        correlation_id, record.origin_app_id, e
                    );
                }
            }
            None => {
                debug!(
                    "Originator '{}' of {} disconnected; dropping reply.",
                    record.origin_app_id, correlation_id
                );
            }
        }
    }

    /// Fires when a record's TTL elapses: synthesizes a `TIMEOUT` error to
    /// the originator and deletes the record.
    pub async fn expire(&self, id: Uuid) {
        let Some((_, mut record)) = self.records.remove(&id) else {
            return;
        };
        record.cancel_timer();
        record.state = RecordState::TimedOut;
        self.stats.increment_triggers_timed_out();
        self.persistence.remove_trigger_row(id);

        debug!(
            "Trigger {} ('{}') timed out after {:?}.",
            id, record.trigger_name, record.ttl
        );
        let err = LatZeroError::Timeout(record.ttl.as_millis() as u64);
        if let Some(handle) = self.connections.get(&record.origin_session) {
            let _ = handle.send(Message::Error(ErrorMessage::from_error(id, &err)));
        }
    }

    /// Walks the table and reaps any record whose individual timer failed to
    /// fire. Runs from the periodic sweeper task.
    pub async fn reap_stragglers(&self) {
        let expired: Vec<Uuid> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| *entry.key())
            .collect();
        if !expired.is_empty() {
            info!("Sweeper reaping {} straggler records.", expired.len());
        }
        for id in expired {
            self.expire(id).await;
        }
    }

    /// Delivers an `emit` to every matching handler. No record is created
    /// and no response is tracked.
    pub fn handle_emit(&self, session_id: u64, msg: EmitMessage) -> Result<usize, LatZeroError> {
        let origin = self.registry.app_of_session(session_id).ok_or_else(|| {
            LatZeroError::Validation("connection is not bound; handshake first".into())
        })?;
        let pool = msg.pool.clone().unwrap_or_else(|| DEFAULT_POOL.to_string());
        if !self.pools.exists(&pool) {
            return Err(LatZeroError::NotFound(format!(
                "pool '{pool}' does not exist"
            )));
        }
        if !self.pools.validate_membership(&origin, &pool) {
            return Err(LatZeroError::AccessDenied(format!(
                "'{origin}' is not a member of pool '{pool}'"
            )));
        }

        let mut delivered = 0usize;
        for app in self.registry.handlers_for(&msg.trigger) {
            if !self.pools.validate_membership(&app, &pool) {
                continue;
            }
            let Some(sid) = self.registry.session_of_app(&app) else {
                continue;
            };
            if let Some(handle) = self.connections.get(&sid) {
                match handle.send(Message::Emit(msg.clone())) {
                    Ok(()) => delivered += 1,
                    Err(e) => debug!("Emit to '{}' shed: {}", app, e),
                }
            }
        }
        self.stats.increment_emits_delivered(delivered as u64);
        Ok(delivered)
    }

    /// Removes a record without notifying anyone (dispatch failure path).
    fn drop_record(&self, id: Uuid, state: RecordState) {
        if let Some((_, mut record)) = self.records.remove(&id) {
            record.cancel_timer();
            record.state = state;
            self.persistence.remove_trigger_row(id);
        }
    }

    /// Fails every record anchored on `app_id`, either as origin or as the
    /// selected destination. Origins still connected receive a
    /// `ROUTING_ERROR`.
    fn fail_records_for_app(&self, app_id: &str) {
        let affected: Vec<Uuid> = self
            .records
            .iter()
            .filter(|entry| {
                let r = entry.value();
                r.origin_app_id == app_id
                    || r.dispatched_to.as_deref() == Some(app_id)
                    || r.destination_app_id.as_deref() == Some(app_id)
            })
            .map(|entry| *entry.key())
            .collect();

        for id in affected {
            let Some((_, mut record)) = self.records.remove(&id) else {
                continue;
            };
            record.cancel_timer();
            record.state = RecordState::Failed;
            self.stats.increment_triggers_failed();
            self.persistence.remove_trigger_row(id);

            if record.origin_app_id != app_id {
                let err = LatZeroError::Routing(format!(
                    "destination '{app_id}' disconnected mid-flight"
                ));
                if let Some(handle) = self.connections.get(&record.origin_session) {
                    let _ = handle.send(Message::Error(ErrorMessage::from_error(id, &err)));
                }
            }
        }
    }

    /// Fails everything still in flight. Part of graceful shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.records.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            info!("Failing {} in-flight records for shutdown.", ids.len());
        }
        for id in ids {
            let Some((_, mut record)) = self.records.remove(&id) else {
                continue;
            };
            record.cancel_timer();
            record.state = RecordState::Failed;
            self.persistence.remove_trigger_row(id);
            let err = LatZeroError::Routing("server is shutting down".into());
            if let Some(handle) = self.connections.get(&record.origin_session) {
                let _ = handle.send(Message::Error(ErrorMessage::from_error(id, &err)));
            }
        }
    }
}

impl DisconnectListener for TriggerRouter {
    fn on_app_disconnected(&self, app_id: &str, _session_id: u64) {
        self.fail_records_for_app(app_id);
    }
}
