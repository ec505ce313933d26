// src/core/router/record.rs

//! The per-request state kept while a trigger is in flight.

use crate::core::persistence::TriggerRow;
use crate::core::protocol::TriggerMessage;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle of an in-flight record. Terminal states delete the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Dispatched,
    Completed,
    TimedOut,
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Dispatched => "dispatched",
            RecordState::Completed => "completed",
            RecordState::TimedOut => "timed_out",
            RecordState::Failed => "failed",
        }
    }
}

/// One in-flight trigger. The expiry timer's handle is stored beside the
/// record so removal always cancels it.
#[derive(Debug)]
pub struct TriggerRecord {
    pub id: Uuid,
    pub origin_app_id: String,
    pub origin_session: u64,
    pub destination_app_id: Option<String>,
    pub pool: String,
    pub trigger_name: String,
    pub created_at: DateTime<Utc>,
    pub created_instant: Instant,
    pub ttl: Duration,
    pub dispatched_to: Option<String>,
    pub state: RecordState,
    /// Held for constructing timeout and routing-error replies.
    pub original: TriggerMessage,
    pub timer: Option<JoinHandle<()>>,
}

impl TriggerRecord {
    /// True once the record has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.created_instant.elapsed() >= self.ttl
    }

    /// The ephemeral persistence mirror of this record.
    pub fn to_row(&self) -> TriggerRow {
        TriggerRow {
            id: self.id,
            origin_app_id: self.origin_app_id.clone(),
            destination_app_id: self.destination_app_id.clone(),
            pool: self.pool.clone(),
            trigger_name: self.trigger_name.clone(),
            created_at: self.created_at,
            ttl_ms: self.ttl.as_millis() as u64,
            dispatched_to: self.dispatched_to.clone(),
            state: self.state.as_str().to_string(),
        }
    }

    /// Cancels the expiry timer, if one is still scheduled.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TriggerRecord {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
