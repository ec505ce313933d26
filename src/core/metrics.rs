// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram};

lazy_static! {
    // --- Gauges ---
    /// The number of clients currently connected to the server.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("latzero_connected_clients", "Number of currently connected clients.").unwrap();
    /// The number of trigger records currently in flight.
    pub static ref INFLIGHT_RECORDS: Gauge =
        register_gauge!("latzero_inflight_records", "Number of in-flight trigger records.").unwrap();
    /// The number of live memory blocks.
    pub static ref MEMORY_BLOCKS: Gauge =
        register_gauge!("latzero_memory_blocks", "Number of live memory blocks.").unwrap();

    // --- Counters ---
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("latzero_connections_received_total", "Total number of connections received.").unwrap();
    /// The total number of triggers successfully dispatched.
    pub static ref TRIGGERS_ROUTED_TOTAL: Counter =
        register_counter!("latzero_triggers_routed_total", "Total number of triggers dispatched to a handler.").unwrap();
    /// The total number of triggers that failed to route.
    pub static ref TRIGGERS_FAILED_TOTAL: Counter =
        register_counter!("latzero_triggers_failed_total", "Total number of triggers that failed to route.").unwrap();
    /// The total number of trigger records that timed out.
    pub static ref TRIGGER_TIMEOUTS_TOTAL: Counter =
        register_counter!("latzero_trigger_timeouts_total", "Total number of trigger records that timed out.").unwrap();
    /// The total number of emit deliveries.
    pub static ref EMITS_DELIVERED_TOTAL: Counter =
        register_counter!("latzero_emits_delivered_total", "Total number of emit deliveries to handlers.").unwrap();

    // --- Histograms ---
    /// Trigger round-trip time in seconds, from dispatch to response.
    pub static ref TRIGGER_RESPONSE_SECONDS: Histogram =
        register_histogram!("latzero_trigger_response_seconds", "Trigger round-trip time in seconds.").unwrap();
}

/// Renders all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
