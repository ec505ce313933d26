// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource
//! management.

use crate::core::metrics;
use crate::core::state::ConnectionMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Ensures the connection-map entry is removed whenever a connection
/// handler's scope is exited, including on panic.
pub struct ConnectionGuard {
    connections: Arc<ConnectionMap>,
    session_id: u64,
    addr: SocketAddr,
}

impl ConnectionGuard {
    pub(crate) fn new(connections: Arc<ConnectionMap>, session_id: u64, addr: SocketAddr) -> Self {
        Self {
            connections,
            session_id,
            addr,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(
            "ConnectionGuard dropping, removing connection entry for {}",
            self.addr
        );
        self.connections.remove(&self.session_id);
    }
}
