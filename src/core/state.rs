// src/core/state.rs

//! Defines the central `ServerState` struct, the connection map, and
//! server-wide statistics.

use crate::config::Config;
use crate::core::LatZeroError;
use crate::core::memory::MemoryManager;
use crate::core::persistence::Persistence;
use crate::core::pools::PoolManager;
use crate::core::protocol::Message;
use crate::core::registry::AppRegistry;
use crate::core::router::TriggerRouter;
use crate::core::security::{AllowAllSecurity, SecurityProvider};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::info;

/// Capacity of each connection's outbound queue. A destination that cannot
/// drain this many messages is shedding, not buffering.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// A map of all active connections, keyed by session id.
pub type ConnectionMap = DashMap<u64, Arc<ConnectionHandle>>;

/// The write-side handle of a connection, shared with every component that
/// needs to deliver a message to it.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub session_id: u64,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    shutdown: broadcast::Sender<()>,
}

impl ConnectionHandle {
    pub fn new(
        session_id: u64,
        addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            session_id,
            addr,
            outbound,
            shutdown,
        }
    }

    /// Queues a message for delivery. Sheds instead of blocking so one slow
    /// consumer cannot stall unrelated connections.
    pub fn send(&self, message: Message) -> Result<(), LatZeroError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                LatZeroError::Routing(format!("outbound queue full for session {}", self.session_id))
            }
            mpsc::error::TrySendError::Closed(_) => LatZeroError::ConnectionClosed,
        })
    }

    /// Signals the connection's handler to terminate.
    pub fn kill(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Server-wide counters. EMA response time is stored in whole microseconds.
#[derive(Debug, Default)]
pub struct StatsState {
    pub total_connections: AtomicU64,
    pub triggers_routed: AtomicU64,
    pub triggers_failed: AtomicU64,
    pub triggers_timed_out: AtomicU64,
    pub emits_delivered: AtomicU64,
    response_time_ema_micros: AtomicU64,
}

impl StatsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_triggers_routed(&self) {
        self.triggers_routed.fetch_add(1, Ordering::Relaxed);
        crate::core::metrics::TRIGGERS_ROUTED_TOTAL.inc();
    }

    pub fn increment_triggers_failed(&self) {
        self.triggers_failed.fetch_add(1, Ordering::Relaxed);
        crate::core::metrics::TRIGGERS_FAILED_TOTAL.inc();
    }

    pub fn increment_triggers_timed_out(&self) {
        self.triggers_timed_out.fetch_add(1, Ordering::Relaxed);
        crate::core::metrics::TRIGGER_TIMEOUTS_TOTAL.inc();
    }

    pub fn increment_emits_delivered(&self, count: u64) {
        self.emits_delivered.fetch_add(count, Ordering::Relaxed);
        crate::core::metrics::EMITS_DELIVERED_TOTAL.inc_by(count as f64);
    }

    /// Folds a response time into the exponential moving average.
    pub fn record_response_time(&self, elapsed: std::time::Duration, alpha: f64) {
        crate::core::metrics::TRIGGER_RESPONSE_SECONDS.observe(elapsed.as_secs_f64());
        let sample = elapsed.as_micros() as f64;
        let mut current = self.response_time_ema_micros.load(Ordering::Relaxed);
        loop {
            let updated = if current == 0 {
                sample
            } else {
                alpha * sample + (1.0 - alpha) * current as f64
            };
            match self.response_time_ema_micros.compare_exchange_weak(
                current,
                updated as u64,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn response_time_ema_micros(&self) -> u64 {
        self.response_time_ema_micros.load(Ordering::Relaxed)
    }
}

/// The central struct holding all shared, server-wide state. Wrapped in an
/// `Arc` and passed to every task and connection handler.
#[derive(Debug)]
pub struct ServerState {
    /// The server's runtime configuration.
    pub config: Arc<Mutex<Config>>,
    /// Durable metadata store plus the ephemeral trigger-row table.
    pub persistence: Arc<Persistence>,
    /// Named memory blocks, their locks, and permissions.
    pub memory: Arc<MemoryManager>,
    /// Pool metadata and the membership index.
    pub pools: Arc<PoolManager>,
    /// The live AppID registry, trigger index, and rehydration cache.
    pub registry: Arc<AppRegistry>,
    /// The request-routing state machine.
    pub router: Arc<TriggerRouter>,
    /// The security seam for encrypted pools.
    pub security: Arc<dyn SecurityProvider>,
    /// All active connections by session id.
    pub connections: Arc<ConnectionMap>,
    /// Server-wide statistics.
    pub stats: Arc<StatsState>,
    /// A random id distinguishing this server boot.
    pub instance_id: String,
    /// When this server booted.
    pub started_at: std::time::Instant,
}

impl ServerState {
    /// Initializes every component in dependency order:
    /// Persistence, Memory Manager, Pool Manager, App Registry, Trigger
    /// Router. The transport layer attaches afterwards.
    pub async fn initialize(config: Config) -> Result<Arc<Self>, LatZeroError> {
        let mut instance_bytes = [0u8; 16];
        getrandom::fill(&mut instance_bytes)
            .map_err(|e| LatZeroError::Internal(format!("entropy source failed: {e}")))?;
        let instance_id = hex::encode(instance_bytes);

        let security: Arc<dyn SecurityProvider> = Arc::new(AllowAllSecurity);
        let connections: Arc<ConnectionMap> = Arc::new(DashMap::new());
        let stats = Arc::new(StatsState::new());

        let persistence = Arc::new(Persistence::open(
            &config.data_dir,
            config.memory_mode,
            config.persistence.max_backups,
        )?);
        info!("Durable store opened at {}.", config.data_dir.display());

        let memory = Arc::new(MemoryManager::new(
            persistence.clone(),
            security.clone(),
            if config.memory_mode {
                None
            } else {
                Some(config.data_dir.join("memory"))
            },
            config.memory.idle_max_age,
        ));
        memory.load()?;

        let pools = Arc::new(PoolManager::new(persistence.clone(), security.clone()));
        pools.load().await?;

        let registry = Arc::new(AppRegistry::new(
            persistence.clone(),
            pools.clone(),
            connections.clone(),
            config.registry.rehydration_ttl,
        ));
        registry.load();

        let router = Arc::new(TriggerRouter::new(
            registry.clone(),
            pools.clone(),
            persistence.clone(),
            connections.clone(),
            stats.clone(),
            config.routing.clone(),
        ));
        // The router learns about disconnects through the registry's narrow
        // listener interface rather than a global event bus; block-write
        // notifications reach attached apps the same way.
        registry.set_disconnect_listener(router.clone());
        memory.set_subscriber(Arc::new(crate::core::dispatch::BlockWriteNotifier {
            registry: registry.clone(),
            connections: connections.clone(),
        }));

        Ok(Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            persistence,
            memory,
            pools,
            registry,
            router,
            security,
            connections,
            stats,
            instance_id,
            started_at: std::time::Instant::now(),
        }))
    }
}
