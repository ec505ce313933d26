// src/config.rs

//! Manages server configuration: loading, defaulting, and validation.

use crate::core::router::RoutingPolicy;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// The default TCP port of the fabric.
pub const DEFAULT_PORT: u16 = 45227;

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> PathBuf {
    resolve_home().join(".latzero")
}
fn default_max_clients() -> usize {
    10000
}

/// Resolves the user's home directory, falling back to the current
/// directory when the environment does not provide one.
fn resolve_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Routing knobs consumed by the trigger router.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoutingConfig {
    /// Destination selection strategy.
    #[serde(default)]
    pub policy: RoutingPolicy,
    /// TTL applied when a trigger does not carry one.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Hard ceiling any requested TTL is clamped to.
    #[serde(default = "default_max_ttl_ms")]
    pub max_ttl_ms: u64,
    /// Upper bound of the in-flight record table.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Interval of the straggler sweeper.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    /// Smoothing factor of the response-time moving average.
    #[serde(default = "default_ema_alpha")]
    pub response_ema_alpha: f64,
}

fn default_ttl_ms() -> u64 {
    30_000
}
fn default_max_ttl_ms() -> u64 {
    300_000
}
fn default_max_inflight() -> usize {
    10_000
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_ema_alpha() -> f64 {
    0.1
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: RoutingPolicy::default(),
            default_ttl_ms: default_ttl_ms(),
            max_ttl_ms: default_max_ttl_ms(),
            max_inflight: default_max_inflight(),
            sweep_interval: default_sweep_interval(),
            response_ema_alpha: default_ema_alpha(),
        }
    }
}

/// Registry knobs: how long disconnected registrations are retained.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegistryConfig {
    /// How long a disconnected registration stays rehydratable.
    #[serde(with = "humantime_serde", default = "default_rehydration_ttl")]
    pub rehydration_ttl: Duration,
    /// Interval of the cache purger.
    #[serde(with = "humantime_serde", default = "default_purge_interval")]
    pub purge_interval: Duration,
}

fn default_rehydration_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_purge_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rehydration_ttl: default_rehydration_ttl(),
            purge_interval: default_purge_interval(),
        }
    }
}

/// Memory-block knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemoryConfig {
    /// Idle age after which unattached, non-persistent blocks are collected.
    #[serde(with = "humantime_serde", default = "default_idle_max_age")]
    pub idle_max_age: Duration,
    /// Interval of the block garbage collector.
    #[serde(with = "humantime_serde", default = "default_gc_interval")]
    pub gc_interval: Duration,
}

fn default_idle_max_age() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            idle_max_age: default_idle_max_age(),
            gc_interval: default_gc_interval(),
        }
    }
}

/// Durable-store knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistenceConfig {
    /// Interval of the periodic snapshot rewrite.
    #[serde(with = "humantime_serde", default = "default_snapshot_interval")]
    pub snapshot_interval: Duration,
    /// Take a timestamped backup every N snapshots. 0 disables backups.
    #[serde(default = "default_backups_every")]
    pub backups_every: u32,
    /// Oldest backups are pruned beyond this count.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_backups_every() -> u32 {
    12
}
fn default_max_backups() -> usize {
    5
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: default_snapshot_interval(),
            backups_every: default_backups_every(),
            max_backups: default_max_backups(),
        }
    }
}

/// Configuration for TLS transport encryption. A switch only: framing and
/// message semantics are identical either way.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "latzero.crt".to_string()
}
fn default_key_path() -> String {
    "latzero.key".to_string()
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// Per-connection limits.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LimitsConfig {
    /// Messages per second accepted from one connection. 0 disables the cap.
    #[serde(default)]
    pub messages_per_second: u32,
}

/// Reserved: multi-node operation is future work.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// The full, validated server configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Collapses the durable store to memory-only.
    #[serde(default)]
    pub memory_mode: bool,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            memory_mode: false,
            routing: RoutingConfig::default(),
            registry: RegistryConfig::default(),
            memory: MemoryConfig::default(),
            persistence: PersistenceConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
            limits: LimitsConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.data_dir = expand_tilde(config.data_dir);
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.routing.max_inflight == 0 {
            return Err(anyhow!("routing.max_inflight cannot be 0"));
        }
        if self.routing.max_ttl_ms == 0 {
            return Err(anyhow!("routing.max_ttl_ms cannot be 0"));
        }
        if !(0.0..=1.0).contains(&self.routing.response_ema_alpha) {
            return Err(anyhow!(
                "routing.response_ema_alpha must be between 0 and 1"
            ));
        }
        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        if self.cluster.enabled {
            return Err(anyhow!(
                "cluster mode is reserved and not available in this build"
            ));
        }
        Ok(())
    }
}

/// Expands a leading `~` to the user's home directory.
fn expand_tilde(path: PathBuf) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path;
    };
    if raw == "~" {
        return resolve_home();
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return resolve_home().join(rest);
    }
    path
}
