// src/server/initialization.rs

//! Handles the complete server initialization process, from state setup in
//! dependency order through binding the listener.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::ServerState;
use anyhow::{Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::info;

/// Initializes all server components before starting the main loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config).await?;

    if !config.memory_mode {
        for sub_dir in ["backups", "memory", "logs"] {
            tokio::fs::create_dir_all(config.data_dir.join(sub_dir)).await?;
        }
    }

    let host = config.host.clone();
    let port = config.port;
    let max_clients = config.max_clients;

    // Components come up leaves-first: Persistence, Memory Manager, Pool
    // Manager, App Registry, Trigger Router. The listener binds last.
    let server_state = ServerState::initialize(config).await?;
    info!("Server state initialized.");

    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!("LatZero server listening on {}:{}", host, port);
    let connection_permits = Arc::new(tokio::sync::Semaphore::new(max_clients));

    Ok(ServerContext {
        state: server_state,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        acceptor,
        connection_permits,
    })
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
async fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(&config.tls.cert_path)?;
        let key = load_key(&config.tls.key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    if config.memory_mode {
        info!("Running in memory mode; nothing will be persisted.");
    } else {
        info!("Data directory: {}", config.data_dir.display());
    }
    info!(
        "Routing policy: {:?}, default TTL {} ms, in-flight cap {}.",
        config.routing.policy, config.routing.default_ttl_ms, config.routing.max_inflight
    );
}
