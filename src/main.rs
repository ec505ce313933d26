// src/main.rs

//! The main entry point for the LatZero server application.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use latzero::config::Config;
use latzero::server;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[derive(Parser)]
#[command(name = "latzero", version, about = "LatZero process orchestration fabric")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestration server.
    Start(StartArgs),
    /// Query a running server (not yet implemented).
    Status,
    /// Stop a running server (not yet implemented).
    Stop,
}

#[derive(Args)]
struct StartArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "LATZERO_PORT")]
    port: Option<u16>,

    /// Host address to bind.
    #[arg(long, env = "LATZERO_HOST")]
    host: Option<String>,

    /// Data directory for the durable store, backups, and memory files.
    #[arg(long, env = "LATZERO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "latzero=debug").
    #[arg(long, env = "LATZERO_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable TLS transport encryption.
    #[arg(long, env = "LATZERO_ENABLE_TLS")]
    tls: bool,

    /// Reserved: multi-node clustering is future work.
    #[arg(long, env = "LATZERO_CLUSTER_MODE")]
    cluster: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Start(args) => run_server(args).await,
        Command::Status => {
            println!("latzero status: not yet implemented");
            Ok(())
        }
        Command::Stop => {
            println!("latzero stop: not yet implemented");
            Ok(())
        }
    }
}

async fn run_server(args: StartArgs) -> Result<()> {
    // Load the configuration file when one is given; CLI flags and
    // environment variables override its values.
    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    if args.tls {
        config.tls.enabled = true;
    }
    if args.cluster {
        config.cluster.enabled = true;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    // Setup logging with reloading capabilities. RUST_LOG wins over the
    // configured level.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}
