//! Fleetgate control plane server
//!
//! Binds the agent-facing tunnel listener and the management API, and runs
//! the tunnel reaper for the process lifetime.

use anyhow::{Context, Result};
use clap::Parser;
use fleetgate_api::{ApiServer, ApiServerConfig, DataStore, InMemoryDataStore, LocalFileService};
use fleetgate_proxy::{ProxyFactory, RequestForwarder};
use fleetgate_signature::SignatureService;
use fleetgate_tunnel::{TunnelManager, TunnelOptions, TunnelServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fleetgate - management control plane for fleets of edge endpoints
#[derive(Parser, Debug)]
#[command(name = "fleetgate")]
#[command(about = "Fleetgate control plane server")]
#[command(version)]
struct Cli {
    /// API server bind address
    #[arg(long, env = "FLEETGATE_API_ADDR", default_value = "127.0.0.1:9000")]
    api_addr: SocketAddr,

    /// Tunnel listener bind address (edge agents dial out to this)
    #[arg(long, env = "FLEETGATE_TUNNEL_ADDR", default_value = "0.0.0.0:8800")]
    tunnel_addr: SocketAddr,

    /// Signing key file, created on first start. The derived public key is
    /// what agents pin at enrollment.
    #[arg(long, env = "FLEETGATE_KEY_FILE", default_value = "fleetgate.key")]
    key_file: PathBuf,

    /// Directory for uploaded edge job logs
    #[arg(long, env = "FLEETGATE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// JSON file with endpoint records to preload into the store
    #[arg(long, env = "FLEETGATE_ENDPOINTS_FILE")]
    endpoints_file: Option<PathBuf>,

    /// Static bearer token guarding the management API
    #[arg(long, env = "FLEETGATE_API_TOKEN")]
    api_token: Option<String>,

    /// Seconds an activation waits for the agent's data connection
    #[arg(long, default_value = "8")]
    activation_timeout: u64,

    /// Seconds of inactivity before the reaper closes a tunnel
    #[arg(long, default_value = "30")]
    idle_threshold: u64,

    /// Seconds between reaper sweeps
    #[arg(long, default_value = "5")]
    reaper_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(fmt::layer())
        .init();

    let signature =
        Arc::new(SignatureService::load_or_generate(&cli.key_file).context("load signing key")?);
    info!(public_key = %signature.encoded_public_key(), "control plane identity ready");

    let options = TunnelOptions {
        activation_timeout: Duration::from_secs(cli.activation_timeout),
        idle_threshold: Duration::from_secs(cli.idle_threshold),
        reaper_interval: Duration::from_secs(cli.reaper_interval),
        ..TunnelOptions::default()
    };
    let manager = Arc::new(TunnelManager::new(options));
    let reaper = Arc::clone(&manager).spawn_reaper();

    let tunnel_server = TunnelServer::bind(Arc::clone(&manager), cli.tunnel_addr)
        .await
        .context("bind tunnel listener")?;
    tokio::spawn(tunnel_server.run());

    let store = Arc::new(InMemoryDataStore::new());
    if let Some(path) = &cli.endpoints_file {
        let raw = std::fs::read(path).context("read endpoints file")?;
        let endpoints: Vec<fleetgate_types::Endpoint> =
            serde_json::from_slice(&raw).context("parse endpoints file")?;
        let count = endpoints.len();
        for endpoint in endpoints {
            store
                .upsert_endpoint(endpoint)
                .await
                .context("preload endpoint")?;
        }
        info!(count, "preloaded endpoints");
    }

    let forwarder = Arc::new(RequestForwarder::new(
        Arc::clone(&manager),
        Arc::clone(&signature),
        Arc::new(ProxyFactory::new()),
    ));
    let files = Arc::new(LocalFileService::new(&cli.data_dir));

    let api = ApiServer::new(
        ApiServerConfig {
            bind_addr: cli.api_addr,
            enable_cors: true,
            api_token: cli.api_token.clone(),
        },
        forwarder,
        Arc::clone(&manager),
        store,
        files,
    );

    tokio::select! {
        result = api.start() => {
            result.context("api server failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    manager.shutdown().await;
    let _ = reaper.await;
    Ok(())
}
