use anyhow::{Context, Result};
use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::{future::IntoFuture, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mesh_shared::config::{MeshConfig, Mode, ServerConfig};
use mesh_shared::directory::NodeDirectory;
use mesh_shared::forward::{ForwardOptions, Forwarder};
use mesh_shared::registry::CorrelationRegistry;

mod admin;
mod gateway;
mod headers;
mod metrics;
mod tunnel;


use headers::HeaderRewriter;
use metrics::Metrics;

#[derive(Parser)]
#[command(name = "mesh-relay")]
#[command(author = "Mesh Team")]
#[command(version)]
#[command(about = "Cloud side of the edge mesh: accepts node tunnels and forwards calls into them", long_about = None)]
struct Cli {
    /// Path to mesh.yml (searched in the current and home directory if unset)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind both listeners to
    #[arg(long)]
    bind: Option<String>,

    /// Port nodes connect to
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// Port admin callers use to reach nodes
    #[arg(long)]
    forward_port: Option<u16>,

    /// Seconds to wait for a node response
    #[arg(long)]
    timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone)]
pub struct AppState {
    directory: NodeDirectory,
    forwarder: Forwarder,
    metrics: Metrics,
    rewriter: HeaderRewriter,
    config: Arc<ServerConfig>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = CorrelationRegistry::new(config.duplicate_policy);
        let directory = NodeDirectory::new(registry);
        let forwarder = Forwarder::new(
            directory.clone(),
            ForwardOptions {
                timeout: config.request_timeout(),
                key_mode: config.key_mode,
            },
        );
        Self {
            directory,
            forwarder,
            metrics: Metrics::new(),
            rewriter: HeaderRewriter::default(),
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

/// The node-facing router and the gateway router.
pub fn build_routers(state: AppState) -> (Router, Router) {
    let tunnel = Router::new()
        .route("/v1/mesh", get(tunnel::ws_handler))
        .merge(admin::router())
        .fallback(admin::forbidden)
        .with_state(state.clone());

    let gateway = Router::new()
        .fallback(gateway::gateway_handler)
        .with_state(state);

    (tunnel, gateway)
}

fn load_config(cli: &Cli) -> Result<MeshConfig> {
    let mut config = match cli.config.clone().or_else(MeshConfig::find_config) {
        Some(path) => MeshConfig::load(&path)?,
        None => MeshConfig {
            mode: Mode::Server,
            ..Default::default()
        },
    };
    if !config.mode.is_server() {
        anyhow::bail!("config mode {:?} does not run the relay (need server or dual)", config.mode);
    }

    if let Some(bind) = &cli.bind {
        config.server.bind_ip = bind.clone();
    }
    if let Some(port) = cli.tunnel_port {
        config.server.tunnel_port = port;
    }
    if let Some(port) = cli.forward_port {
        config.server.forward_port = port;
    }
    if let Some(secs) = cli.timeout {
        config.server.request_timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(verbose: bool, log_level: Option<&str>) {
    let directive = if verbose {
        "mesh_relay=debug,mesh_shared=debug".to_string()
    } else {
        std::env::var("RUST_LOG")
            .ok()
            .or_else(|| log_level.map(String::from))
            .unwrap_or_else(|| "mesh_relay=info,mesh_shared=info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(cli.verbose, config.log_level.as_deref());

    let server = config.server;
    let tunnel_addr: SocketAddr = format!("{}:{}", server.bind_ip, server.tunnel_port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", server.bind_ip))?;
    let gateway_addr = SocketAddr::new(tunnel_addr.ip(), server.forward_port);

    let state = AppState::new(server);
    let (tunnel_app, gateway_app) = build_routers(state.clone());

    let tunnel_listener = tokio::net::TcpListener::bind(tunnel_addr)
        .await
        .with_context(|| format!("Failed to bind tunnel listener on {}", tunnel_addr))?;
    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .with_context(|| format!("Failed to bind gateway listener on {}", gateway_addr))?;
    info!("Mesh relay: tunnels on {}, gateway on {}", tunnel_addr, gateway_addr);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let directory = state.directory.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        directory.shutdown();
        signal.cancel();
    });

    let tunnel_stop = shutdown.clone();
    let gateway_stop = shutdown.clone();
    tokio::try_join!(
        axum::serve(
            tunnel_listener,
            tunnel_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { tunnel_stop.cancelled().await })
        .into_future(),
        axum::serve(
            gateway_listener,
            gateway_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { gateway_stop.cancelled().await })
        .into_future(),
    )?;

    Ok(())
}
