use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mesh_shared::config::{MeshConfig, Mode};
use mesh_shared::dispatch::Dispatcher;
use mesh_shared::session::NodeId;

mod proxy;
mod tunnel;

#[derive(Parser)]
#[command(name = "mesh")]
#[command(author = "Mesh Team")]
#[command(version)]
#[command(about = "Edge node agent: keeps a tunnel to the relay and serves local services through it", long_about = None)]
struct Cli {
    /// Path to mesh.yml (searched in the current and home directory if unset)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay server URL
    #[arg(short, long)]
    relay: Option<String>,

    /// Identity announced to the relay
    #[arg(short, long)]
    node_id: Option<String>,

    /// Expose a local service, as name=port (repeatable)
    #[arg(short, long = "service", value_parser = parse_service)]
    services: Vec<(String, u16)>,

    /// Port for requests naming no exposed service
    #[arg(long)]
    default_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_service(raw: &str) -> std::result::Result<(String, u16), String> {
    let (name, port) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=port, got '{}'", raw))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in '{}'", raw))?;
    Ok((name.to_string(), port))
}

fn load_config(cli: &Cli) -> Result<MeshConfig> {
    let mut config = match cli.config.clone().or_else(MeshConfig::find_config) {
        Some(path) => MeshConfig::load(&path)?,
        None => MeshConfig {
            mode: Mode::Client,
            ..Default::default()
        },
    };
    if !config.mode.is_client() {
        anyhow::bail!("config mode {:?} does not run a node (need client or dual)", config.mode);
    }

    let client = &mut config.client;
    if let Some(relay) = &cli.relay {
        client.relay_url = relay.clone();
    }
    if let Some(node_id) = &cli.node_id {
        client.node_id = Some(node_id.clone());
    }
    for (name, port) in &cli.services {
        client.services.insert(name.clone(), *port);
    }
    if let Some(port) = cli.default_port {
        client.default_port = Some(port);
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(verbose: bool, log_level: Option<&str>) {
    let directive = if verbose {
        "mesh=debug,mesh_shared=debug".to_string()
    } else {
        std::env::var("RUST_LOG")
            .ok()
            .or_else(|| log_level.map(String::from))
            .unwrap_or_else(|| "mesh=info,mesh_shared=info".to_string())
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

    let client = config.client;
    let node = NodeId::parse(client.node_id.as_deref().unwrap_or_default())
        .context("Invalid node id")?;
    let service = proxy::HttpLocalService::new(&client).context("Failed to build HTTP client")?;
    let dispatcher = Dispatcher::new(Arc::new(service));

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Mesh Node Active                                            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:    {:<50} ║", node);
    println!("║  Relay:   {:<50} ║", client.relay_url);
    for (name, port) in &client.services {
        println!("║  Service: {:<50} ║", format!("{} -> {}:{}", name, client.local_host, port));
    }
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the node\n");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.cancel();
    });

    loop {
        match tunnel::run_session(&client, &node, &dispatcher, &shutdown).await {
            Ok(()) => {
                info!("Tunnel closed gracefully");
                break;
            }
            Err(e) => {
                error!(
                    "Tunnel error: {:#}. Reconnecting in {}s...",
                    e, client.reconnect_secs
                );
                tokio::select! {
                    _ = tokio::time::sleep(client.reconnect_delay()) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    println!("\n✓ Node stopped.");
    Ok(())
}
