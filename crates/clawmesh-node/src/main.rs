//! clawmesh node binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use clawmesh_node::{ForwardSink, MeshNode, NodeOptions};
use clawmesh_types::config::MeshConfig;
use clawmesh_types::ForwardPayload;

struct CliArgs {
    listen: SocketAddr,
    state_dir: PathBuf,
    config_path: Option<PathBuf>,
    display_name: Option<String>,
    no_multicast: bool,
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clawmesh")
}

fn parse_args() -> CliArgs {
    let mut cli = CliArgs {
        listen: "0.0.0.0:7430".parse().expect("static default addr"),
        state_dir: default_state_dir(),
        config_path: None,
        display_name: None,
        no_multicast: false,
    };
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "-l" => {
                if let Some(addr) = args.next() {
                    cli.listen = addr.parse().unwrap_or_else(|_| {
                        eprintln!("Invalid listen address: {addr}");
                        std::process::exit(1);
                    });
                }
            }
            "--state-dir" | "-s" => {
                if let Some(dir) = args.next() {
                    cli.state_dir = PathBuf::from(dir);
                }
            }
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    cli.config_path = Some(PathBuf::from(path));
                }
            }
            "--name" | "-n" => {
                cli.display_name = args.next();
            }
            "--no-multicast" => {
                cli.no_multicast = true;
            }
            "--help" | "-h" => {
                eprintln!("clawmesh node");
                eprintln!();
                eprintln!("USAGE:");
                eprintln!("  clawmesh-node [OPTIONS]");
                eprintln!();
                eprintln!("OPTIONS:");
                eprintln!("  -l, --listen <ADDR>      Listen address (default: 0.0.0.0:7430)");
                eprintln!("  -s, --state-dir <PATH>   State directory (default: ~/.clawmesh)");
                eprintln!("  -c, --config <PATH>      Mesh config TOML");
                eprintln!("  -n, --name <NAME>        Display name for this node");
                eprintln!("  --no-multicast           Disable multicast discovery");
                eprintln!("  -h, --help               Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    cli
}

/// Default sink: log accepted forwards. Real deployments replace this
/// with channel or actuator adapters.
struct LoggingSink;

#[async_trait]
impl ForwardSink for LoggingSink {
    async fn deliver(&self, payload: &ForwardPayload) -> Result<(), String> {
        info!(
            channel = %payload.channel,
            to = %payload.to,
            has_command = payload.command.is_some(),
            "forward accepted (no sink configured, logging only)"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,clawmesh=debug".into()),
        )
        .init();

    let cli = parse_args();

    let config = match &cli.config_path {
        Some(path) => MeshConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MeshConfig::default(),
    };
    if !config.enabled {
        info!("mesh disabled in configuration, exiting");
        return Ok(());
    }

    let mut options = NodeOptions::new(cli.listen, cli.state_dir);
    options.display_name = cli.display_name;
    options.enable_multicast = !cli.no_multicast;
    options.config = config;

    let node = MeshNode::new(options, Arc::new(LoggingSink)).context("failed to build node")?;
    node.start().await.context("failed to start node")?;

    info!(
        device_id = %node.device_id(),
        addr = ?node.local_addr(),
        "clawmesh node running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    node.stop().await;
    Ok(())
}
