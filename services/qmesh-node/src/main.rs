use anyhow::{bail, Context};
use qmesh_core::{logging, Config};
use qmesh_mesh::{BeaconResponder, Orchestrator, PolicySet, UdpBeaconTransport};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let policies = PolicySet::from_file(&config_path)
        .with_context(|| format!("loading policies from {}", config_path.display()))?;
    logging::init_from_config(&config.node);

    let port = config.discovery.beacon_port;
    let transport = UdpBeaconTransport::bind(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::from((Ipv4Addr::BROADCAST, port)),
    )
    .await
    .context("binding beacon transport")?;
    let responder = BeaconResponder::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .await
        .with_context(|| format!("binding beacon responder on port {port}"))?;

    let orchestrator = Orchestrator::builder(config.clone())
        .policies(policies)
        .beacon_transport(Arc::new(transport))
        .build()?;
    orchestrator.start().await?;

    let beacon = orchestrator
        .local_beacon()
        .context("local beacon missing after start")?;
    let responder_task = responder.spawn(beacon, orchestrator.shutdown_signal());

    tracing::info!(
        node_id = %config.node.node_id,
        address = %config.node.address,
        beacon_port = port,
        "qmesh node started"
    );

    let mut status_ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = status_ticker.tick() => {
                let status = orchestrator.status();
                tracing::info!(
                    overall = ?status.overall,
                    nodes = status.statistics.node_count,
                    active_connections = status.statistics.active_connection_count,
                    routes = status.statistics.route_count,
                    alerts = status.alerts_processed,
                    "Mesh status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    orchestrator.shutdown().await;
    if let Err(e) = responder_task.await {
        tracing::warn!(error = %e, "Beacon responder ended abnormally");
    }
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}
