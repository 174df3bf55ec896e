//! MeshLink node binary
//!
//! Creates and validates node configuration and runs in-process mesh
//! simulations over the memory transport.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshlink_protocol::{Destination, MessageType, PeerId};
use meshnode::{Collaborators, Config, MemoryNetwork, MeshEvent, MeshNode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshnode")]
#[command(about = "Self-organizing mesh node")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "MESHNODE_CONFIG", default_value = "meshnode.yaml")]
    config: PathBuf,

    /// Write a default configuration and exit
    #[arg(long)]
    init: bool,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration
    ShowConfig,
    /// Run a chain of nodes over the in-process transport
    Simulate {
        /// Nodes in the chain
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Messages sent from the first node to the last
        #[arg(short, long, default_value = "3")]
        messages: usize,

        /// Seconds allowed for topology to settle
        #[arg(long, default_value = "3")]
        settle_secs: u64,
    },
}

#[derive(Debug, Serialize)]
struct NodeReport {
    id: String,
    slots: meshlink_slots::SlotStatus,
    routes: Vec<meshlink_routing::RouteSummary>,
    stats: meshlink_routing::RouterStats,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    sent: usize,
    delivered: usize,
    failed: usize,
    nodes: Vec<NodeReport>,
}

fn init_logging(config: &Config, override_level: Option<&str>) {
    let level = override_level.unwrap_or(config.logging.level.as_str());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(&args.config)?;
        println!("Created configuration at {}", config.config_path().display());
        return Ok(());
    }

    let config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        match args.command {
            // Simulations can run on defaults
            Some(Command::Simulate { .. }) | None => Config::default(),
            Some(Command::ShowConfig) => Config::load(&args.config)?,
        }
    };
    init_logging(&config, args.log_level.as_deref());

    match args.command.unwrap_or(Command::Simulate {
        nodes: 4,
        messages: 3,
        settle_secs: 3,
    }) {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            nodes,
            messages,
            settle_secs,
        } => {
            let report = simulate(&config, nodes, messages, Duration::from_secs(settle_secs)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn simulate(
    template: &Config,
    count: usize,
    messages: usize,
    settle: Duration,
) -> Result<SimulationReport> {
    if count < 2 {
        anyhow::bail!("A simulation needs at least two nodes");
    }
    info!("Simulating a chain of {} nodes", count);

    let network = MemoryNetwork::new();
    let mut ids = Vec::with_capacity(count);
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let mut config = template.clone();
        config.node.id = format!("node-{}", i);
        let id = config.peer_id()?;

        let (transport, events) = network.attach(id.clone());
        let node = MeshNode::start(&config, transport, events, Collaborators::standalone(&config))
            .await
            .with_context(|| format!("Failed to start {}", id))?;
        ids.push(id);
        nodes.push(node);
    }

    for pair in ids.windows(2) {
        network.link(&pair[0], &pair[1]);
    }
    tokio::time::sleep(settle).await;

    let first = &nodes[0];
    let last: &PeerId = &ids[count - 1];
    let mut events = first.subscribe();
    for i in 0..messages {
        first
            .send_message(
                format!("message {}", i).into_bytes(),
                MessageType::Chat,
                Destination::Peer(last.clone()),
                true,
            )
            .await?;
    }

    let (mut delivered, mut failed) = (0, 0);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while delivered + failed < messages {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(MeshEvent::MessageDelivered { .. })) => delivered += 1,
            Ok(Ok(MeshEvent::MessageFailed { .. })) => failed += 1,
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                warn!("Missed {} node events", missed);
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => {
                warn!("Timed out waiting for acknowledgements");
                break;
            }
        }
    }

    let mut reports = Vec::with_capacity(count);
    for (id, node) in ids.iter().zip(&nodes) {
        reports.push(NodeReport {
            id: id.to_string(),
            slots: node.slot_status(),
            routes: node.routing_summary().await,
            stats: node.router_stats().await,
        });
    }
    for node in &nodes {
        node.shutdown().await;
    }

    Ok(SimulationReport {
        sent: messages,
        delivered,
        failed,
        nodes: reports,
    })
}
