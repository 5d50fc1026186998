//! gossip-node: seed, peer, or a whole in-process network.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gossip_core::{EventBus, NodeRole, Subscription};
use gossip_node::{Cluster, FileSink, LaunchPlan, NodeConfig, PeerNode, SeedServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gossip-node")]
#[command(about = "Seed-based gossip network node")]
struct Args {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a seed node
    Seed {
        /// Address to listen on, `host:port` or `[ipv6]:port`
        #[arg(short, long, default_value = "127.0.0.1:6000")]
        listen: String,

        /// Directory for the node's log file
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Run a peer node
    Peer {
        /// Address to listen on, `host:port` or `[ipv6]:port` (also the address announced to others)
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        listen: String,

        /// JSON configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run seeds and peers together in this process
    Launch {
        /// Number of seed nodes
        #[arg(long, default_value_t = 4)]
        seeds: usize,

        /// Number of peer nodes
        #[arg(long, default_value_t = 3)]
        peers: usize,

        /// First seed port
        #[arg(long, default_value_t = 6000)]
        seed_port: u16,

        /// First peer port
        #[arg(long, default_value_t = 8000)]
        peer_port: u16,

        /// Disconnect the first peer after this many seconds
        #[arg(long)]
        disconnect_after: Option<u64>,

        /// JSON configuration file shared by all peers
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,gossip_node=debug,gossip_core=debug"
    } else {
        "info,gossip_node=info,gossip_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bus = Arc::new(EventBus::new());

    match args.command {
        Command::Seed { listen, log_dir } => {
            let mut seed = SeedServer::start(&listen, Arc::clone(&bus)).await?;
            let _sink = attach_sink(&bus, log_dir.as_deref(), NodeRole::Seed, seed.address().port())?;
            wait_for_ctrl_c().await?;
            seed.shutdown();
        }
        Command::Peer { listen, config } => {
            let config = NodeConfig::load_or_default(config.as_deref())?;
            let log_dir = config.log_dir.clone();
            let peer = PeerNode::start(config, &listen, Arc::clone(&bus)).await?;
            let _sink = attach_sink(&bus, log_dir.as_deref(), NodeRole::Peer, peer.address().port())?;
            wait_for_ctrl_c().await?;
            peer.shutdown();
        }
        Command::Launch {
            seeds,
            peers,
            seed_port,
            peer_port,
            disconnect_after,
            config,
        } => {
            let config = NodeConfig::load_or_default(config.as_deref())?;
            let plan = LaunchPlan {
                seeds,
                peers,
                seed_port,
                peer_port,
                disconnect_after: disconnect_after.map(Duration::from_secs),
                ..LaunchPlan::default()
            };

            // One file per node, keyed by the port in each entry
            let _sink = match &config.log_dir {
                Some(dir) => Some(FileSink::attach_per_node(&bus, dir)?),
                None => None,
            };

            let mut cluster = Cluster::launch(&plan, &config, Arc::clone(&bus)).await?;
            info!(
                "Launched {} seed(s) and {} peer(s)",
                cluster.seeds().len(),
                cluster.peers().len()
            );
            wait_for_ctrl_c().await?;
            cluster.shutdown();
        }
    }

    info!("Shutting down");
    Ok(())
}

fn attach_sink(
    bus: &Arc<EventBus>,
    dir: Option<&Path>,
    role: NodeRole,
    port: u16,
) -> Result<Option<Subscription>> {
    dir.map(|dir| {
        FileSink::attach(bus, dir, role, port)
            .with_context(|| format!("Failed to open log file in {}", dir.display()))
    })
    .transpose()
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Received ctrl-c");
    Ok(())
}
