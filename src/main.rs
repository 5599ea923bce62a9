use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use apiary::{HiveConfig, HiveNode, PeerId, Ticket};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    peer_id: PeerId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include identity (format: IP:PORT/IDENTITY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let peer_id =
            PeerId::from_hex(id_part).context("identity must be 64 hex characters (32 bytes)")?;

        Ok(BootstrapPeer { addr, peer_id })
    }
}

#[derive(Parser, Debug)]
#[command(name = "apiary")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Existing hive member to join through (IP:PORT/IDENTITY).
    #[arg(short = 'j', long = "join", value_name = "PEER")]
    join: Option<BootstrapPeer>,

    /// Hex-encoded invitation ticket, required when joining.
    #[arg(short = 't', long = "ticket")]
    ticket: Option<String>,

    /// Found a brand-new hive with this node as admin.
    #[arg(long)]
    genesis: bool,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = HiveNode::bind(&args.bind.to_string(), HiveConfig::new()).await?;
    info!("node identity: {}", node.identity());

    if args.genesis {
        node.bootstrap_genesis().await;
    }

    if let Some(peer) = &args.join {
        let ticket_hex = args
            .ticket
            .as_deref()
            .context("--ticket is required with --join")?;
        let ticket_bytes = hex::decode(ticket_hex).context("ticket must be hex")?;
        let ticket = Ticket::decode(&ticket_bytes)
            .map_err(|e| anyhow::anyhow!("invalid ticket: {e}"))?;

        info!("joining via {}/{}", peer.addr, &peer.peer_id.short_hex());
        match node.join(peer.peer_id, peer.addr, ticket).await {
            Ok(()) => info!("handshake started"),
            Err(e) => warn!(error = %e, "join failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, departing gracefully");
                break;
            }
            _ = interval.tick() => {
                let status = node.status().await;
                info!(
                    members = status.member_count,
                    entries = status.entry_count,
                    capacity_msat = status.total_capacity_msat,
                    intents = status.pending_intents,
                    connected = status.connected_peers,
                    degraded = status.fee_bridge_degraded,
                    autonomous = status.autonomous,
                    "status"
                );
            }
        }
    }

    node.depart().await;
    Ok(())
}
