mod config;
mod error;
mod raft;
mod storage;
mod transport;

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::raft::engine::{ConsensusEngine, Outbound};
use crate::raft::protocol;
use crate::raft::timer::ElectionTimer;
use crate::raft::NodeAddr;
use crate::storage::Store;
use crate::transport::{UdpTransport, MAX_DATAGRAM};

#[derive(Parser, Debug)]
#[command(name = "server", about = "Raft replicated key-value store node")]
struct Args {
    /// UDP port to bind; must appear in config.json
    #[arg(long)]
    port: u16,

    /// Directory holding state.json, log.json and db.json
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=info,raftkv=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load(Path::new("config.json"))?;
    config.require_member(args.port)?;

    let store = Store::open(&args.data_dir)?;
    let id = NodeAddr::new("127.0.0.1", args.port);
    let peers = config.peers(args.port);
    let timer = ElectionTimer::new(
        config.election_timeout_min_ms,
        config.election_timeout_max_ms,
        Instant::now(),
    );
    let mut engine = ConsensusEngine::new(id, peers, store, timer);

    let transport = UdpTransport::bind(args.port).await?;
    info!(port = args.port, cluster = config.ports.len(), "server listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let deadline = tokio::time::Instant::now()
            + engine.deadline().saturating_duration_since(Instant::now());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(leader = engine.is_leader(), "interrupt received, shutting down");
                return Ok(());
            }

            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                if engine.is_timed_out(now) {
                    let outbound = engine.on_tick(now)?;
                    send_all(&transport, outbound).await;
                }
            }

            received = transport.recv(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        let sender = NodeAddr::new(from.ip().to_string(), from.port());
                        for decoded in protocol::decode_datagram(&buf[..len]) {
                            match decoded {
                                Ok(rpc) => {
                                    let outbound = engine.on_receive(rpc, sender.clone(), Instant::now())?;
                                    send_all(&transport, outbound).await;
                                }
                                Err(e) => warn!(from = %sender, "dropping rpc: {}", e),
                            }
                        }
                    }
                    Err(e) => warn!("socket receive failed: {}", e),
                }
            }
        }

        engine.apply_commits()?;
    }
}

async fn send_all(transport: &UdpTransport, outbound: Vec<Outbound>) {
    for out in outbound {
        match protocol::encode(&out.rpc) {
            Ok(line) => transport.send(&line, &out.dest).await,
            Err(e) => error!(dest = %out.dest, "failed to encode rpc: {}", e),
        }
    }
}
