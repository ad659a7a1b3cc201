use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use raft_lite::config::{parse_peers, NodeConfig, RaftConfig};
use raft_lite::persist::FilePersister;
use raft_lite::raft::{ApplyMsg, RaftNode};
use raft_lite::shutdown::install_shutdown_handler;
use raft_lite::transport::tcp::{serve, TcpTransport};
use raft_lite::transport::{RaftService, RaftTransport};

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "A Raft consensus participant")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a node; each line read from stdin is proposed as a command
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for Raft RPCs
    #[arg(long, default_value = "7100")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:7101,3:127.0.0.1:7102"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for the persisted Raft state
    #[arg(long, default_value = "raft-data")]
    data_dir: PathBuf,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "200")]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "700")]
    election_timeout_max_ms: u64,

    /// Leader heartbeat interval
    #[arg(long, default_value = "100")]
    heartbeat_interval_ms: u64,

    /// Timeout for a single outbound RPC
    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,
}

impl ServerArgs {
    fn into_config(self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        let listen_addr: SocketAddr = format!("0.0.0.0:{}", self.port).parse()?;
        let raft = RaftConfig::new(self.node_id)
            .with_election_timeout(self.election_timeout_min_ms, self.election_timeout_max_ms)
            .with_heartbeat_interval(self.heartbeat_interval_ms);

        let config = NodeConfig {
            raft,
            listen_addr,
            peers: parse_peers(&self.peers)?,
            data_dir: self.data_dir,
            rpc_timeout_ms: self.rpc_timeout_ms,
        };
        config.validate()?;
        Ok(config)
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config()?;

    tracing::info!(
        node_id = config.raft.node_id,
        listen_addr = %config.listen_addr,
        state_path = %config.state_path().display(),
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting raft-lite node"
    );

    let persister = Arc::new(FilePersister::new(config.state_path())?);
    let peers: HashMap<_, Arc<dyn RaftTransport>> = config
        .peers
        .iter()
        .map(|peer| {
            let transport: Arc<dyn RaftTransport> = Arc::new(TcpTransport::new(
                peer.node_id,
                peer.addr.clone(),
                config.rpc_timeout(),
            ));
            (peer.node_id, transport)
        })
        .collect();

    let (apply_tx, apply_rx) = mpsc::channel(256);
    let node = RaftNode::make(config.raft.clone(), peers, persister, apply_tx);
    let shutdown = install_shutdown_handler();

    let service: Arc<dyn RaftService> = node.clone();
    let server = tokio::spawn(serve(config.listen_addr, service, shutdown.clone()));
    tokio::spawn(log_applied(config.raft.node_id, apply_rx));

    let commands = tokio::spawn({
        let node = node.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = read_commands(&node, &shutdown).await {
                tracing::error!(error = %e, "Failed to read commands from stdin");
            }
        }
    });

    let result = supervise(&node, server, &shutdown).await;
    commands.abort();
    result?;
    tracing::info!(node_id = config.raft.node_id, "Shutdown complete");
    Ok(())
}

/// Run until shutdown is requested or the RPC server stops on its own,
/// whichever comes first. The node is killed either way.
async fn supervise(
    node: &RaftNode,
    mut server: JoinHandle<raft_lite::error::Result<()>>,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let stopped_early = tokio::select! {
        _ = shutdown.cancelled() => None,
        served = &mut server => Some(served),
    };
    node.kill();

    let served = match stopped_early {
        Some(served) => {
            tracing::error!(node_id = node.id(), "Raft RPC server stopped, shutting down");
            shutdown.cancel();
            served
        }
        None => server.await,
    };
    served??;
    Ok(())
}

/// Propose every non-empty stdin line until stdin closes or shutdown begins.
async fn read_commands(node: &RaftNode, shutdown: &CancellationToken) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::debug!("stdin closed, no more commands");
            return Ok(());
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        let (index, term, is_leader) = node.start(command.as_bytes().to_vec()).await;
        if is_leader {
            tracing::info!(index, term, command, "Command accepted");
        } else {
            let leader_id = node.leader_id().await;
            tracing::warn!(term, leader_id = ?leader_id, command, "Not leader, command dropped");
        }
    }
}

async fn log_applied(node_id: u64, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
    while let Some(msg) = apply_rx.recv().await {
        tracing::info!(
            node_id,
            index = msg.index,
            command = %String::from_utf8_lossy(&msg.command),
            "Applied entry"
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
    }

    Ok(())
}
