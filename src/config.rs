use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Identifier of a node within the cluster.
pub type NodeId = u64;

/// Timing and identity settings for a single Raft participant.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Interval between leader heartbeats when replication is idle.
    pub heartbeat_interval_ms: u64,
    /// Pause between two replication rounds on the leader.
    pub replication_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            election_timeout_min_ms: 200,
            election_timeout_max_ms: 700,
            heartbeat_interval_ms: 100,
            replication_interval_ms: 10,
        }
    }
}

impl RaftConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }

    /// How long a replication round waits for replies before moving on.
    pub fn append_round_timeout(&self) -> Duration {
        Duration::from_millis((self.election_timeout_min_ms / 4).max(1))
    }

    /// Reject settings that would make elections unstable.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(RaftError::Config(
                "election timeout must be positive".to_string(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::Config(format!(
                "election timeout range is inverted: {}..{}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be shorter than the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String, // host:port format, supports both IP and hostnames
}

/// Settings for running a node as a standalone TCP server.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub raft: RaftConfig,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// Directory holding the persisted state blob.
    pub data_dir: PathBuf,
    /// Per-call timeout for outbound RPCs.
    pub rpc_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            raft: RaftConfig::default(),
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:7100"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            data_dir: PathBuf::from("raft-data"),
            rpc_timeout_ms: 100,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            raft: RaftConfig::new(node_id),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// File that holds this node's persisted state.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("node-{}.json", self.raft.node_id))
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        if self.peers.iter().any(|p| p.node_id == self.raft.node_id) {
            return Err(RaftError::Config(format!(
                "node {} lists itself as a peer",
                self.raft.node_id
            )));
        }
        Ok(())
    }
}

/// Parse a comma-separated peer list of the form `id:host:port`.
pub fn parse_peers(peers_str: &str) -> Result<Vec<PeerConfig>> {
    if peers_str.trim().is_empty() {
        return Ok(Vec::new());
    }

    peers_str
        .split(',')
        .map(|peer| {
            let peer = peer.trim();
            let (id, addr) = peer.split_once(':').ok_or_else(|| {
                RaftError::Config(format!("invalid peer {peer:?}, expected id:host:port"))
            })?;
            let node_id: NodeId = id
                .parse()
                .map_err(|_| RaftError::Config(format!("invalid peer id {id:?}")))?;
            if !addr.contains(':') {
                return Err(RaftError::Config(format!(
                    "invalid peer address {addr:?}, expected host:port"
                )));
            }
            Ok(PeerConfig {
                node_id,
                addr: addr.to_string(),
            })
        })
        .collect()
}
