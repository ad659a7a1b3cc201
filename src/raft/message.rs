//! RPC argument and reply types exchanged between Raft peers.

use serde::{Deserialize, Serialize};

use crate::config::NodeId;
use crate::raft::state::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries; an empty `entries` list is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// On success, the next index the leader should send.
    /// On a log mismatch, where the follower's log starts to diverge.
    pub next_index: u64,
}

/// Any request a peer can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

/// Reply matching a [`RaftRequest`] variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

impl RaftRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RaftRequest::RequestVote(_) => "Raft.RequestVote",
            RaftRequest::AppendEntries(_) => "Raft.AppendEntries",
        }
    }
}
