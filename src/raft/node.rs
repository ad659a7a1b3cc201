use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{NodeId, RaftConfig};
use crate::persist::{restore_state, Persister};
use crate::raft::message::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply,
};
use crate::raft::rpc::{handle_append_entries, handle_request_vote};
use crate::raft::state::{LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::transport::{RaftService, RaftTransport};

/// A committed entry handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub command: Vec<u8>,
    pub index: u64,
}

/// One participant in a Raft cluster.
///
/// All mutable protocol state sits behind a single lock. Background work is
/// split into three kinds of tasks: the role loop ([`RaftNode::run`]), the
/// apply loop, and one replication loop per term in which this node leads.
/// They all stop once [`RaftNode::kill`] is called.
pub struct RaftNode {
    pub(super) id: NodeId,
    pub(super) config: RaftConfig,
    pub(super) peers: HashMap<NodeId, Arc<dyn RaftTransport>>,
    pub(super) state: Mutex<RaftState>,
    pub(super) persister: Arc<dyn Persister>,
    /// Wakes the role loop early: a leader was heard, a vote was granted,
    /// or (while leading) a replication round reached a peer.
    pub(super) reset: Notify,
    /// Latest commit index, watched by the apply loop.
    pub(super) commit_tx: watch::Sender<u64>,
    pub(super) cancel: CancellationToken,
}

impl RaftNode {
    /// Create a node, restore its persisted state and start its background
    /// tasks. Must be called from within a tokio runtime.
    ///
    /// `peers` holds a transport for every other member of the cluster.
    /// Committed entries are sent to `apply_tx` in index order.
    pub fn make(
        config: RaftConfig,
        peers: HashMap<NodeId, Arc<dyn RaftTransport>>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Arc<Self> {
        let id = config.node_id;
        let mut state = RaftState::new();
        if let Some(persisted) = restore_state(persister.as_ref(), id) {
            tracing::info!(
                node_id = id,
                term = persisted.current_term,
                log_len = persisted.log.len(),
                "Restored persisted state"
            );
            state.restore(persisted);
        }

        let (commit_tx, commit_rx) = watch::channel(0);
        let node = Arc::new(Self {
            id,
            config,
            peers,
            state: Mutex::new(state),
            persister,
            reset: Notify::new(),
            commit_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(node.clone().run());
        tokio::spawn(node.clone().apply_loop(apply_tx, commit_rx));

        tracing::info!(node_id = id, peers = node.peers.len(), "Raft node started");
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Propose `command` for the log.
    ///
    /// Returns the index the entry will occupy if it is ever committed, the
    /// current term, and whether this node accepted it as leader. Nothing is
    /// appended unless the last value is `true`.
    pub async fn start(&self, command: Vec<u8>) -> (u64, u64, bool) {
        let mut state = self.state.lock().await;
        let index = state.last_log_index() + 1;
        let term = state.current_term;

        if self.is_killed() || state.role != RaftRole::Leader {
            return (index, term, false);
        }

        state.append_entry(command);
        if let Err(e) = state.persist(self.persister.as_ref()) {
            tracing::error!(node_id = self.id, index, error = %e, "Failed to persist new entry");
            state.log.pop();
            return (index, term, false);
        }

        tracing::debug!(node_id = self.id, index, term, "Appended command to log");
        (index, term, true)
    }

    /// Current term and whether this node believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    /// Stop all background work. In-flight RPCs are abandoned.
    pub fn kill(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(node_id = self.id, "Raft node killed");
        }
        self.cancel.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Copy of the log, for diagnostics and tests.
    pub async fn log(&self) -> Vec<LogEntry> {
        self.state.lock().await.log.clone()
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.commit_index
    }

    pub async fn role(&self) -> RaftRole {
        self.state.lock().await.role
    }

    /// Get the current leader ID
    pub async fn leader_id(&self) -> Option<NodeId> {
        let state = self.state.lock().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    /// Run the role loop until killed.
    async fn run(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                break;
            }
            let role = self.state.lock().await.role;

            if role == RaftRole::Leader {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    // A replication round reached a peer; nothing to do.
                    _ = self.reset.notified() => {}
                    _ = tokio::time::sleep(self.config.heartbeat_interval()) => {
                        self.broadcast_heartbeats().await;
                    }
                }
            } else {
                let election_timeout = random_election_timeout(&self.config);
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.reset.notified() => {}
                    _ = tokio::time::sleep(election_timeout) => {
                        tracing::info!(
                            node_id = self.id,
                            timeout_ms = election_timeout.as_millis() as u64,
                            "Election timeout, starting election"
                        );
                        self.run_election(election_timeout).await;
                    }
                }
            }
        }
        tracing::debug!(node_id = self.id, "Role loop stopped");
    }

    /// Deliver committed entries to the application, strictly in order.
    async fn apply_loop(
        self: Arc<Self>,
        apply_tx: mpsc::Sender<ApplyMsg>,
        mut commit_rx: watch::Receiver<u64>,
    ) {
        loop {
            // Mark the current value seen before reading the state, so an
            // advance after this point is never missed.
            commit_rx.borrow_and_update();
            let pending: Vec<LogEntry> = {
                let state = self.state.lock().await;
                (state.last_applied + 1..=state.commit_index)
                    .filter_map(|index| state.get_entry(index).cloned())
                    .collect()
            };

            if pending.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = commit_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            for entry in pending {
                let index = entry.index;
                let msg = ApplyMsg {
                    command: entry.command,
                    index,
                };
                // A full queue must not keep a killed node alive.
                let sent = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::debug!(node_id = self.id, index, "Apply loop stopped before delivery");
                        return;
                    }
                    sent = apply_tx.send(msg) => sent,
                };
                if sent.is_err() {
                    tracing::warn!(node_id = self.id, index, "Apply channel closed, stopping apply loop");
                    return;
                }
                let mut state = self.state.lock().await;
                state.last_applied = state.last_applied.max(index);
                tracing::trace!(node_id = self.id, index, "Applied entry");
            }
        }
        tracing::debug!(node_id = self.id, "Apply loop stopped");
    }

    /// Wake the apply loop if the commit index moved past what it last saw.
    pub(super) fn notify_commit(&self, commit_index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    /// Persist the state or log why it could not be.
    pub(super) fn persist_or_log(&self, state: &mut RaftState) {
        if let Err(e) = state.persist(self.persister.as_ref()) {
            tracing::error!(node_id = self.id, term = state.current_term, error = %e, "Failed to persist state");
        }
    }
}

#[async_trait]
impl RaftService for RaftNode {
    /// Handle incoming RequestVote RPC
    async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().await;
        if self.is_killed() {
            return RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            };
        }

        let reply = handle_request_vote(&mut state, &args, self.persister.as_ref(), self.id);

        // Reset election timeout if we granted vote
        if reply.vote_granted {
            self.reset.notify_one();
        }

        reply
    }

    /// Handle incoming AppendEntries RPC
    async fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.state.lock().await;
        if self.is_killed() {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                next_index: state.last_log_index() + 1,
            };
        }

        let term = args.term;
        let reply = handle_append_entries(&mut state, args, self.persister.as_ref(), self.id);

        // Any request from the current leader counts as a heartbeat
        if term >= state.current_term {
            self.reset.notify_one();
        }
        if reply.success {
            self.notify_commit(state.commit_index);
        }

        reply
    }
}
