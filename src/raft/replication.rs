use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::NodeId;
use crate::raft::message::{AppendEntriesArgs, AppendEntriesReply};
use crate::raft::node::RaftNode;
use crate::raft::state::{RaftRole, RaftState};
use crate::transport::send_append_entries;

impl RaftNode {
    /// Leader-side replication for `term`.
    ///
    /// Every round sends each peer the suffix of the log it is missing and
    /// folds the replies back into `next_index`/`match_index`. The loop ends
    /// as soon as this node is no longer leader of `term`.
    pub(super) async fn replicate(self: Arc<Self>, term: u64) {
        tracing::debug!(node_id = self.id, term, "Replication started");

        loop {
            let requests = {
                let mut state = self.state.lock().await;
                if self.is_killed() || !is_leader_of(&state, term) {
                    break;
                }
                // Without peers our own log is the majority.
                if self.peers.is_empty() && state.advance_leader_commit() {
                    self.notify_commit(state.commit_index);
                }
                self.peers
                    .keys()
                    .map(|&peer_id| (peer_id, self.append_args(&state, peer_id, true)))
                    .collect::<Vec<_>>()
            };

            if !requests.is_empty() && !self.replication_round(term, requests).await {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.replication_interval()) => {}
            }
        }

        tracing::debug!(node_id = self.id, term, "Replication stopped");
    }

    /// Send one batch of AppendEntries and apply the replies that arrive in
    /// time. Returns `false` once leadership of `term` is lost.
    async fn replication_round(
        self: &Arc<Self>,
        term: u64,
        requests: Vec<(NodeId, AppendEntriesArgs)>,
    ) -> bool {
        let (tx, mut rx) = mpsc::channel(requests.len());
        for (peer_id, args) in requests {
            let Some(transport) = self.peers.get(&peer_id).cloned() else {
                continue;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = send_append_entries(transport.as_ref(), args).await;
                let _ = tx.send((peer_id, reply)).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.config.append_round_timeout());
        tokio::pin!(deadline);
        let mut reached_peer = false;

        loop {
            let (peer_id, reply) = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                // Peers that did not answer are retried next round.
                _ = &mut deadline => break,
                received = rx.recv() => match received {
                    Some(received) => received,
                    None => break,
                },
            };
            let Some(reply) = reply else {
                tracing::trace!(node_id = self.id, peer_id, "AppendEntries lost");
                continue;
            };
            reached_peer = true;
            if !self.handle_append_reply(term, peer_id, reply).await {
                return false;
            }
        }

        if reached_peer {
            self.reset.notify_one();
        }
        true
    }

    /// Send empty AppendEntries to every peer without waiting for replies.
    pub(super) async fn broadcast_heartbeats(self: &Arc<Self>) {
        let (term, requests) = {
            let state = self.state.lock().await;
            if state.role != RaftRole::Leader {
                return;
            }
            let requests: Vec<_> = self
                .peers
                .keys()
                .map(|&peer_id| (peer_id, self.append_args(&state, peer_id, false)))
                .collect();
            (state.current_term, requests)
        };

        for (peer_id, args) in requests {
            let Some(transport) = self.peers.get(&peer_id).cloned() else {
                continue;
            };
            let node = self.clone();
            tokio::spawn(async move {
                if let Some(reply) = send_append_entries(transport.as_ref(), args).await {
                    node.handle_append_reply(term, peer_id, reply).await;
                }
            });
        }
    }

    /// AppendEntries for `peer_id` based on its `next_index`.
    fn append_args(&self, state: &RaftState, peer_id: NodeId, with_entries: bool) -> AppendEntriesArgs {
        let last_log_index = state.last_log_index();
        let next_index = state
            .next_index
            .get(&peer_id)
            .copied()
            .unwrap_or(last_log_index + 1)
            .clamp(1, last_log_index + 1);
        let prev_log_index = next_index - 1;

        AppendEntriesArgs {
            term: state.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: state.term_at(prev_log_index).unwrap_or(0),
            entries: if with_entries {
                state.entries_from(next_index)
            } else {
                Vec::new()
            },
            leader_commit: state.commit_index,
        }
    }

    /// Fold one AppendEntries reply into the leader state.
    ///
    /// Returns `false` if this node is no longer leader of `term`.
    pub(super) async fn handle_append_reply(
        &self,
        term: u64,
        peer_id: NodeId,
        reply: AppendEntriesReply,
    ) -> bool {
        let mut state = self.state.lock().await;
        if !is_leader_of(&state, term) {
            return false;
        }

        if reply.term > state.current_term {
            tracing::info!(
                node_id = self.id,
                term,
                peer_id,
                peer_term = reply.term,
                "Higher term seen, stepping down"
            );
            state.become_follower(reply.term);
            self.persist_or_log(&mut state);
            return false;
        }

        let last_log_index = state.last_log_index();
        if reply.success {
            let matched = reply.next_index.saturating_sub(1).min(last_log_index);
            let match_index = state.match_index.entry(peer_id).or_insert(0);
            *match_index = (*match_index).max(matched);
            state.next_index.insert(peer_id, matched + 1);

            if state.advance_leader_commit() {
                tracing::debug!(
                    node_id = self.id,
                    term,
                    commit_index = state.commit_index,
                    "Updated commit index"
                );
                self.notify_commit(state.commit_index);
            }
        } else {
            let next_index = reply.next_index.clamp(1, last_log_index + 1);
            tracing::trace!(node_id = self.id, peer_id, next_index, "Backing off next_index");
            state.next_index.insert(peer_id, next_index);
        }
        true
    }
}

fn is_leader_of(state: &RaftState, term: u64) -> bool {
    state.role == RaftRole::Leader && state.current_term == term
}
