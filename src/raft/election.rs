use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::raft::message::RequestVoteArgs;
use crate::raft::node::RaftNode;
use crate::raft::state::RaftRole;
use crate::transport::send_request_vote;

impl RaftNode {
    /// Start a new election and wait for it to resolve.
    ///
    /// Votes are collected until a majority is reached, a higher term is
    /// seen, every peer has answered, or `deadline` passes. A candidate that
    /// neither wins nor sees a higher term goes back to being a follower and
    /// waits for the next timeout.
    pub(super) async fn run_election(self: &Arc<Self>, deadline: Duration) {
        let args = {
            let mut state = self.state.lock().await;
            if self.is_killed() || state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate(self.id);
            if let Err(e) = state.persist(self.persister.as_ref()) {
                tracing::error!(node_id = self.id, term = state.current_term, error = %e, "Failed to persist candidacy");
                let term = state.current_term;
                state.become_follower(term);
                return;
            }

            if self.peers.is_empty() {
                let term = state.current_term;
                state.become_leader(self.id, &[]);
                tracing::info!(node_id = self.id, term, "Became leader of single-node cluster");
                drop(state);
                tokio::spawn(self.clone().replicate(term));
                return;
            }

            RequestVoteArgs {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };
        let term = args.term;
        let majority = (self.peers.len() as u64 + 1) / 2 + 1;

        tracing::info!(node_id = self.id, term, "Starting election");

        let (tx, mut rx) = mpsc::channel(self.peers.len());
        for (&peer_id, transport) in &self.peers {
            let transport = transport.clone();
            let args = args.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = send_request_vote(transport.as_ref(), args).await;
                let _ = tx.send((peer_id, reply)).await;
            });
        }
        drop(tx);

        let timeout = tokio::time::sleep(deadline);
        tokio::pin!(timeout);

        loop {
            let (peer_id, reply) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = &mut timeout => break,
                received = rx.recv() => match received {
                    Some(received) => received,
                    // Every peer answered or failed.
                    None => break,
                },
            };
            let Some(reply) = reply else {
                tracing::trace!(node_id = self.id, peer_id, "Vote request lost");
                continue;
            };

            let mut state = self.state.lock().await;
            if state.role != RaftRole::Candidate || state.current_term != term {
                // Stepped down or moved on while waiting.
                return;
            }

            if reply.term > state.current_term {
                tracing::info!(
                    node_id = self.id,
                    term,
                    peer_id,
                    peer_term = reply.term,
                    "Higher term seen during election, stepping down"
                );
                state.become_follower(reply.term);
                self.persist_or_log(&mut state);
                return;
            }

            if reply.vote_granted {
                state.votes_received += 1;
                tracing::debug!(
                    node_id = self.id,
                    peer_id,
                    votes = state.votes_received,
                    "Received vote"
                );
                if state.votes_received >= majority {
                    let votes = state.votes_received;
                    let peer_ids: Vec<_> = self.peers.keys().copied().collect();
                    state.become_leader(self.id, &peer_ids);
                    tracing::info!(node_id = self.id, term, votes, "Became leader");
                    drop(state);
                    tokio::spawn(self.clone().replicate(term));
                    return;
                }
            }
        }

        let mut state = self.state.lock().await;
        if state.role == RaftRole::Candidate && state.current_term == term {
            tracing::debug!(
                node_id = self.id,
                term,
                votes = state.votes_received,
                needed = majority,
                "Election failed, not enough votes"
            );
            state.become_follower(term);
        }
    }
}
