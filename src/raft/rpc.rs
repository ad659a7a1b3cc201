use crate::config::NodeId;
use crate::persist::Persister;
use crate::raft::message::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply,
};
use crate::raft::state::{RaftRole, RaftState};

/// Handle RequestVote RPC
///
/// Any change to the term or vote is persisted before the reply is built.
/// If that write fails the vote is withdrawn, and the write is retried on
/// every later request until it succeeds.
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &RequestVoteArgs,
    persister: &dyn Persister,
    my_id: NodeId,
) -> RequestVoteReply {
    let mut dirty = false;

    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
        dirty = true;
    }

    let previous_vote = state.voted_for;
    let mut vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.role == RaftRole::Leader {
        // Already leading this term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        if state.voted_for.is_none() {
            state.voted_for = Some(req.candidate_id);
            dirty = true;
        }
        true
    };

    // An earlier failed write is retried before anything depends on it.
    if dirty || state.unsaved {
        if let Err(e) = state.persist(persister) {
            tracing::error!(node_id = my_id, error = %e, "Failed to persist vote");
            if vote_granted {
                state.voted_for = previous_vote;
                vote_granted = false;
            }
        }
    }

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    RequestVoteReply {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC
///
/// On success `next_index` is one past the last entry covered by the
/// request, not the local log length: a follower may still hold a longer,
/// unverified suffix. On a mismatch it is the first index the leader should
/// retry from.
pub fn handle_append_entries(
    state: &mut RaftState,
    req: AppendEntriesArgs,
    persister: &dyn Persister,
    my_id: NodeId,
) -> AppendEntriesReply {
    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return AppendEntriesReply {
            term: state.current_term,
            success: false,
            next_index: state.last_log_index() + 1,
        };
    }

    let mut dirty = false;
    if req.term > state.current_term {
        state.become_follower(req.term);
        dirty = true;
    } else if state.role != RaftRole::Follower {
        // Valid AppendEntries from leader - reset to follower if we're a candidate
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    let prev_log_index = req.prev_log_index;
    let covered = prev_log_index + req.entries.len() as u64;

    let mut reply = if prev_log_index > state.last_log_index() {
        // We don't have the entry at prev_log_index
        AppendEntriesReply {
            term: state.current_term,
            success: false,
            next_index: state.last_log_index() + 1,
        }
    } else if state.term_at(prev_log_index) != Some(req.prev_log_term) {
        // Term mismatch - let the leader skip the whole conflicting term
        AppendEntriesReply {
            term: state.current_term,
            success: false,
            next_index: state.conflict_hint(prev_log_index),
        }
    } else {
        if !req.entries.is_empty() {
            let received = req.entries.len();
            if state.reconcile(prev_log_index, req.entries) {
                dirty = true;
                tracing::debug!(
                    node_id = my_id,
                    entries_received = received,
                    new_last_index = state.last_log_index(),
                    "Appended entries"
                );
            }
        }
        AppendEntriesReply {
            term: state.current_term,
            success: true,
            next_index: covered + 1,
        }
    };

    if dirty || state.unsaved {
        if let Err(e) = state.persist(persister) {
            tracing::error!(node_id = my_id, error = %e, "Failed to persist log");
            reply.success = false;
            reply.next_index = prev_log_index.max(1);
        }
    }

    if reply.success {
        let commit_to = req.leader_commit.min(covered);
        if state.advance_commit_to(commit_to) {
            tracing::debug!(
                node_id = my_id,
                commit_index = state.commit_index,
                "Advanced commit index"
            );
        }
    }

    reply
}
