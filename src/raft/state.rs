use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::NodeId;
use crate::error::Result;
use crate::persist::{PersistentState, Persister};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// All mutable state of one node, guarded by a single lock.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term:
/// - `voted_for` is set at most once per term and only cleared when the term grows
/// - A candidate needs votes from a strict majority, itself included
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, the logs are
/// identical up through that index:
/// - `AppendEntries` checks `(prev_log_index, prev_log_term)` before touching the log
/// - `reconcile` only truncates at the first entry whose term disagrees
///
/// ## Leader Completeness
/// A committed entry is present in the logs of all later leaders:
/// - Votes require an up-to-date log (`is_log_up_to_date`)
/// - A leader only commits by counting replicas for entries of its own term
///
/// ## State Machine Safety
/// - `last_applied <= commit_index`, and `commit_index` never decreases
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<NodeId, u64>,
    pub match_index: HashMap<NodeId, u64>,

    pub role: RaftRole,

    // Leader we last accepted AppendEntries from
    pub leader_id: Option<NodeId>,

    // Votes received in current election (for candidates)
    pub votes_received: u64,

    /// The persistent fields changed and the last save of them failed.
    pub unsaved: bool,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            unsaved: false,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Get entries starting from index (inclusive)
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(1) as usize - 1;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// Append a command at the end of the log in the current term
    pub fn append_entry(&mut self, command: Vec<u8>) -> &LogEntry {
        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            command,
        };
        self.log.push(entry);
        &self.log[self.log.len() - 1]
    }

    /// Merge entries that follow `prev_log_index` into the log.
    ///
    /// Entries already present with the same term are kept. At the first
    /// index whose term disagrees the local suffix is dropped and the rest
    /// of `entries` is appended. Returns whether the log changed.
    pub fn reconcile(&mut self, prev_log_index: u64, entries: Vec<LogEntry>) -> bool {
        let mut changed = false;
        let mut index = prev_log_index;
        for entry in entries {
            index += 1;
            debug_assert_eq!(entry.index, index, "leader sent a non-contiguous suffix");
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.log.truncate((index - 1) as usize);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
            changed = true;
        }
        changed
    }

    /// First index of the term that conflicts at `prev_log_index`.
    ///
    /// The caller must have checked that an entry exists at `prev_log_index`.
    pub fn conflict_hint(&self, prev_log_index: u64) -> u64 {
        let Some(conflict_term) = self.term_at(prev_log_index) else {
            return self.last_log_index() + 1;
        };
        let mut first = prev_log_index;
        while first > 1 && self.term_at(first - 1) == Some(conflict_term) {
            first -= 1;
        }
        first
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower at `term`.
    ///
    /// The vote is cleared only when the term actually grows, so a node
    /// never votes twice in one term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: NodeId) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: NodeId, peer_ids: &[NodeId]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
        self.votes_received = 0;

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Highest index stored on a strict majority, counting our own log.
    pub fn majority_match_index(&self) -> u64 {
        let mut indices: Vec<u64> = self.match_index.values().copied().collect();
        indices.push(self.last_log_index());
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices[indices.len() / 2]
    }

    /// Leader-side commit: only entries of the current term are committed
    /// by counting replicas; earlier ones follow by log matching.
    pub fn advance_leader_commit(&mut self) -> bool {
        let candidate = self.majority_match_index();
        if candidate > self.commit_index && self.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Follower-side commit: never moves backwards.
    pub fn advance_commit_to(&mut self, index: u64) -> bool {
        let index = index.min(self.last_log_index());
        if index > self.commit_index {
            self.commit_index = index;
            return true;
        }
        false
    }

    pub fn persistent(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// Write the persistent fields through `persister`.
    ///
    /// A failed write marks the state unsaved until a later write succeeds,
    /// so replies that depend on it can be held back.
    pub fn persist(&mut self, persister: &dyn Persister) -> Result<()> {
        let result = self
            .persistent()
            .encode()
            .and_then(|bytes| persister.save(&bytes));
        self.unsaved = result.is_err();
        result
    }

    pub fn restore(&mut self, persisted: PersistentState) {
        self.current_term = persisted.current_term;
        self.voted_for = persisted.voted_for;
        self.log = persisted.log;
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
