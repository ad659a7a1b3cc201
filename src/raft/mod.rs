mod election;
pub mod message;
pub mod node;
mod replication;
pub mod rpc;
pub mod state;
pub mod timer;

pub use message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
pub use node::{ApplyMsg, RaftNode};
pub use state::{LogEntry, RaftRole, RaftState};
