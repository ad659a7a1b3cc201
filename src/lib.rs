pub mod config;
pub mod error;
pub mod persist;
pub mod raft;
pub mod shutdown;
pub mod transport;
