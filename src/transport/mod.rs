//! How Raft messages travel between nodes.
//!
//! A node only sees two traits. [`RaftTransport`] is the outbound half: one
//! instance per peer, turning a [`RaftRequest`] into a reply or `None` when
//! the message or its reply was lost. [`RaftService`] is the inbound half,
//! implemented by [`RaftNode`](crate::raft::RaftNode), and [`dispatch`]
//! routes a decoded request to it.
//!
//! Two implementations ship with the crate: [`mem`] for in-process clusters
//! with injectable faults, and [`tcp`] for running nodes as separate
//! processes.

pub mod mem;
pub mod tcp;

use async_trait::async_trait;

use crate::raft::message::{
    AppendEntriesArgs, AppendEntriesReply, RaftRequest, RaftResponse, RequestVoteArgs,
    RequestVoteReply,
};

/// Client side of a link to one peer.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send `request` and wait for the reply.
    ///
    /// Returns `None` if the request or the reply was lost. Implementations
    /// may take arbitrarily long; callers bound the wait themselves.
    async fn call(&self, request: RaftRequest) -> Option<RaftResponse>;
}

/// Server side: something that answers Raft RPCs.
#[async_trait]
pub trait RaftService: Send + Sync {
    async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply;

    async fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply;
}

/// Route a request to the matching handler of `service`.
pub async fn dispatch(service: &dyn RaftService, request: RaftRequest) -> RaftResponse {
    match request {
        RaftRequest::RequestVote(args) => RaftResponse::RequestVote(service.request_vote(args).await),
        RaftRequest::AppendEntries(args) => {
            RaftResponse::AppendEntries(service.append_entries(args).await)
        }
    }
}

/// Send a RequestVote through `transport`.
///
/// A reply of the wrong kind is treated like a lost one.
pub async fn send_request_vote(
    transport: &dyn RaftTransport,
    args: RequestVoteArgs,
) -> Option<RequestVoteReply> {
    match transport.call(RaftRequest::RequestVote(args)).await? {
        RaftResponse::RequestVote(reply) => Some(reply),
        other => {
            tracing::warn!(?other, "Mismatched reply to RequestVote");
            None
        }
    }
}

/// Send an AppendEntries through `transport`.
pub async fn send_append_entries(
    transport: &dyn RaftTransport,
    args: AppendEntriesArgs,
) -> Option<AppendEntriesReply> {
    match transport.call(RaftRequest::AppendEntries(args)).await? {
        RaftResponse::AppendEntries(reply) => Some(reply),
        other => {
            tracing::warn!(?other, "Mismatched reply to AppendEntries");
            None
        }
    }
}
