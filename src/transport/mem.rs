//! In-process network for running whole clusters inside one runtime.
//!
//! Every node registers its [`RaftService`] under its id and talks to peers
//! through [`MemClient`]s handed out by the network. Links can be cut in
//! both directions, a node can be isolated from everyone, and unreliable
//! mode delays every message and loses some requests and replies.
//!
//! Unregistering a node simulates a crash: calls to it are lost until a new
//! service is registered under the same id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::NodeId;
use crate::raft::message::{RaftRequest, RaftResponse};
use crate::transport::{dispatch, RaftService, RaftTransport};

/// Upper bound on the delay added to each message in unreliable mode.
const UNRELIABLE_MAX_DELAY_MS: u64 = 27;
/// Probability of losing a request, and separately its reply, in unreliable mode.
const UNRELIABLE_DROP_PROBABILITY: f64 = 0.1;
/// Upper bound on how long a call over a dead link takes to fail.
const LOST_CALL_MAX_DELAY_MS: u64 = 100;

#[derive(Default)]
struct NetworkState {
    services: HashMap<NodeId, Arc<dyn RaftService>>,
    /// Directed links that currently lose every message.
    blocked: HashSet<(NodeId, NodeId)>,
    unreliable: bool,
    rpc_count: u64,
}

/// What happens to one call, decided up front so no RNG lives across an await.
enum Route {
    Deliver {
        service: Arc<dyn RaftService>,
        delay: Duration,
        drop_reply: bool,
    },
    Lost(Duration),
}

/// A simulated network connecting any number of nodes.
#[derive(Default)]
pub struct MemNetwork {
    state: Mutex<NetworkState>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `service` reachable as node `id`, replacing any previous one.
    pub fn register(&self, id: NodeId, service: Arc<dyn RaftService>) {
        self.lock().services.insert(id, service);
        tracing::debug!(node_id = id, "Registered service");
    }

    /// Remove node `id`; calls to it are lost until it registers again.
    pub fn unregister(&self, id: NodeId) {
        self.lock().services.remove(&id);
        tracing::debug!(node_id = id, "Unregistered service");
    }

    /// Transport used by node `from` to reach node `to`.
    pub fn client(self: &Arc<Self>, from: NodeId, to: NodeId) -> Arc<dyn RaftTransport> {
        Arc::new(MemClient {
            network: Arc::downgrade(self),
            from,
            to,
        })
    }

    /// Transports from `from` to every id in `peers`, ready for `RaftNode::make`.
    pub fn clients_for(
        self: &Arc<Self>,
        from: NodeId,
        peers: &[NodeId],
    ) -> HashMap<NodeId, Arc<dyn RaftTransport>> {
        peers
            .iter()
            .filter(|&&peer| peer != from)
            .map(|&peer| (peer, self.client(from, peer)))
            .collect()
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut state = self.lock();
        state.blocked.insert((a, b));
        state.blocked.insert((b, a));
    }

    /// Restore the link between `a` and `b` in both directions.
    pub fn connect(&self, a: NodeId, b: NodeId) {
        let mut state = self.lock();
        state.blocked.remove(&(a, b));
        state.blocked.remove(&(b, a));
    }

    /// Cut every link between the two groups.
    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                self.disconnect(a, b);
            }
        }
    }

    /// Restore every link between the two groups.
    pub fn heal(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                self.connect(a, b);
            }
        }
    }

    /// Cut `id` off from every node in `all`.
    pub fn isolate(&self, id: NodeId, all: &[NodeId]) {
        for &other in all.iter().filter(|&&other| other != id) {
            self.disconnect(id, other);
        }
    }

    /// Undo every cut involving `id`.
    pub fn reconnect(&self, id: NodeId) {
        self.lock().blocked.retain(|&(a, b)| a != id && b != id);
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.lock().unreliable = unreliable;
    }

    /// Number of calls attempted through this network so far.
    pub fn rpc_count(&self) -> u64 {
        self.lock().rpc_count
    }

    fn route(&self, from: NodeId, to: NodeId) -> Route {
        let mut state = self.lock();
        state.rpc_count += 1;
        let mut rng = rand::thread_rng();

        let reachable = !state.blocked.contains(&(from, to)) && state.services.contains_key(&from);
        let service = match state.services.get(&to) {
            Some(service) if reachable => service.clone(),
            _ => {
                return Route::Lost(Duration::from_millis(
                    rng.gen_range(0..LOST_CALL_MAX_DELAY_MS),
                ))
            }
        };

        if !state.unreliable {
            return Route::Deliver {
                service,
                delay: Duration::ZERO,
                drop_reply: false,
            };
        }

        let delay = Duration::from_millis(rng.gen_range(0..UNRELIABLE_MAX_DELAY_MS));
        if rng.gen_bool(UNRELIABLE_DROP_PROBABILITY) {
            return Route::Lost(delay);
        }
        Route::Deliver {
            service,
            delay,
            drop_reply: rng.gen_bool(UNRELIABLE_DROP_PROBABILITY),
        }
    }

    /// Whether a reply from `to` can still reach `from`.
    fn reply_path_open(&self, from: NodeId, to: NodeId) -> bool {
        let state = self.lock();
        !state.blocked.contains(&(to, from))
            && state.services.contains_key(&to)
            && state.services.contains_key(&from)
    }
}

/// One node's view of the link to a single peer.
pub struct MemClient {
    network: Weak<MemNetwork>,
    from: NodeId,
    to: NodeId,
}

#[async_trait]
impl RaftTransport for MemClient {
    async fn call(&self, request: RaftRequest) -> Option<RaftResponse> {
        let network = self.network.upgrade()?;
        let method = request.method();

        match network.route(self.from, self.to) {
            Route::Lost(delay) => {
                tokio::time::sleep(delay).await;
                tracing::trace!(from = self.from, to = self.to, method, "Request lost");
                None
            }
            Route::Deliver {
                service,
                delay,
                drop_reply,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let response = dispatch(service.as_ref(), request).await;
                if drop_reply || !network.reply_path_open(self.from, self.to) {
                    tracing::trace!(from = self.from, to = self.to, method, "Reply lost");
                    return None;
                }
                Some(response)
            }
        }
    }
}
