//! Test harness for multi-node Raft cluster integration tests.
//!
//! Runs whole clusters inside the test runtime over the in-memory network,
//! with one in-memory persister per node so nodes can be crashed and
//! restarted. Everything each node delivers to its application is recorded.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use raft_lite::config::{NodeId, RaftConfig};
use raft_lite::persist::{restore_state, MemPersister, PersistentState, Persister};
use raft_lite::raft::{ApplyMsg, LogEntry, RaftNode};
use raft_lite::transport::mem::MemNetwork;
use raft_lite::transport::RaftService;

/// Raft timing with shorter timeouts for faster tests
pub fn test_raft_config(node_id: NodeId) -> RaftConfig {
    RaftConfig::new(node_id)
        .with_election_timeout(150, 300)
        .with_heartbeat_interval(50)
}

/// Persisted state for seeding a node before it starts.
pub fn persisted(current_term: u64, voted_for: Option<NodeId>, log: &[(u64, &str)]) -> PersistentState {
    PersistentState {
        current_term,
        voted_for,
        log: log
            .iter()
            .enumerate()
            .map(|(i, &(term, command))| LogEntry {
                term,
                index: i as u64 + 1,
                command: command.as_bytes().to_vec(),
            })
            .collect(),
    }
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: NodeId,
    pub raft_node: Arc<RaftNode>,
    /// Everything delivered to the application since this incarnation started.
    pub applied: Arc<Mutex<Vec<ApplyMsg>>>,
    collector: JoinHandle<()>,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.raft_node.get_state().await.1
    }

    pub async fn current_term(&self) -> u64 {
        self.raft_node.get_state().await.0
    }

    pub fn applied(&self) -> Vec<ApplyMsg> {
        self.applied.lock().unwrap().clone()
    }

    /// Command delivered at `index`, if any.
    pub fn applied_at(&self, index: u64) -> Option<Vec<u8>> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .find(|msg| msg.index == index)
            .map(|msg| msg.command.clone())
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.raft_node.kill();
        self.collector.abort();
    }
}

/// A cluster of nodes wired through one [`MemNetwork`].
pub struct TestCluster {
    pub network: Arc<MemNetwork>,
    pub node_ids: Vec<NodeId>,
    nodes: HashMap<NodeId, TestNode>,
    persisters: HashMap<NodeId, Arc<MemPersister>>,
}

impl TestCluster {
    /// Start a cluster of `num_nodes` nodes with ids `1..=num_nodes`.
    pub async fn new(num_nodes: usize) -> Self {
        Self::with_state(num_nodes, HashMap::new()).await
    }

    /// Like [`TestCluster::new`], but nodes listed in `initial` start from
    /// the given persisted state.
    pub async fn with_state(num_nodes: usize, initial: HashMap<NodeId, PersistentState>) -> Self {
        let node_ids: Vec<NodeId> = (1..=num_nodes as u64).collect();
        let mut persisters = HashMap::new();
        for &id in &node_ids {
            let persister = Arc::new(MemPersister::new());
            if let Some(state) = initial.get(&id) {
                persister.save(&state.encode().unwrap()).unwrap();
            }
            persisters.insert(id, persister);
        }

        let mut cluster = Self {
            network: MemNetwork::new(),
            node_ids,
            nodes: HashMap::new(),
            persisters,
        };
        for id in cluster.node_ids.clone() {
            cluster.start_node(id);
        }
        cluster
    }

    fn start_node(&mut self, node_id: NodeId) {
        let persister = self.persisters[&node_id].clone();
        let peers = self.network.clients_for(node_id, &self.node_ids);
        let (apply_tx, mut apply_rx) = mpsc::channel(64);

        let raft_node = RaftNode::make(test_raft_config(node_id), peers, persister, apply_tx);
        let service: Arc<dyn RaftService> = raft_node.clone();
        self.network.register(node_id, service);

        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let collector = tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                sink.lock().unwrap().push(msg);
            }
        });

        self.nodes.insert(
            node_id,
            TestNode {
                node_id,
                raft_node,
                applied,
                collector,
            },
        );
    }

    /// Kill a node and cut it from the network. Its persisted state is kept
    /// for [`TestCluster::restart_node`].
    pub fn crash_node(&mut self, node_id: NodeId) {
        self.network.unregister(node_id);
        if let Some(node) = self.nodes.remove(&node_id) {
            node.raft_node.kill();
        }
        // Later writes by the dead instance must not reach the next one.
        let copy = Arc::new(self.persisters[&node_id].duplicate());
        self.persisters.insert(node_id, copy);
    }

    /// Start a fresh instance of a crashed node from its persisted state.
    pub fn restart_node(&mut self, node_id: NodeId) {
        if self.nodes.contains_key(&node_id) {
            self.crash_node(node_id);
        }
        self.start_node(node_id);
    }

    /// What node `node_id` has saved so far.
    pub fn persisted_state(&self, node_id: NodeId) -> Option<PersistentState> {
        restore_state(self.persisters.get(&node_id)?.as_ref(), node_id)
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    pub fn active_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Wait for a leader to be elected
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<NodeId> {
        let group = self.active_node_ids();
        self.wait_for_leader_in_group(&group, timeout_duration).await
    }

    /// Wait for a leader to emerge within a specific group of nodes
    pub async fn wait_for_leader_in_group(
        &self,
        group: &[NodeId],
        timeout_duration: Duration,
    ) -> Option<NodeId> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout_duration {
            if let Some(leader) = self.leader_in_group(group).await {
                return Some(leader);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// The leader with the highest term among `group`, if any.
    pub async fn leader_in_group(&self, group: &[NodeId]) -> Option<NodeId> {
        let mut best: Option<(u64, NodeId)> = None;
        for &node_id in group {
            if let Some(node) = self.nodes.get(&node_id) {
                let (term, is_leader) = node.raft_node.get_state().await;
                if is_leader && best.map_or(true, |(t, _)| term > t) {
                    best = Some((term, node_id));
                }
            }
        }
        best.map(|(_, node_id)| node_id)
    }

    /// Count the number of leaders in the cluster
    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Leaders grouped by the term they lead in.
    pub async fn leaders_by_term(&self) -> BTreeMap<u64, Vec<NodeId>> {
        let mut leaders: BTreeMap<u64, Vec<NodeId>> = BTreeMap::new();
        for node in self.nodes.values() {
            let (term, is_leader) = node.raft_node.get_state().await;
            if is_leader {
                leaders.entry(term).or_default().push(node.node_id);
            }
        }
        leaders
    }

    pub async fn max_term(&self) -> u64 {
        let mut max = 0;
        for node in self.nodes.values() {
            max = max.max(node.current_term().await);
        }
        max
    }

    /// Create a network partition: group_a can't communicate with group_b and vice versa
    pub fn create_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.network.partition(group_a, group_b);
    }

    /// Heal a network partition: restore communication between groups
    pub fn heal_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.network.heal(group_a, group_b);
    }

    /// Isolate a node from all other nodes
    pub fn isolate_node(&self, node_id: NodeId) {
        self.network.isolate(node_id, &self.node_ids);
    }

    /// Heal an isolated node (reconnect to all others)
    pub fn heal_node(&self, node_id: NodeId) {
        self.network.reconnect(node_id);
    }

    /// Number of nodes that delivered `command` at `index`.
    pub fn count_applied(&self, index: u64, command: &[u8]) -> usize {
        self.nodes
            .values()
            .filter(|node| node.applied_at(index).as_deref() == Some(command))
            .count()
    }

    /// Submit `command` until it is applied by at least `expected` nodes.
    ///
    /// Tries every live node in turn, since a node that thinks it leads may
    /// be stale. Returns the index the command was committed at.
    pub async fn one(&self, command: &str, expected: usize, timeout_duration: Duration) -> Option<u64> {
        let command = command.as_bytes();
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout_duration {
            for node_id in self.active_node_ids() {
                let Some(node) = self.nodes.get(&node_id) else {
                    continue;
                };
                let (index, _, is_leader) = node.raft_node.start(command.to_vec()).await;
                if !is_leader {
                    continue;
                }
                let committed = wait_for(
                    || async move { self.count_applied(index, command) >= expected },
                    Duration::from_secs(2),
                    Duration::from_millis(20),
                )
                .await;
                if committed {
                    return Some(index);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Wait until every node in `group` has delivered entries `1..=index`.
    pub async fn wait_for_applied_on(
        &self,
        group: &[NodeId],
        index: u64,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async move {
                group.iter().all(|node_id| {
                    self.nodes
                        .get(node_id)
                        .map(|node| node.applied().len() as u64 >= index)
                        .unwrap_or(false)
                })
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await
    }

    /// Every node delivered a gap-free prefix `1..=n`, and no two nodes
    /// delivered different commands at the same index.
    pub fn verify_applied_consistency(&self) -> Result<(), String> {
        let mut by_index: HashMap<u64, (NodeId, Vec<u8>)> = HashMap::new();
        for node in self.nodes.values() {
            for (position, msg) in node.applied().iter().enumerate() {
                if msg.index != position as u64 + 1 {
                    return Err(format!(
                        "node {} delivered index {} at position {}",
                        node.node_id,
                        msg.index,
                        position + 1
                    ));
                }
                match by_index.get(&msg.index) {
                    Some((other, command)) if *command != msg.command => {
                        return Err(format!(
                            "nodes {} and {} disagree at index {}",
                            other, node.node_id, msg.index
                        ));
                    }
                    Some(_) => {}
                    None => {
                        by_index.insert(msg.index, (node.node_id, msg.command.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Logs of all live nodes agree on their first `len` entries.
    pub async fn verify_log_prefix(&self, len: usize) -> bool {
        let mut reference: Option<Vec<LogEntry>> = None;
        for node in self.nodes.values() {
            let log = node.raft_node.log().await;
            if log.len() < len {
                return false;
            }
            let prefix = log[..len].to_vec();
            match &reference {
                Some(expected) if *expected != prefix => return false,
                Some(_) => {}
                None => reference = Some(prefix),
            }
        }
        true
    }

    pub async fn shutdown(&mut self) {
        for node_id in self.active_node_ids() {
            self.crash_node(node_id);
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in self.nodes.values() {
            node.raft_node.kill();
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
