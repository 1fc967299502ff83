#![allow(dead_code)]

use config::{NodeConfig, RaftConfig, StorageConfig};
use engine::ReadSnapshot;
use raft::{Message, NodeId, Storage};
use replica::{pending, Pending, Replica, Write};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_raft_config() -> RaftConfig {
    RaftConfig {
        heartbeat_ticks: 1,
        election_timeout_min_ticks: 10,
        election_timeout_max_ticks: 20,
        max_entries_per_append: 16,
        snapshot_chunk_bytes: 256,
        ..RaftConfig::default()
    }
}

pub fn node_config(root: &std::path::Path, id: NodeId, peers: &[NodeId], raft: RaftConfig) -> NodeConfig {
    NodeConfig {
        raft,
        ..NodeConfig::new(
            id,
            peers.to_vec(),
            StorageConfig::for_testing(root.join(format!("node-{}", id))),
        )
    }
}

/// Deterministic group of replicas on one thread: a FIFO of messages, cut
/// links and crashed nodes. Time only moves through [`tick`](Self::tick).
pub struct SimCluster {
    pub dir: TempDir,
    pub raft: RaftConfig,
    pub voters: Vec<NodeId>,
    /// Live nodes; a crashed node is absent.
    pub nodes: BTreeMap<NodeId, Replica>,
    pub queue: VecDeque<Message>,
    pub cut: BTreeSet<(NodeId, NodeId)>,
}

impl SimCluster {
    pub fn new(ids: &[NodeId]) -> Self {
        Self::with_raft(ids, test_raft_config())
    }

    pub fn with_raft(ids: &[NodeId], raft: RaftConfig) -> Self {
        init_tracing();
        let mut c = SimCluster {
            dir: tempfile::tempdir().unwrap(),
            raft,
            voters: ids.to_vec(),
            nodes: BTreeMap::new(),
            queue: VecDeque::new(),
            cut: BTreeSet::new(),
        };
        for &id in ids {
            c.start(id);
        }
        c
    }

    pub fn config(&self, id: NodeId) -> NodeConfig {
        node_config(self.dir.path(), id, &self.voters, self.raft.clone())
    }

    pub fn data_dir(&self, id: NodeId) -> PathBuf {
        self.config(id).storage.data_dir
    }

    fn start(&mut self, id: NodeId) {
        let replica = Replica::open(self.config(id)).unwrap();
        self.nodes.insert(id, replica);
        self.process(id);
    }

    /// Starts a node outside the initial voters; it waits to be added.
    pub fn add_node(&mut self, id: NodeId) {
        self.start(id);
    }

    pub fn node(&self, id: NodeId) -> &Replica {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Replica {
        self.nodes.get_mut(&id).unwrap()
    }

    pub fn process(&mut self, id: NodeId) {
        let msgs = self.node_mut(id).process_ready();
        self.queue.extend(msgs);
    }

    /// Delivers queued messages until the network is quiet.
    pub fn deliver(&mut self) {
        let mut steps = 0;
        while let Some(m) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < 200_000, "message storm");
            if self.cut.contains(&(m.from, m.to)) || !self.nodes.contains_key(&m.to) {
                continue;
            }
            let to = m.to;
            self.node_mut(to).step(m);
            self.process(to);
        }
    }

    pub fn tick(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.node_mut(id).tick();
            self.process(id);
        }
        self.deliver();
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// The live leader with the highest term.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_leader())
            .max_by_key(|(_, n)| n.raft().term())
            .map(|(id, _)| *id)
    }

    /// Ticks until a leader has committed an entry of its own term.
    pub fn wait_for_leader(&mut self) -> NodeId {
        for _ in 0..1000 {
            if let Some(l) = self.leader() {
                let raft = self.node(l).raft();
                let commit = raft.commit_index();
                if raft.storage().term(commit).ok().flatten() == Some(raft.term()) {
                    return l;
                }
            }
            self.tick();
        }
        panic!("no leader elected");
    }

    pub fn followers(&mut self) -> Vec<NodeId> {
        let leader = self.wait_for_leader();
        self.nodes.keys().copied().filter(|id| *id != leader).collect()
    }

    /// Ticks until `pending` is answered.
    pub fn await_reply<T>(&mut self, pending: Pending<T>) -> replica::Result<T> {
        for _ in 0..200 {
            if let Some(result) = pending.try_take() {
                return result;
            }
            self.tick();
        }
        panic!("request never answered");
    }

    pub fn propose(&mut self, write: Write) -> replica::Result<u64> {
        let leader = self.wait_for_leader();
        let (reply, p) = pending();
        self.node_mut(leader).propose(write, reply);
        self.process(leader);
        self.deliver();
        self.await_reply(p)
    }

    pub fn put(&mut self, key: &str, value: &str) -> replica::Result<u64> {
        self.propose(Write::put(key, value))
    }

    pub fn read_consistent(&mut self, id: NodeId) -> replica::Result<ReadSnapshot> {
        let (reply, p) = pending();
        self.node_mut(id).read_consistent(reply);
        self.process(id);
        self.deliver();
        self.await_reply(p)
    }

    /// The value of `key` in `id`'s local state.
    pub fn get(&self, id: NodeId, key: &str) -> Option<String> {
        self.node(id)
            .engine()
            .get(key.as_bytes())
            .unwrap()
            .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
    }

    pub fn isolate(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.nodes.keys().copied().filter(|o| *o != id).collect();
        for other in others {
            self.cut.insert((id, other));
            self.cut.insert((other, id));
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    /// Drops `id` with everything in flight to or from it.
    pub fn crash(&mut self, id: NodeId) {
        self.nodes.remove(&id);
        self.queue.retain(|m| m.to != id && m.from != id);
    }

    pub fn restart(&mut self, id: NodeId) {
        self.start(id);
    }

    pub fn restart_for_resync(&mut self, id: NodeId) {
        let replica = Replica::open_for_resync(self.config(id)).unwrap();
        self.nodes.insert(id, replica);
        self.process(id);
    }
}
