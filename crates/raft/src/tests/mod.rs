mod membership_tests;
mod replication_tests;

use crate::{
    Command, Entry, MemStorage, Message, MessageBody, NodeId, RaftNode, ReadState, Role, Storage,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use config::RaftConfig;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Cursor, Read};
use tracing_subscriber::EnvFilter;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn test_config() -> RaftConfig {
    RaftConfig {
        heartbeat_ticks: 1,
        election_timeout_min_ticks: 10,
        election_timeout_max_ticks: 20,
        max_entries_per_append: 16,
        snapshot_chunk_bytes: 16,
        ..RaftConfig::default()
    }
}

/// A lone node over fresh storage.
pub(crate) fn new_node(id: NodeId, voters: &[NodeId]) -> RaftNode<MemStorage> {
    init_tracing();
    RaftNode::new(id, test_config(), MemStorage::new(), voters, 0).unwrap()
}

pub(crate) fn put(key: &str, value: &str, sequence: u64) -> Command {
    Command::Put {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        sequence,
    }
}

pub(crate) fn msg(from: NodeId, to: NodeId, term: u64, body: MessageBody) -> Message {
    Message {
        from,
        to,
        term,
        body,
    }
}

/// Drains a node's output messages.
pub(crate) fn take_messages(node: &mut RaftNode<MemStorage>) -> Vec<Message> {
    node.ready().unwrap().messages
}

pub(crate) fn encode_kv(kv: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in kv {
        out.write_u32::<LittleEndian>(k.len() as u32).unwrap();
        out.extend_from_slice(k);
        out.write_u32::<LittleEndian>(v.len() as u32).unwrap();
        out.extend_from_slice(v);
    }
    out
}

pub(crate) fn decode_kv(data: &[u8]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut kv = BTreeMap::new();
    let mut cur = Cursor::new(data);
    while (cur.position() as usize) < data.len() {
        let mut k = vec![0; cur.read_u32::<LittleEndian>().unwrap() as usize];
        cur.read_exact(&mut k).unwrap();
        let mut v = vec![0; cur.read_u32::<LittleEndian>().unwrap() as usize];
        cur.read_exact(&mut v).unwrap();
        kv.insert(k, v);
    }
    kv
}

/// Deterministic in-memory group: a FIFO of messages, crashed nodes and cut
/// links. Every node applies committed entries to a plain map.
pub(crate) struct Cluster {
    pub config: RaftConfig,
    pub voters: Vec<NodeId>,
    pub nodes: BTreeMap<NodeId, RaftNode<MemStorage>>,
    pub kv: BTreeMap<NodeId, BTreeMap<Vec<u8>, Vec<u8>>>,
    pub applied: BTreeMap<NodeId, u64>,
    /// (index, term) of every applied entry, per node.
    pub applied_log: BTreeMap<NodeId, Vec<(u64, u64)>>,
    pub reads: BTreeMap<NodeId, Vec<ReadState>>,
    pub aborted: BTreeMap<NodeId, Vec<u64>>,
    pub snapshots_loaded: BTreeMap<NodeId, u64>,
    pub queue: VecDeque<Message>,
    pub sent: Vec<Message>,
    pub down: BTreeSet<NodeId>,
    pub cut: BTreeSet<(NodeId, NodeId)>,
    pub leaders_by_term: BTreeMap<u64, BTreeSet<NodeId>>,
}

impl Cluster {
    pub fn new(ids: &[NodeId]) -> Self {
        Self::with_config(ids, ids, test_config())
    }

    /// `ids` nodes, of which `voters` form the initial configuration.
    pub fn with_config(ids: &[NodeId], voters: &[NodeId], config: RaftConfig) -> Self {
        init_tracing();
        let mut c = Cluster {
            config,
            voters: voters.to_vec(),
            nodes: BTreeMap::new(),
            kv: BTreeMap::new(),
            applied: BTreeMap::new(),
            applied_log: BTreeMap::new(),
            reads: BTreeMap::new(),
            aborted: BTreeMap::new(),
            snapshots_loaded: BTreeMap::new(),
            queue: VecDeque::new(),
            sent: Vec::new(),
            down: BTreeSet::new(),
            cut: BTreeSet::new(),
            leaders_by_term: BTreeMap::new(),
        };
        for &id in ids {
            let node =
                RaftNode::new(id, c.config.clone(), MemStorage::new(), voters, 0).unwrap();
            c.nodes.insert(id, node);
            c.kv.insert(id, BTreeMap::new());
            c.applied.insert(id, 0);
        }
        c
    }

    pub fn node(&self, id: NodeId) -> &RaftNode<MemStorage> {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut RaftNode<MemStorage> {
        self.nodes.get_mut(&id).unwrap()
    }

    fn observe(&mut self, id: NodeId) {
        let node = &self.nodes[&id];
        if node.role() == Role::Leader {
            self.leaders_by_term
                .entry(node.term())
                .or_default()
                .insert(id);
        }
    }

    /// Drains `id`'s output: applies entries, collects reads, queues messages.
    pub fn process(&mut self, id: NodeId) {
        self.observe(id);
        loop {
            let node = self.nodes.get_mut(&id).unwrap();
            if !node.has_ready() {
                break;
            }
            let rd = node.ready().unwrap();
            if let Some(meta) = rd.snapshot {
                let data = node.storage().snapshot_data().to_vec();
                self.kv.insert(id, decode_kv(&data));
                self.applied.insert(id, meta.index);
                self.snapshots_loaded.insert(id, meta.index);
            }
            for e in rd.committed_entries {
                let applied = self.applied.get_mut(&id).unwrap();
                assert_eq!(e.index, *applied + 1, "node {} applied out of order", id);
                *applied = e.index;
                self.applied_log
                    .entry(id)
                    .or_default()
                    .push((e.index, e.term));
                let kv = self.kv.get_mut(&id).unwrap();
                match e.command {
                    Command::Put { key, value, .. } => {
                        kv.insert(key, value);
                    }
                    Command::Delete { key, .. } => {
                        kv.remove(&key);
                    }
                    _ => {}
                }
            }
            self.reads.entry(id).or_default().extend(rd.read_states);
            self.aborted.entry(id).or_default().extend(rd.aborted_reads);
            for m in rd.messages {
                self.sent.push(m.clone());
                self.queue.push_back(m);
            }
        }
    }

    /// Delivers queued messages until the network is quiet.
    pub fn deliver(&mut self) {
        let mut steps = 0;
        while let Some(m) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < 200_000, "message storm");
            if self.down.contains(&m.to)
                || self.down.contains(&m.from)
                || self.cut.contains(&(m.from, m.to))
                || !self.nodes.contains_key(&m.to)
            {
                continue;
            }
            let to = m.to;
            self.node_mut(to).step(m).unwrap();
            self.process(to);
        }
    }

    pub fn tick(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            if self.down.contains(&id) {
                continue;
            }
            self.node_mut(id).tick().unwrap();
            self.process(id);
        }
        self.deliver();
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// The up leader with the highest term.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|(id, n)| !self.down.contains(id) && n.is_leader())
            .max_by_key(|(_, n)| n.term())
            .map(|(id, _)| *id)
    }

    /// Ticks until some leader has committed an entry of its term.
    pub fn wait_for_leader(&mut self) -> NodeId {
        for _ in 0..1000 {
            if let Some(l) = self.leader() {
                if self.node(l).term_commit_reached {
                    return l;
                }
            }
            self.tick();
        }
        panic!("no leader elected");
    }

    pub fn propose(&mut self, command: Command) -> u64 {
        let leader = self.wait_for_leader();
        let index = self.node_mut(leader).propose(command).unwrap();
        self.process(leader);
        self.deliver();
        index
    }

    pub fn put(&mut self, key: &str, value: &str) -> u64 {
        let leader = self.wait_for_leader();
        let sequence = self.node(leader).next_index();
        self.propose(put(key, value, sequence))
    }

    pub fn get(&self, id: NodeId, key: &str) -> Option<String> {
        self.kv[&id]
            .get(key.as_bytes())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn isolate(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.nodes.keys().copied().filter(|o| *o != id).collect();
        for other in others {
            self.cut.insert((id, other));
            self.cut.insert((other, id));
        }
    }

    pub fn partition(&mut self, a: &[NodeId], b: &[NodeId]) {
        for &x in a {
            for &y in b {
                self.cut.insert((x, y));
                self.cut.insert((y, x));
            }
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    pub fn crash(&mut self, id: NodeId) {
        self.down.insert(id);
        self.queue.retain(|m| m.to != id && m.from != id);
    }

    /// Rebuilds `id` from its storage with an empty state machine.
    pub fn restart(&mut self, id: NodeId) {
        let old = self.nodes.remove(&id).unwrap();
        let storage = old.storage().clone();
        let node = RaftNode::new(id, self.config.clone(), storage, &self.voters, 0).unwrap();
        self.nodes.insert(id, node);
        self.kv.insert(id, BTreeMap::new());
        self.applied.insert(id, 0);
        self.applied_log.remove(&id);
        self.down.remove(&id);
        self.process(id);
    }

    /// Snapshots `id`'s state machine at its applied index and compacts the
    /// log up to it.
    pub fn snapshot(&mut self, id: NodeId) -> u64 {
        let data = encode_kv(&self.kv[&id]);
        let applied = self.applied[&id];
        let node = self.node_mut(id);
        node.create_snapshot(applied, data).unwrap();
        node.compact_log(applied).unwrap();
        applied
    }

    pub fn assert_single_leader_per_term(&self) {
        for (term, leaders) in &self.leaders_by_term {
            assert!(
                leaders.len() <= 1,
                "term {} had leaders {:?}",
                term,
                leaders
            );
        }
    }

    /// Entries applied at the same index carry the same term everywhere.
    pub fn assert_applied_consistent(&self) {
        let mut seen: BTreeMap<u64, u64> = BTreeMap::new();
        for log in self.applied_log.values() {
            for &(index, term) in log {
                let t = *seen.entry(index).or_insert(term);
                assert_eq!(t, term, "index {} applied with terms {} and {}", index, t, term);
            }
        }
    }

    /// Every up node holds the same state as the leader.
    pub fn assert_converged(&self) {
        let leader = self.leader().expect("a leader");
        for (id, kv) in &self.kv {
            if !self.down.contains(id) && self.node(*id).membership().contains(*id) {
                assert_eq!(kv, &self.kv[&leader], "node {} diverged from leader {}", id, leader);
            }
        }
    }

    pub fn entries_on(&self, id: NodeId) -> Vec<Entry> {
        let s = self.node(id).storage();
        s.entries(s.first_index(), s.last_index() + 1, usize::MAX)
            .unwrap()
    }
}
