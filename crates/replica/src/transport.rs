//! Message delivery between replicas.
//!
//! Raft tolerates loss, duplication and reordering, so a transport only has
//! to make a best effort: [`Transport::send`] never blocks and never fails.
//! [`LocalNetwork`] connects nodes of one process through channels and can
//! cut links to simulate partitions.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use raft::{Message, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub trait Transport: Send + 'static {
    fn send(&self, msg: Message);
}

#[derive(Default)]
struct Links {
    inboxes: HashMap<NodeId, Sender<Message>>,
    /// Directed links that drop everything.
    cut: HashSet<(NodeId, NodeId)>,
    dropped: u64,
}

/// In-process network of channel inboxes.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    links: Arc<Mutex<Links>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches node `id`, replacing a previous attachment. Returns its
    /// outgoing transport and its inbox.
    pub fn join(&self, id: NodeId) -> (LocalTransport, Receiver<Message>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.links.lock().inboxes.insert(id, tx);
        (
            LocalTransport {
                links: Arc::clone(&self.links),
            },
            rx,
        )
    }

    /// Detaches node `id`; messages to it are dropped.
    pub fn leave(&self, id: NodeId) {
        self.links.lock().inboxes.remove(&id);
    }

    /// Drops every message between `a` and `b`, both ways.
    pub fn cut(&self, a: NodeId, b: NodeId) {
        let mut links = self.links.lock();
        links.cut.insert((a, b));
        links.cut.insert((b, a));
    }

    /// Cuts `id` off from every attached node.
    pub fn isolate(&self, id: NodeId) {
        let mut links = self.links.lock();
        let others: Vec<NodeId> = links.inboxes.keys().copied().filter(|n| *n != id).collect();
        for other in others {
            links.cut.insert((id, other));
            links.cut.insert((other, id));
        }
    }

    pub fn heal(&self) {
        self.links.lock().cut.clear();
    }

    /// Messages dropped so far by cuts or missing inboxes.
    pub fn dropped(&self) -> u64 {
        self.links.lock().dropped
    }
}

#[derive(Clone)]
pub struct LocalTransport {
    links: Arc<Mutex<Links>>,
}

impl Transport for LocalTransport {
    fn send(&self, msg: Message) {
        let mut links = self.links.lock();
        if links.cut.contains(&(msg.from, msg.to)) {
            links.dropped += 1;
            return;
        }
        let (from, to, kind) = (msg.from, msg.to, msg.body.kind());
        let delivered = links
            .inboxes
            .get(&to)
            .map_or(false, |tx| tx.send(msg).is_ok());
        if !delivered {
            links.dropped += 1;
            debug!(from, to, kind, "message dropped");
        }
    }
}
