//! Threaded driver: runs a [`Replica`] on its own thread (the apply actor)
//! and exposes it through a cloneable blocking [`Client`].
//!
//! ```text
//!  Client ──Request──▶ ┌──────────────────┐ ──Message──▶ Transport
//!  inbox ──Message───▶ │  driver thread   │
//!  tick(interval) ───▶ │  Replica         │
//!                      └──────────────────┘
//! ```
//!
//! The thread waits on all three sources with `select!` and runs
//! [`Replica::process_ready`] after each event, so committed entries are
//! applied and answered on this one thread in index order.

use crate::error::{ReplicaError, Result};
use crate::replica::{pending, Reply, Replica, Write};
use crate::stats::{Health, ReplicaStats};
use crate::transport::Transport;
use crossbeam_channel::{select, Receiver, Sender};
use engine::ReadSnapshot;
use raft::{Message, NodeId};
use std::collections::BTreeSet;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// How long a [`Client`] waits for an answer by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

enum Request {
    Propose {
        write: Write,
        reply: Reply<u64>,
    },
    ChangeMembership {
        voters: BTreeSet<NodeId>,
        reply: Reply<u64>,
    },
    ReadConsistent {
        reply: Reply<ReadSnapshot>,
    },
    ReadLeased {
        max_staleness: Duration,
        reply: Reply<ReadSnapshot>,
    },
    ReadAt {
        sequence: u64,
        reply: Reply<ReadSnapshot>,
    },
    TransferLeadership {
        target: NodeId,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<u64>,
    },
    Stats {
        reply: Reply<ReplicaStats>,
    },
    Health {
        reply: Reply<Health>,
    },
    Shutdown,
}

/// A replica running on its own thread. Dropping it stops the thread.
pub struct Node {
    id: NodeId,
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

impl Node {
    /// Starts the driver thread for `replica`, sending through `transport`
    /// and receiving from `inbox`.
    pub fn spawn<T: Transport>(
        replica: Replica,
        transport: T,
        inbox: Receiver<Message>,
        tick_interval: Duration,
    ) -> Result<Self> {
        let id = replica.id();
        let (requests, rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name(format!("replica-{}", id))
            .spawn(move || run(replica, transport, inbox, rx, tick_interval))
            .map_err(|e| ReplicaError::Durability(format!("spawning driver thread: {}", e)))?;
        info!(node = id, tick_ms = tick_interval.as_millis() as u64, "replica driver started");
        Ok(Self {
            id,
            requests,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn client(&self) -> Client {
        Client {
            id: self.id,
            requests: self.requests.clone(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Stops the driver thread and waits for it. Pending requests fail with
    /// `Shutdown`.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.requests.send(Request::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: Transport>(
    mut replica: Replica,
    transport: T,
    mut inbox: Receiver<Message>,
    requests: Receiver<Request>,
    tick_interval: Duration,
) {
    let ticker = crossbeam_channel::tick(tick_interval);
    loop {
        select! {
            recv(ticker) -> _ => replica.tick(),
            recv(inbox) -> msg => match msg {
                Ok(msg) => replica.step(msg),
                Err(_) => {
                    debug!(node = replica.id(), "network inbox closed");
                    inbox = crossbeam_channel::never();
                }
            },
            recv(requests) -> req => match req {
                Ok(Request::Shutdown) | Err(_) => break,
                Ok(req) => dispatch(&mut replica, req),
            },
        }
        for msg in replica.process_ready() {
            transport.send(msg);
        }
    }
    info!(node = replica.id(), "replica driver stopped");
}

fn dispatch(replica: &mut Replica, req: Request) {
    match req {
        Request::Propose { write, reply } => replica.propose(write, reply),
        Request::ChangeMembership { voters, reply } => replica.change_membership(voters, reply),
        Request::ReadConsistent { reply } => replica.read_consistent(reply),
        Request::ReadLeased {
            max_staleness,
            reply,
        } => {
            let _ = reply.send(replica.read_leased(max_staleness));
        }
        Request::ReadAt { sequence, reply } => {
            let _ = reply.send(replica.read_at(sequence));
        }
        Request::TransferLeadership { target, reply } => {
            let _ = reply.send(replica.transfer_leadership(target));
        }
        Request::Snapshot { reply } => {
            let _ = reply.send(replica.snapshot_now());
        }
        Request::Stats { reply } => {
            let _ = reply.send(Ok(replica.stats()));
        }
        Request::Health { reply } => {
            let _ = reply.send(Ok(replica.health()));
        }
        Request::Shutdown => {}
    }
}

/// Blocking handle to a [`Node`]. Every call waits for the answer up to the
/// client's timeout.
#[derive(Clone)]
pub struct Client {
    id: NodeId,
    requests: Sender<Request>,
    timeout: Duration,
}

impl Client {
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, pending) = pending();
        self.requests
            .send(make(reply))
            .map_err(|_| ReplicaError::Shutdown)?;
        pending.wait(self.timeout)
    }

    /// Writes `key`; returns the log index of the write.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<u64> {
        self.propose(Write::put(key, value))
    }

    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<u64> {
        self.propose(Write::delete(key))
    }

    pub fn propose(&self, write: Write) -> Result<u64> {
        self.call(|reply| Request::Propose { write, reply })
    }

    /// Linearizable snapshot of the store.
    pub fn read_consistent(&self) -> Result<ReadSnapshot> {
        self.call(|reply| Request::ReadConsistent { reply })
    }

    /// Linearizable point read.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snap = self.read_consistent()?;
        let found = snap.get(key).map_err(ReplicaError::from_engine)?;
        Ok(found.map(|(_, value)| value))
    }

    /// Linearizable range scan over `[start, end)`.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let snap = self.read_consistent()?;
        snap.scan(start, end).map_err(ReplicaError::from_engine)
    }

    pub fn read_leased(&self, max_staleness: Duration) -> Result<ReadSnapshot> {
        self.call(|reply| Request::ReadLeased {
            max_staleness,
            reply,
        })
    }

    pub fn read_at(&self, sequence: u64) -> Result<ReadSnapshot> {
        self.call(|reply| Request::ReadAt { sequence, reply })
    }

    pub fn transfer_leadership(&self, target: NodeId) -> Result<()> {
        self.call(|reply| Request::TransferLeadership { target, reply })
    }

    /// Returns the index of the final configuration once applied.
    pub fn change_membership(&self, voters: impl IntoIterator<Item = NodeId>) -> Result<u64> {
        let voters = voters.into_iter().collect();
        self.call(|reply| Request::ChangeMembership { voters, reply })
    }

    pub fn snapshot(&self) -> Result<u64> {
        self.call(|reply| Request::Snapshot { reply })
    }

    pub fn stats(&self) -> Result<ReplicaStats> {
        self.call(|reply| Request::Stats { reply })
    }

    pub fn health(&self) -> Result<Health> {
        self.call(|reply| Request::Health { reply })
    }
}
