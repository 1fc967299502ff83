//! One member of the group: consensus, durable log and state machine behind
//! a single sequential actor.
//!
//! A [`Replica`] never blocks and never spawns; whoever owns it (the
//! [`driver`](crate::driver) thread, or a test simulator) calls
//! [`tick`](Replica::tick), [`step`](Replica::step) and the request methods,
//! then [`process_ready`](Replica::process_ready) to apply committed entries,
//! answer requests and collect the messages to send.
//!
//! ## Request lifecycle
//!
//! - A write is proposed on the leader and answered with its log index once
//!   this node applied it. An entry applied at that index under another
//!   term means the proposal was overwritten: the caller gets `NotLeader`.
//! - Losing leadership or starting a transfer cancels every pending write
//!   with `NotLeader`, carrying the best leader hint.
//! - `read_consistent` confirms the commit index through a heartbeat round
//!   (ReadIndex) and is answered with a pinned [`ReadSnapshot`] once that
//!   index is applied.
//!
//! ## Durability fence
//!
//! A failed log or hard state write (or a failed apply) fences the node: it
//! steps down, drops incoming messages, fails every pending request with
//! `Durability` and probes its storage on a doubling backoff. The first
//! successful probe lifts the fence and re-applies from the engine's applied
//! index.

use crate::disk::{DiskStorage, WriteFault};
use crate::error::{ConsistencyError, ReplicaError, Result};
use crate::fence::Fence;
use crate::snapshot::SnapshotManager;
use crate::stats::{CommitLatency, Health, ReplicaStats};
use config::NodeConfig;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use engine::{ApplyOutcome, Engine, ReadSnapshot};
use raft::{
    Command, Entry, Membership, Message, NodeId, RaftError, RaftNode, Ready, Role, SnapshotMeta,
    SoftState, Storage,
};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Directory of the consensus state inside `StorageConfig::data_dir`.
pub const RAFT_DIR: &str = "raft";

/// A client write. Without an explicit sequence the entry's log index is
/// used as its MVCC version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        sequence: Option<u64>,
    },
    Delete {
        key: Vec<u8>,
        sequence: Option<u64>,
    },
}

impl Write {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Write::Put {
            key: key.into(),
            value: value.into(),
            sequence: None,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Write::Delete {
            key: key.into(),
            sequence: None,
        }
    }

    pub fn with_sequence(self, seq: u64) -> Self {
        match self {
            Write::Put { key, value, .. } => Write::Put {
                key,
                value,
                sequence: Some(seq),
            },
            Write::Delete { key, .. } => Write::Delete {
                key,
                sequence: Some(seq),
            },
        }
    }

    fn validate(&self) -> Result<()> {
        let (key, value_len) = match self {
            Write::Put { key, value, .. } => (key, value.len()),
            Write::Delete { key, .. } => (key, 0),
        };
        if key.is_empty() {
            return Err(ReplicaError::InvalidRequest("empty key".into()));
        }
        if key.len() > engine::MAX_KEY_SIZE {
            return Err(ReplicaError::InvalidRequest(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                engine::MAX_KEY_SIZE
            )));
        }
        if value_len > engine::MAX_VALUE_SIZE {
            return Err(ReplicaError::InvalidRequest(format!(
                "value of {} bytes exceeds {}",
                value_len,
                engine::MAX_VALUE_SIZE
            )));
        }
        Ok(())
    }

    fn into_command(self, default_sequence: u64) -> Command {
        match self {
            Write::Put {
                key,
                value,
                sequence,
            } => Command::Put {
                key,
                value,
                sequence: sequence.unwrap_or(default_sequence),
            },
            Write::Delete { key, sequence } => Command::Delete {
                key,
                sequence: sequence.unwrap_or(default_sequence),
            },
        }
    }
}

/// Where the answer to a request is sent.
pub type Reply<T> = Sender<Result<T>>;

/// The caller's side of a request handed to a [`Replica`].
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

/// A reply channel and the handle that waits on it.
pub fn pending<T>() -> (Reply<T>, Pending<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (tx, Pending { rx })
}

impl<T> Pending<T> {
    /// The outcome, if the request has finished.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ReplicaError::Shutdown)),
        }
    }

    pub fn wait(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ReplicaError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ReplicaError::Shutdown),
        }
    }
}

fn answer<T>(reply: Reply<T>, result: Result<T>) {
    // the caller may have stopped waiting
    let _ = reply.send(result);
}

fn late_write(sequence: u64, floor: u64) -> ReplicaError {
    ReplicaError::InvalidRequest(format!(
        "sequence {} is at or below the late-write floor {}",
        sequence, floor
    ))
}

struct Proposal {
    term: u64,
    started: Instant,
    reply: Reply<u64>,
}

struct MembershipWait {
    /// Index and term of the joint entry.
    index: u64,
    term: u64,
    voters: BTreeSet<NodeId>,
    reply: Reply<u64>,
}

pub struct Replica {
    id: NodeId,
    tick_interval: Duration,
    raft: RaftNode<DiskStorage>,
    engine: Engine,
    snapshots: SnapshotManager,
    fence: Fence,
    latency: CommitLatency,
    /// Snapshot raft handed out that the engine has not loaded yet.
    pending_image: Option<SnapshotMeta>,

    proposals: BTreeMap<u64, Proposal>,
    membership_wait: Option<MembershipWait>,
    next_read: u64,
    /// Reads waiting for their index to be confirmed, by read id.
    reads: BTreeMap<u64, Reply<ReadSnapshot>>,
    /// Confirmed reads waiting for the engine to reach their index.
    confirmed: Vec<(u64, Reply<ReadSnapshot>)>,

    outbox: Vec<Message>,
    role: Role,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub fn raft_dir(config: &NodeConfig) -> PathBuf {
    config.storage.data_dir.join(RAFT_DIR)
}

impl Replica {
    /// Opens the engine and the consensus state under
    /// `config.storage.data_dir` and restores the node.
    ///
    /// Committed entries past the engine's flushed index are replayed
    /// through the first [`process_ready`](Self::process_ready).
    ///
    /// # Errors
    ///
    /// `Corruption` if a committed table, the snapshot or a sealed log
    /// segment fails verification; such a node must be reopened with
    /// [`open_for_resync`](Self::open_for_resync).
    pub fn open(config: NodeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ReplicaError::InvalidRequest(format!("{:#}", e)))?;
        let engine = Engine::open(config.storage.clone()).map_err(ReplicaError::from_engine)?;
        let storage = DiskStorage::open(
            &raft_dir(&config),
            config.storage.wal_segment_bytes,
            config.storage.wal_sync,
        )?;
        let snapshot_index = storage.snapshot_meta().index;
        let mut raft = RaftNode::new(
            config.node_id,
            config.raft.clone(),
            storage,
            &config.peers,
            engine.applied_index(),
        )?;
        if raft.storage().vote_lost() {
            raft.set_vote_lost(true);
        }
        info!(
            node = config.node_id,
            term = raft.term(),
            applied = engine.applied_index(),
            flushed = engine.flushed_index(),
            commit = raft.commit_index(),
            last_index = raft.last_index(),
            snapshot_index,
            vote_lost = raft.is_vote_lost(),
            "replica opened"
        );
        Ok(Self {
            id: config.node_id,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            snapshots: SnapshotManager::new(
                config.raft.snapshot_threshold,
                config.raft.snapshot_trailing_entries,
                snapshot_index,
            ),
            role: raft.role(),
            raft,
            engine,
            fence: Fence::default(),
            latency: CommitLatency::default(),
            pending_image: None,
            proposals: BTreeMap::new(),
            membership_wait: None,
            next_read: 0,
            reads: BTreeMap::new(),
            confirmed: Vec::new(),
            outbox: Vec::new(),
        })
    }

    /// Discards the local state machine, log and snapshot, keeping only term
    /// and vote, then opens an empty node that the leader re-seeds by
    /// snapshot or log replay.
    pub fn open_for_resync(config: NodeConfig) -> Result<Self> {
        warn!(
            node = config.node_id,
            dir = %config.storage.data_dir.display(),
            "discarding local state for resync"
        );
        Engine::wipe(&config.storage).map_err(ReplicaError::from_engine)?;
        DiskStorage::wipe_keeping_vote(&raft_dir(&config))?;
        Self::open(config)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn raft(&self) -> &RaftNode<DiskStorage> {
        &self.raft
    }

    pub fn role(&self) -> Role {
        self.raft.role()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.raft.leader()
    }

    pub fn is_fenced(&self) -> bool {
        self.fence.is_active()
    }

    /// Switch that makes this node's log writes fail.
    pub fn write_fault(&self) -> WriteFault {
        self.raft.storage().write_fault()
    }

    // --------------------- inputs ---------------------

    pub fn tick(&mut self) {
        if self.fence.tick() {
            self.probe();
        }
        let result = self.raft.tick();
        self.absorb(result);
    }

    pub fn step(&mut self, msg: Message) {
        let result = self.raft.step(msg);
        self.absorb(result);
    }

    /// Proposes `write`; `reply` receives its log index once applied here.
    pub fn propose(&mut self, write: Write, reply: Reply<u64>) {
        match self.try_propose(write) {
            Ok(index) => {
                debug!(node = self.id, index, "write proposed");
                self.proposals.insert(
                    index,
                    Proposal {
                        term: self.raft.term(),
                        started: Instant::now(),
                        reply,
                    },
                );
            }
            Err(e) => answer(reply, Err(e)),
        }
    }

    fn try_propose(&mut self, write: Write) -> Result<u64> {
        self.check_fence()?;
        write.validate()?;
        let command = write.into_command(self.raft.next_index());
        if let Command::Put { sequence, .. } | Command::Delete { sequence, .. } = &command {
            if let Some(floor) = self.engine.late_floor().filter(|f| sequence <= f) {
                return Err(late_write(*sequence, floor));
            }
        }
        match self.raft.propose(command) {
            Ok(index) => Ok(index),
            Err(e) => Err(self.raft_error(e)),
        }
    }

    /// Moves the group to `voters` through a joint configuration. `reply`
    /// receives the index of the final configuration once applied here.
    pub fn change_membership(&mut self, voters: BTreeSet<NodeId>, reply: Reply<u64>) {
        if let Err(e) = self.check_fence() {
            return answer(reply, Err(e));
        }
        if self.membership_wait.is_some() {
            return answer(
                reply,
                Err(ReplicaError::Membership(
                    "a membership change is already in progress".into(),
                )),
            );
        }
        match self.raft.propose_membership(voters.clone()) {
            Ok(index) => {
                self.membership_wait = Some(MembershipWait {
                    index,
                    term: self.raft.term(),
                    voters,
                    reply,
                });
            }
            Err(e) => {
                let err = self.raft_error(e);
                answer(reply, Err(err));
            }
        }
    }

    /// Linearizable read: `reply` receives a snapshot that reflects every
    /// write committed before the call.
    pub fn read_consistent(&mut self, reply: Reply<ReadSnapshot>) {
        if let Err(e) = self.check_fence() {
            return answer(reply, Err(e));
        }
        self.next_read += 1;
        let id = self.next_read;
        match self.raft.read_index(id) {
            Ok(()) => {
                self.reads.insert(id, reply);
            }
            Err(e) => {
                let err = self.raft_error(e);
                answer(reply, Err(err));
            }
        }
    }

    /// Read from local state without a round trip, on a leader holding its
    /// lease, or on a follower that heard from the leader within
    /// `max_staleness`.
    pub fn read_leased(&self, max_staleness: Duration) -> Result<ReadSnapshot> {
        self.check_fence()?;
        let caught_up = self.engine.applied_index() >= self.raft.commit_index();
        if caught_up && self.raft.has_leader_lease() {
            return self.engine.snapshot().map_err(ReplicaError::from_engine);
        }
        if let Some(ticks) = self.raft.follower_lease() {
            // the last contact happened somewhere within the current tick
            let ticks = u32::try_from(ticks + 1).unwrap_or(u32::MAX);
            if caught_up && self.tick_interval.saturating_mul(ticks) <= max_staleness {
                return self.engine.snapshot().map_err(ReplicaError::from_engine);
            }
        }
        Err(ConsistencyError::LeaseExpired.into())
    }

    /// Pins an explicit sequence on this replica's state.
    ///
    /// # Errors
    ///
    /// `SnapshotTooOld` below the GC watermark; `InvalidRequest` for a
    /// sequence this replica has not applied yet, whose view could still
    /// change.
    pub fn read_at(&self, sequence: u64) -> Result<ReadSnapshot> {
        let last = self.engine.last_sequence();
        if sequence > last {
            return Err(ReplicaError::InvalidRequest(format!(
                "sequence {} is ahead of the applied state ({})",
                sequence, last
            )));
        }
        self.engine
            .snapshot_at(sequence)
            .map_err(ReplicaError::from_engine)
    }

    /// Hands leadership to `target`. Pending writes are cancelled with a
    /// hint pointing at the target.
    pub fn transfer_leadership(&mut self, target: NodeId) -> Result<()> {
        self.check_fence()?;
        if let Err(e) = self.raft.transfer_leadership(target) {
            return Err(self.raft_error(e));
        }
        if self.raft.status().transfer_target == Some(target) {
            info!(node = self.id, target, "leadership transfer started");
            self.cancel_writes(ReplicaError::NotLeader {
                leader_hint: Some(target),
            });
        }
        Ok(())
    }

    /// Takes a snapshot now and truncates the log. Returns the snapshot
    /// index.
    pub fn snapshot_now(&mut self) -> Result<u64> {
        self.check_fence()?;
        let meta = self.snapshots.take(&mut self.raft, &self.engine)?;
        self.snapshots.truncate(&mut self.raft, &self.engine)?;
        Ok(meta.index)
    }

    // --------------------- outputs ---------------------

    /// Applies everything raft made ready, answers finished requests and
    /// returns the messages to send.
    pub fn process_ready(&mut self) -> Vec<Message> {
        if !self.fence.is_active() && self.install_pending_image() {
            while self.raft.has_ready() {
                let rd = match self.raft.ready() {
                    Ok(rd) => rd,
                    Err(e) => {
                        self.raft_error(e);
                        break;
                    }
                };
                self.handle_ready(rd);
                if self.fence.is_active() {
                    break;
                }
            }
            self.serve_confirmed_reads();
            self.maybe_snapshot();
        }
        mem::take(&mut self.outbox)
    }

    fn handle_ready(&mut self, rd: Ready) {
        // raft wrote everything these depend on before handing them out
        self.outbox.extend(rd.messages);

        if let Some(meta) = rd.snapshot {
            self.pending_image = Some(meta);
        }
        if self.install_pending_image() {
            for entry in rd.committed_entries {
                let index = entry.index;
                if let Err(e) = self.apply(entry) {
                    let err = ReplicaError::from_engine(e);
                    error!(node = self.id, index, error = %err, "apply failed");
                    self.raft.reset_applied(self.engine.applied_index());
                    self.trip_fence(err.to_string());
                    break;
                }
            }
        } else if let Some(first) = rd.committed_entries.first() {
            self.raft.reset_applied(first.index - 1);
        }

        if let Some(ss) = rd.soft_state {
            self.on_soft_state(ss);
        }
        for rs in rd.read_states {
            if let Some(reply) = self.reads.remove(&rs.id) {
                self.confirmed.push((rs.index, reply));
            }
        }
        for id in rd.aborted_reads {
            if let Some(reply) = self.reads.remove(&id) {
                answer(reply, Err(ConsistencyError::ReadAborted.into()));
            }
        }
    }

    /// Loads a snapshot image raft asked for. `false` if it is still missing.
    fn install_pending_image(&mut self) -> bool {
        let Some(meta) = self.pending_image.clone() else {
            return true;
        };
        let result = self
            .raft
            .storage()
            .snapshot_data()
            .map_err(ReplicaError::from)
            .and_then(|data| {
                self.engine
                    .install_image_at(&data[..], meta.index)
                    .map_err(ReplicaError::from_engine)
            });
        match result {
            Ok(header) => {
                info!(
                    node = self.id,
                    index = meta.index,
                    term = meta.term,
                    entries = header.entry_count,
                    "snapshot image loaded"
                );
                self.snapshots.installed(meta.index);
                self.pending_image = None;
                true
            }
            Err(e) => {
                error!(node = self.id, index = meta.index, error = %e, "loading snapshot image failed");
                self.trip_fence(e.to_string());
                false
            }
        }
    }

    fn apply(&mut self, entry: Entry) -> anyhow::Result<()> {
        let Entry {
            index,
            term,
            command,
        } = entry;
        let outcome = match command {
            Command::Put {
                key,
                value,
                sequence,
            } => Some((sequence, self.engine.apply_put(index, key, value, sequence)?)),
            Command::Delete { key, sequence } => {
                Some((sequence, self.engine.apply_delete(index, key, sequence)?))
            }
            Command::MembershipChange(m) => {
                self.engine.note_applied(index)?;
                self.on_membership_applied(index, term, &m);
                None
            }
            Command::Noop => {
                self.engine.note_applied(index)?;
                None
            }
        };
        if let Some(p) = self.proposals.remove(&index) {
            if p.term == term {
                self.latency.record(p.started.elapsed());
                let result = match outcome {
                    Some((seq, ApplyOutcome::TooLate { floor })) => Err(late_write(seq, floor)),
                    _ => Ok(index),
                };
                answer(p.reply, result);
            } else {
                answer(
                    p.reply,
                    Err(ReplicaError::NotLeader {
                        leader_hint: self.raft.leader(),
                    }),
                );
            }
        }
        Ok(())
    }

    fn on_membership_applied(&mut self, index: u64, term: u64, m: &Membership) {
        let Some(wait) = &self.membership_wait else {
            return;
        };
        if index == wait.index && term != wait.term {
            if let Some(wait) = self.membership_wait.take() {
                answer(
                    wait.reply,
                    Err(ReplicaError::NotLeader {
                        leader_hint: self.raft.leader(),
                    }),
                );
            }
        } else if index > wait.index && !m.is_joint() && m.voters == wait.voters {
            info!(node = self.id, index, voters = ?m.voters, "membership change complete");
            if let Some(wait) = self.membership_wait.take() {
                answer(wait.reply, Ok(index));
            }
        }
    }

    fn on_soft_state(&mut self, ss: SoftState) {
        if ss.role != self.role {
            info!(
                node = self.id,
                term = ss.term,
                role = %ss.role,
                leader = ?ss.leader,
                "role changed"
            );
            if self.role == Role::Leader {
                self.cancel_writes(ReplicaError::NotLeader {
                    leader_hint: ss.leader,
                });
            }
            self.role = ss.role;
        }
    }

    fn serve_confirmed_reads(&mut self) {
        let applied = self.engine.applied_index();
        let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.confirmed)
            .into_iter()
            .partition(|(index, _)| *index <= applied);
        self.confirmed = waiting;
        for (_, reply) in ready {
            answer(reply, self.engine.snapshot().map_err(ReplicaError::from_engine));
        }
    }

    fn maybe_snapshot(&mut self) {
        if self.snapshots.due(self.engine.applied_index()) {
            if let Err(e) = self.snapshots.take(&mut self.raft, &self.engine) {
                warn!(node = self.id, error = %e, "snapshot failed");
                return;
            }
        }
        if let Err(e) = self.snapshots.truncate(&mut self.raft, &self.engine) {
            warn!(node = self.id, error = %e, "log truncation failed");
        }
    }

    // --------------------- failures ---------------------

    fn check_fence(&self) -> Result<()> {
        match self.fence.reason() {
            Some(reason) => Err(ReplicaError::Durability(reason.to_string())),
            None => Ok(()),
        }
    }

    fn absorb(&mut self, result: raft::Result<()>) {
        if let Err(e) = result {
            self.raft_error(e);
        }
    }

    /// Converts a raft error for the caller, fencing the node if storage
    /// failed.
    fn raft_error(&mut self, e: RaftError) -> ReplicaError {
        if let RaftError::Storage(inner) = &e {
            error!(node = self.id, error = %inner, "raft storage failure");
            self.trip_fence(inner.to_string());
        }
        e.into()
    }

    fn trip_fence(&mut self, reason: String) {
        if !self.fence.is_active() {
            warn!(node = self.id, term = self.raft.term(), reason = %reason, "fencing replica");
        }
        self.fence.trip(reason.clone());
        self.raft.set_fenced(true);
        let err = ReplicaError::Durability(reason);
        self.cancel_writes(err.clone());
        for (_, reply) in mem::take(&mut self.reads) {
            answer(reply, Err(err.clone()));
        }
        for (_, reply) in mem::take(&mut self.confirmed) {
            answer(reply, Err(err.clone()));
        }
    }

    fn probe(&mut self) {
        match self.raft.storage_mut().probe() {
            Ok(()) => {
                info!(
                    node = self.id,
                    failed_probes = self.fence.failed_probes(),
                    "storage healthy; lifting fence"
                );
                self.fence.clear();
                self.raft.reset_applied(self.engine.applied_index());
                self.raft.set_fenced(false);
            }
            Err(e) => {
                warn!(node = self.id, error = %e, "storage probe failed");
                self.fence.probe_failed(e.to_string());
            }
        }
    }

    fn cancel_writes(&mut self, err: ReplicaError) {
        let proposals = mem::take(&mut self.proposals);
        if !proposals.is_empty() {
            debug!(node = self.id, count = proposals.len(), error = %err, "cancelling pending writes");
        }
        for (_, p) in proposals {
            answer(p.reply, Err(err.clone()));
        }
        if let Some(wait) = self.membership_wait.take() {
            answer(wait.reply, Err(err));
        }
    }

    // --------------------- monitoring ---------------------

    pub fn stats(&self) -> ReplicaStats {
        let st = self.raft.status();
        ReplicaStats {
            id: st.id,
            role: st.role,
            term: st.term,
            leader: st.leader,
            commit_index: st.commit,
            last_applied: self.engine.applied_index(),
            first_index: st.first_index,
            last_index: st.last_index,
            log_length: (st.last_index + 1).saturating_sub(st.first_index),
            snapshot_index: st.snapshot_index,
            retention_floor: self.snapshots.floor(),
            voters: st.membership.voters.clone(),
            joint: st.membership.is_joint(),
            fenced: self.fence.is_active(),
            failed_probes: self.fence.failed_probes(),
            vote_lost: st.vote_lost,
            pending_proposals: self.proposals.len(),
            pending_reads: self.reads.len() + self.confirmed.len(),
            commit_latency: self.latency,
            engine: self.engine.stats(),
        }
    }

    pub fn health(&self) -> Health {
        Health {
            id: self.id,
            role: self.raft.role(),
            term: self.raft.term(),
            leader: self.raft.leader(),
            commit_index: self.raft.commit_index(),
            last_applied: self.engine.applied_index(),
            serving: !self.fence.is_active(),
        }
    }
}
