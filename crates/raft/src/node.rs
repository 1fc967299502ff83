use crate::command::Command;
use crate::membership::Membership;
use crate::message::{Entry, Message, MessageBody, SnapshotMeta};
use crate::progress::Progress;
use crate::storage::{HardState, Storage};
use crate::{NodeId, RaftError, Result, Role};
use config::RaftConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;
use tracing::{debug, info, warn};

/// A read confirmed by ReadIndex. Serving it is linearizable once the state
/// machine has applied `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadState {
    pub id: u64,
    pub index: u64,
}

/// Volatile state reported through [`Ready`] whenever it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftState {
    pub role: Role,
    pub leader: Option<NodeId>,
    pub term: u64,
}

/// Output accumulated since the previous [`RaftNode::ready`] call.
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Message>,
    /// Entries to apply, in index order.
    pub committed_entries: Vec<Entry>,
    pub read_states: Vec<ReadState>,
    /// Read ids that can no longer be confirmed (leadership lost).
    pub aborted_reads: Vec<u64>,
    /// The state machine must load this snapshot from storage before
    /// applying `committed_entries`.
    pub snapshot: Option<SnapshotMeta>,
    pub soft_state: Option<SoftState>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.committed_entries.is_empty()
            && self.read_states.is_empty()
            && self.aborted_reads.is_empty()
            && self.snapshot.is_none()
            && self.soft_state.is_none()
    }
}

/// Point-in-time summary for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit: u64,
    pub applied: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub snapshot_index: u64,
    pub membership: Membership,
    pub transfer_target: Option<NodeId>,
    pub fenced: bool,
    pub vote_lost: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRead {
    pub id: u64,
    pub index: u64,
    pub round: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Transfer {
    pub target: NodeId,
    pub started: u64,
    pub timeout_sent: bool,
}

#[derive(Debug)]
pub(crate) struct IncomingSnapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// One member of a consensus group.
pub struct RaftNode<S: Storage> {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) storage: S,

    pub(crate) role: Role,
    pub(crate) term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) leader: Option<NodeId>,
    pub(crate) commit: u64,
    /// Last index handed out through `Ready::committed_entries`.
    pub(crate) applied: u64,
    /// Last hard state accepted by storage.
    pub(crate) persisted: HardState,

    pub(crate) membership: Membership,
    /// Configuration in force before the first entry of `config_log`.
    pub(crate) base_membership: Membership,
    /// Membership entries present in the log, ascending by index.
    pub(crate) config_log: Vec<(u64, Membership)>,

    // timers, in ticks
    pub(crate) now: u64,
    pub(crate) election_elapsed: u64,
    pub(crate) heartbeat_elapsed: u64,
    pub(crate) randomized_timeout: u64,
    pub(crate) last_leader_contact: Option<u64>,
    pub(crate) rng: StdRng,

    // candidate
    pub(crate) votes: BTreeMap<NodeId, bool>,

    // leader
    pub(crate) progress: BTreeMap<NodeId, Progress>,
    pub(crate) round: u64,
    /// Tick at which each recent broadcast round started.
    pub(crate) round_ticks: VecDeque<(u64, u64)>,
    pub(crate) term_commit_reached: bool,
    pub(crate) pending_reads: VecDeque<PendingRead>,
    /// Reads received before the first commit of this term.
    pub(crate) queued_reads: Vec<u64>,
    pub(crate) transfer: Option<Transfer>,

    // follower
    pub(crate) incoming_snapshot: Option<IncomingSnapshot>,

    pub(crate) fenced: bool,
    /// The persisted vote was lost; this node neither votes nor campaigns.
    pub(crate) vote_lost: bool,

    // output
    pub(crate) msgs: Vec<Message>,
    pub(crate) read_states: Vec<ReadState>,
    pub(crate) aborted_reads: Vec<u64>,
    pub(crate) installed_snapshot: Option<SnapshotMeta>,
    pub(crate) last_soft_state: SoftState,
}

impl<S: Storage> RaftNode<S> {
    /// Restores a node from `storage`.
    ///
    /// `voters` is the initial configuration, used only while neither the
    /// log nor a snapshot records one. `applied` is how far the state
    /// machine already is; committed entries are handed out from the next
    /// index on. When the log no longer reaches back to `applied`, the first
    /// [`Ready`] asks for the stored snapshot to be loaded.
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        storage: S,
        voters: &[NodeId],
        applied: u64,
    ) -> Result<Self> {
        let hs = storage.hard_state();
        let snap = storage.snapshot_meta();
        let first = storage.first_index();
        let last = storage.last_index();

        let base_membership = if snap.membership.is_empty() {
            Membership::new(voters.iter().copied())
        } else {
            snap.membership.clone()
        };
        let mut config_log = Vec::new();
        if last >= first {
            for e in storage.entries(first, last + 1, usize::MAX)? {
                if let Command::MembershipChange(m) = e.command {
                    config_log.push((e.index, m));
                }
            }
        }
        let membership = config_log
            .last()
            .map(|(_, m)| m.clone())
            .unwrap_or_else(|| base_membership.clone());

        let commit = hs.commit.max(applied).max(snap.index).min(last.max(snap.index));
        let mut installed_snapshot = None;
        let applied = if applied + 1 < first {
            installed_snapshot = Some(snap.clone());
            snap.index
        } else {
            applied.min(commit)
        };

        let seed = id.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ hs.term;
        let mut node = Self {
            id,
            config,
            storage,
            role: Role::Follower,
            term: hs.term,
            voted_for: hs.voted_for,
            leader: None,
            commit,
            applied,
            persisted: hs,
            membership,
            base_membership,
            config_log,
            now: 0,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_timeout: 0,
            last_leader_contact: None,
            rng: StdRng::seed_from_u64(seed),
            votes: BTreeMap::new(),
            progress: BTreeMap::new(),
            round: 0,
            round_ticks: VecDeque::new(),
            term_commit_reached: false,
            pending_reads: VecDeque::new(),
            queued_reads: Vec::new(),
            transfer: None,
            incoming_snapshot: None,
            fenced: false,
            vote_lost: false,
            msgs: Vec::new(),
            read_states: Vec::new(),
            aborted_reads: Vec::new(),
            installed_snapshot,
            last_soft_state: SoftState::default(),
        };
        node.reset_timers();
        node.last_soft_state = node.soft_state();
        info!(
            node = id,
            term = node.term,
            commit = node.commit,
            applied = node.applied,
            first_index = first,
            last_index = last,
            voters = ?node.membership.voters,
            "raft node restored"
        );
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    pub fn applied_index(&self) -> u64 {
        self.applied
    }

    pub fn last_index(&self) -> u64 {
        self.storage.last_index()
    }

    /// Index the next proposal will get.
    pub fn next_index(&self) -> u64 {
        self.storage.last_index() + 1
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced
    }

    pub fn soft_state(&self) -> SoftState {
        SoftState {
            role: self.role,
            leader: self.leader,
            term: self.term,
        }
    }

    pub fn status(&self) -> Status {
        Status {
            id: self.id,
            role: self.role,
            term: self.term,
            leader: self.leader,
            commit: self.commit,
            applied: self.applied,
            first_index: self.storage.first_index(),
            last_index: self.storage.last_index(),
            snapshot_index: self.storage.snapshot_meta().index,
            membership: self.membership.clone(),
            transfer_target: self.transfer.map(|t| t.target),
            fenced: self.fenced,
            vote_lost: self.vote_lost,
        }
    }

    /// Stops (or resumes) all participation. A fenced node drops incoming
    /// messages, never campaigns and refuses client requests; a leader steps
    /// down when fenced.
    pub fn set_fenced(&mut self, fenced: bool) {
        if fenced == self.fenced {
            return;
        }
        if fenced {
            warn!(node = self.id, term = self.term, role = %self.role, "fencing raft node");
            if self.role != Role::Follower {
                self.reset_to_follower(None);
            }
        } else {
            info!(node = self.id, term = self.term, "raft node unfenced");
            self.reset_timers();
        }
        self.fenced = fenced;
    }

    /// Marks the vote of earlier terms as unknown. Such a node may have
    /// voted in any term, so it refuses every vote request and never starts
    /// an election. It still replicates and acknowledges entries.
    pub fn set_vote_lost(&mut self, lost: bool) {
        if lost && !self.vote_lost {
            warn!(node = self.id, term = self.term, "vote unknown; abstaining from elections");
            if self.role != Role::Follower {
                self.reset_to_follower(None);
            }
        }
        self.vote_lost = lost;
    }

    pub fn is_vote_lost(&self) -> bool {
        self.vote_lost
    }

    /// Makes committed entries from `applied + 1` on be handed out again,
    /// after the state machine failed to apply them.
    pub fn reset_applied(&mut self, applied: u64) {
        let floor = self.storage.first_index().saturating_sub(1);
        self.applied = applied.max(floor).min(self.commit);
    }

    /// Processes one message from a peer.
    pub fn step(&mut self, m: Message) -> Result<()> {
        if self.fenced {
            return Ok(());
        }
        if m.to != self.id {
            warn!(node = self.id, to = m.to, kind = m.body.kind(), "misrouted message");
            return Ok(());
        }

        if m.term > self.term {
            if let MessageBody::RequestVote {
                transfer: false, ..
            } = m.body
            {
                if self.in_leader_lease() {
                    debug!(
                        node = self.id,
                        from = m.from,
                        term = m.term,
                        "ignoring vote request while a leader is active"
                    );
                    return Ok(());
                }
            }
            let leader = match m.body {
                MessageBody::AppendEntries { .. }
                | MessageBody::InstallSnapshot { .. }
                | MessageBody::TimeoutNow => Some(m.from),
                _ => None,
            };
            info!(
                node = self.id,
                term = self.term,
                new_term = m.term,
                from = m.from,
                kind = m.body.kind(),
                "observed higher term"
            );
            self.become_follower(m.term, leader)?;
        } else if m.term < self.term {
            debug!(
                node = self.id,
                term = self.term,
                msg_term = m.term,
                from = m.from,
                kind = m.body.kind(),
                "dropping stale message"
            );
            // tell a stale leader or candidate about the newer term
            match m.body {
                MessageBody::AppendEntries { .. } | MessageBody::InstallSnapshot { .. } => {
                    self.send(
                        m.from,
                        MessageBody::AppendEntriesResponse {
                            success: false,
                            match_index: 0,
                            reject_hint: 0,
                            read_ctx: 0,
                        },
                    );
                }
                MessageBody::RequestVote { .. } => {
                    self.send(m.from, MessageBody::RequestVoteResponse { granted: false });
                }
                _ => {}
            }
            return Ok(());
        }

        match m.body {
            MessageBody::RequestVote {
                last_log_index,
                last_log_term,
                ..
            } => self.handle_request_vote(m.from, last_log_index, last_log_term),
            MessageBody::RequestVoteResponse { granted } => {
                self.handle_vote_response(m.from, granted)
            }
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                read_ctx,
            } => self.handle_append_entries(
                m.from,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                read_ctx,
            ),
            MessageBody::AppendEntriesResponse {
                success,
                match_index,
                reject_hint,
                read_ctx,
            } => self.handle_append_response(m.from, success, match_index, reject_hint, read_ctx),
            MessageBody::InstallSnapshot {
                meta,
                offset,
                data,
                done,
            } => self.handle_install_snapshot(m.from, meta, offset, data, done),
            MessageBody::InstallSnapshotResponse {
                index,
                next_offset,
                done,
            } => self.handle_snapshot_response(m.from, index, next_offset, done),
            MessageBody::TimeoutNow => self.handle_timeout_now(m.from),
        }
    }

    /// Appends a data command to the log. Returns its index.
    ///
    /// # Errors
    ///
    /// `NotLeader` on followers and candidates, `TransferInProgress` while
    /// leadership is being handed over, `Fenced` after a storage failure.
    pub fn propose(&mut self, command: Command) -> Result<u64> {
        self.check_can_propose()?;
        if command.is_membership_change() {
            return Err(RaftError::InvalidMembership(
                "membership changes go through propose_membership".into(),
            ));
        }
        let index = self.append_local(command)?;
        self.broadcast_append()?;
        self.maybe_commit()?;
        Ok(index)
    }

    /// Starts moving the group to `voters` through a joint configuration.
    /// The leader appends the final configuration by itself once the joint
    /// one commits.
    pub fn propose_membership(&mut self, voters: BTreeSet<NodeId>) -> Result<u64> {
        self.check_can_propose()?;
        if voters.is_empty() {
            return Err(RaftError::InvalidMembership("empty voter set".into()));
        }
        if voters.contains(&0) {
            return Err(RaftError::InvalidMembership("node id 0 is reserved".into()));
        }
        if self.membership.is_joint() || self.config_pending() {
            return Err(RaftError::MembershipChangeInProgress);
        }
        if voters == self.membership.voters {
            return Err(RaftError::InvalidMembership("configuration unchanged".into()));
        }
        let joint = Membership::joint(&self.membership, voters);
        info!(
            node = self.id,
            term = self.term,
            old = ?joint.outgoing,
            new = ?joint.voters,
            "entering joint configuration"
        );
        let index = self.append_local(Command::MembershipChange(joint))?;
        self.broadcast_append()?;
        self.maybe_commit()?;
        Ok(index)
    }

    pub fn has_ready(&self) -> bool {
        !self.msgs.is_empty()
            || self.commit > self.applied
            || !self.read_states.is_empty()
            || !self.aborted_reads.is_empty()
            || self.installed_snapshot.is_some()
            || self.soft_state() != self.last_soft_state
    }

    /// Drains pending output. Committed entries are handed out at most
    /// `max_entries_per_append` at a time; call again while
    /// [`has_ready`](Self::has_ready) holds.
    pub fn ready(&mut self) -> Result<Ready> {
        let mut rd = Ready {
            snapshot: self.installed_snapshot.take(),
            ..Ready::default()
        };
        if self.commit > self.applied {
            let entries = self.storage.entries(
                self.applied + 1,
                self.commit + 1,
                self.config.max_entries_per_append,
            )?;
            if let Some(last) = entries.last() {
                self.applied = last.index;
            }
            rd.committed_entries = entries;
        }
        rd.messages = mem::take(&mut self.msgs);
        rd.read_states = mem::take(&mut self.read_states);
        rd.aborted_reads = mem::take(&mut self.aborted_reads);
        let ss = self.soft_state();
        if ss != self.last_soft_state {
            rd.soft_state = Some(ss);
            self.last_soft_state = ss;
        }
        Ok(rd)
    }

    // --------------------- internals ---------------------

    fn check_can_propose(&self) -> Result<()> {
        if self.fenced {
            return Err(RaftError::Fenced);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader,
            });
        }
        if let Some(t) = self.transfer {
            return Err(RaftError::TransferInProgress { target: t.target });
        }
        Ok(())
    }

    /// A membership entry is in the log but not committed yet.
    pub(crate) fn config_pending(&self) -> bool {
        self.config_log
            .last()
            .map_or(false, |(index, _)| *index > self.commit)
    }

    pub(crate) fn membership_at(&self, index: u64) -> Membership {
        self.config_log
            .iter()
            .rev()
            .find(|(i, _)| *i <= index)
            .map(|(_, m)| m.clone())
            .unwrap_or_else(|| self.base_membership.clone())
    }

    pub(crate) fn send(&mut self, to: NodeId, body: MessageBody) {
        self.msgs.push(Message {
            from: self.id,
            to,
            term: self.term,
            body,
        });
    }

    /// Writes term, vote and commit if any of them changed.
    pub(crate) fn persist(&mut self) -> Result<()> {
        let hs = HardState {
            term: self.term,
            voted_for: self.voted_for,
            commit: self.commit,
        };
        if hs != self.persisted {
            self.storage.save_hard_state(&hs)?;
            self.persisted = hs;
        }
        Ok(())
    }

    pub(crate) fn last_term(&self) -> Result<u64> {
        Ok(self
            .storage
            .term(self.storage.last_index())?
            .unwrap_or_default())
    }

    /// Appends one entry in the current term to the local log.
    pub(crate) fn append_local(&mut self, command: Command) -> Result<u64> {
        let index = self.storage.last_index() + 1;
        let entry = Entry::new(index, self.term, command);
        self.storage.append(std::slice::from_ref(&entry))?;
        self.note_appended(std::slice::from_ref(&entry));
        Ok(index)
    }

    /// Tracks membership entries after `entries` replaced the log suffix
    /// starting at `entries[0].index`.
    pub(crate) fn note_appended(&mut self, entries: &[Entry]) {
        let first = match entries.first() {
            Some(e) => e.index,
            None => return,
        };
        let before = self.config_log.len();
        self.config_log.retain(|(i, _)| *i < first);
        let mut changed = self.config_log.len() != before;
        for e in entries {
            if let Command::MembershipChange(m) = &e.command {
                self.config_log.push((e.index, m.clone()));
                changed = true;
            }
        }
        if changed {
            self.membership = self
                .config_log
                .last()
                .map(|(_, m)| m.clone())
                .unwrap_or_else(|| self.base_membership.clone());
            debug!(
                node = self.id,
                voters = ?self.membership.voters,
                outgoing = ?self.membership.outgoing,
                "membership updated"
            );
            if self.role == Role::Leader {
                self.sync_progress();
            }
        }
    }

    /// Keeps one progress record per voter other than self.
    pub(crate) fn sync_progress(&mut self) {
        let ids = self.membership.ids();
        let next = self.storage.last_index() + 1;
        self.progress.retain(|id, _| ids.contains(id));
        for id in ids {
            if id != self.id {
                self.progress.entry(id).or_insert_with(|| Progress::new(next));
            }
        }
    }
}
