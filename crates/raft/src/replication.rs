//! Log replication, the commit rule and snapshot transfer.

use crate::command::Command;
use crate::message::{Entry, MessageBody, SnapshotMeta};
use crate::node::{IncomingSnapshot, RaftNode};
use crate::storage::{Storage, StorageError};
use crate::{NodeId, RaftError, Result, Role};
use tracing::{debug, info, warn};

impl<S: Storage> RaftNode<S> {
    /// Sends every follower what it is missing, or a heartbeat, under a new
    /// broadcast round.
    pub(crate) fn broadcast_append(&mut self) -> Result<()> {
        self.round += 1;
        self.round_ticks.push_back((self.round, self.now));
        let horizon = self.config.election_timeout_max_ticks;
        while let Some((_, tick)) = self.round_ticks.front() {
            if tick + horizon >= self.now || self.round_ticks.len() == 1 {
                break;
            }
            self.round_ticks.pop_front();
        }
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer)?;
        }
        Ok(())
    }

    pub(crate) fn send_append(&mut self, to: NodeId) -> Result<()> {
        let first = self.storage.first_index();
        let last = self.storage.last_index();
        let pr = match self.progress.get(&to) {
            Some(pr) => pr.clone(),
            None => return Ok(()),
        };
        if pr.snapshot.is_some() || pr.next < first {
            return self.send_snapshot_chunk(to);
        }
        let prev_log_index = pr.next - 1;
        let prev_log_term = match self.storage.term(prev_log_index)? {
            Some(t) => t,
            None => return self.send_snapshot_chunk(to),
        };
        let entries = if pr.next <= last {
            self.storage
                .entries(pr.next, last + 1, self.config.max_entries_per_append)?
        } else {
            Vec::new()
        };
        if let (Some(e), Some(pr)) = (entries.last(), self.progress.get_mut(&to)) {
            pr.next = e.index + 1;
        }
        if !entries.is_empty() {
            debug!(
                node = self.id,
                to,
                prev_log_index,
                count = entries.len(),
                "sending entries"
            );
        }
        self.send(
            to,
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit,
                read_ctx: self.round,
            },
        );
        Ok(())
    }

    pub(crate) fn handle_append_entries(
        &mut self,
        from: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        mut entries: Vec<Entry>,
        leader_commit: u64,
        read_ctx: u64,
    ) -> Result<()> {
        if self.role != Role::Follower {
            self.reset_to_follower(Some(from));
        }
        self.leader = Some(from);
        self.last_leader_contact = Some(self.now);
        self.election_elapsed = 0;

        let last_new = prev_log_index + entries.len() as u64;
        if prev_log_index < self.commit {
            // everything up to commit is already identical to the leader's log
            let skip = entries
                .iter()
                .take_while(|e| e.index <= self.commit)
                .count();
            entries.drain(..skip);
        } else {
            let matches = self.storage.term(prev_log_index)? == Some(prev_log_term);
            if !matches {
                let last = self.storage.last_index();
                let reject_hint = if prev_log_index > last {
                    last
                } else {
                    prev_log_index - 1
                };
                debug!(
                    node = self.id,
                    leader = from,
                    prev_log_index,
                    prev_log_term,
                    reject_hint,
                    "log mismatch, rejecting append"
                );
                self.send(
                    from,
                    MessageBody::AppendEntriesResponse {
                        success: false,
                        match_index: 0,
                        reject_hint,
                        read_ctx,
                    },
                );
                return Ok(());
            }
        }

        let mut conflict = None;
        for (pos, e) in entries.iter().enumerate() {
            if self.storage.term(e.index)? != Some(e.term) {
                conflict = Some(pos);
                break;
            }
        }
        if let Some(pos) = conflict {
            let suffix = &entries[pos..];
            if suffix[0].index <= self.storage.last_index() {
                warn!(
                    node = self.id,
                    from_index = suffix[0].index,
                    "truncating conflicting log suffix"
                );
            }
            self.storage.append(suffix)?;
            self.note_appended(suffix);
        }

        let new_commit = leader_commit.min(last_new);
        if new_commit > self.commit {
            self.commit = new_commit;
        }
        self.persist()?;
        self.send(
            from,
            MessageBody::AppendEntriesResponse {
                success: true,
                match_index: last_new,
                reject_hint: 0,
                read_ctx,
            },
        );
        Ok(())
    }

    pub(crate) fn handle_append_response(
        &mut self,
        from: NodeId,
        success: bool,
        match_index: u64,
        reject_hint: u64,
        read_ctx: u64,
    ) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let last = self.storage.last_index();
        let pr = match self.progress.get_mut(&from) {
            Some(pr) => pr,
            None => return Ok(()),
        };
        pr.recent_active = true;
        pr.acked_round = pr.acked_round.max(read_ctx);

        if success {
            let advanced = match_index > pr.matched;
            pr.on_match(match_index);
            let more = pr.next <= last;
            if advanced {
                self.maybe_commit()?;
            }
            if self.role != Role::Leader {
                return Ok(());
            }
            let handed_over = self.maybe_finish_transfer(from);
            if more && !handed_over {
                self.send_append(from)?;
            }
        } else {
            if reject_hint < pr.matched {
                warn!(
                    node = self.id,
                    peer = from,
                    matched = pr.matched,
                    reject_hint,
                    "follower lost its log, replicating again"
                );
            }
            pr.on_reject(reject_hint);
            debug!(node = self.id, peer = from, next = pr.next, "append rejected, backing off");
            self.send_append(from)?;
        }
        self.advance_reads();
        Ok(())
    }

    /// Commits the highest current-term index stored on a quorum.
    pub(crate) fn maybe_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let last = self.storage.last_index();
        let id = self.id;
        let index = self.membership.committed_index(|p| {
            if p == id {
                last
            } else {
                self.progress.get(&p).map_or(0, |pr| pr.matched)
            }
        });
        if index <= self.commit || index == u64::MAX {
            return Ok(());
        }
        // earlier terms only commit along with an entry of this term
        if self.storage.term(index)? != Some(self.term) {
            return Ok(());
        }
        self.commit = index;
        self.persist()?;
        debug!(node = self.id, term = self.term, commit = index, "commit advanced");
        self.on_commit_advanced()
    }

    fn on_commit_advanced(&mut self) -> Result<()> {
        if !self.term_commit_reached {
            self.term_commit_reached = true;
            self.release_queued_reads();
        }

        if let Some((index, m)) = self.config_log.last().cloned() {
            if index <= self.commit {
                if m.is_joint() {
                    info!(
                        node = self.id,
                        term = self.term,
                        voters = ?m.voters,
                        "joint configuration committed, leaving joint"
                    );
                    self.append_local(Command::MembershipChange(m.leave_joint()))?;
                } else if !m.voters.contains(&self.id) {
                    info!(
                        node = self.id,
                        term = self.term,
                        "removed from the configuration, stepping down"
                    );
                    self.broadcast_append()?;
                    self.reset_to_follower(None);
                    return Ok(());
                }
            }
        }

        self.broadcast_append()?;
        self.advance_reads();
        Ok(())
    }

    fn send_snapshot_chunk(&mut self, to: NodeId) -> Result<()> {
        let meta = self.storage.snapshot_meta();
        if meta.index == 0 {
            warn!(node = self.id, to, "follower is behind the log but no snapshot exists");
            return Ok(());
        }
        let offset = match self.progress.get_mut(&to) {
            Some(pr) => {
                let offset = match pr.snapshot {
                    Some((index, offset)) if index == meta.index => offset,
                    _ => {
                        info!(node = self.id, to, index = meta.index, "sending snapshot");
                        0
                    }
                };
                pr.snapshot = Some((meta.index, offset));
                offset
            }
            None => return Ok(()),
        };
        let (data, done) = self
            .storage
            .snapshot_chunk(offset, self.config.snapshot_chunk_bytes)?;
        self.send(
            to,
            MessageBody::InstallSnapshot {
                meta,
                offset,
                data,
                done,
            },
        );
        Ok(())
    }

    pub(crate) fn handle_snapshot_response(
        &mut self,
        from: NodeId,
        index: u64,
        next_offset: u64,
        done: bool,
    ) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let last = self.storage.last_index();
        let pr = match self.progress.get_mut(&from) {
            Some(pr) => pr,
            None => return Ok(()),
        };
        pr.recent_active = true;
        if done {
            pr.snapshot = None;
            pr.on_match(index);
            info!(node = self.id, peer = from, index, "snapshot delivered");
            if pr.next <= last {
                self.send_append(from)?;
            }
            return Ok(());
        }
        match pr.snapshot {
            Some((current, offset)) if current == index => {
                if next_offset == offset {
                    // duplicate answer for a chunk already re-sent
                    return Ok(());
                }
                pr.snapshot = Some((current, next_offset));
            }
            _ => pr.snapshot = None,
        }
        self.send_snapshot_chunk(from)
    }

    pub(crate) fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        meta: SnapshotMeta,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Result<()> {
        if self.role != Role::Follower {
            self.reset_to_follower(Some(from));
        }
        self.leader = Some(from);
        self.last_leader_contact = Some(self.now);
        self.election_elapsed = 0;

        let index = meta.index;
        if index <= self.commit {
            self.incoming_snapshot = None;
            self.send(
                from,
                MessageBody::InstallSnapshotResponse {
                    index,
                    next_offset: 0,
                    done: true,
                },
            );
            return Ok(());
        }

        let expected = match &self.incoming_snapshot {
            Some(s) if s.meta == meta => s.data.len() as u64,
            _ => 0,
        };
        if offset == 0 {
            self.incoming_snapshot = Some(IncomingSnapshot {
                meta: meta.clone(),
                data: Vec::new(),
            });
        } else if offset != expected {
            debug!(node = self.id, offset, expected, "snapshot chunk out of order");
            self.send(
                from,
                MessageBody::InstallSnapshotResponse {
                    index,
                    next_offset: expected,
                    done: false,
                },
            );
            return Ok(());
        }
        let received = match self.incoming_snapshot.as_mut() {
            Some(s) => {
                s.data.extend_from_slice(&data);
                s.data.len() as u64
            }
            None => 0,
        };
        if !done {
            self.send(
                from,
                MessageBody::InstallSnapshotResponse {
                    index,
                    next_offset: received,
                    done: false,
                },
            );
            return Ok(());
        }

        let snapshot = match self.incoming_snapshot.take() {
            Some(s) => s,
            None => return Ok(()),
        };
        if self.storage.term(index)? == Some(meta.term) {
            // the log already holds the snapshot point; replay it instead
            self.commit = index;
            self.persist()?;
            info!(node = self.id, index, "snapshot point already in log, keeping log");
        } else {
            self.install_snapshot(snapshot.meta, snapshot.data)?;
        }
        self.send(
            from,
            MessageBody::InstallSnapshotResponse {
                index,
                next_offset: received,
                done: true,
            },
        );
        Ok(())
    }

    fn install_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<()> {
        info!(
            node = self.id,
            term = self.term,
            index = meta.index,
            snapshot_term = meta.term,
            bytes = data.len(),
            "installing snapshot"
        );
        self.storage.apply_snapshot(meta.clone(), data)?;
        self.commit = meta.index;
        self.applied = meta.index;
        if !meta.membership.is_empty() {
            self.base_membership = meta.membership.clone();
        }
        self.config_log.clear();
        self.membership = self.base_membership.clone();
        self.persist()?;
        self.installed_snapshot = Some(meta);
        Ok(())
    }

    /// Records a snapshot of the state machine at `index` (which must be
    /// applied). The log is not touched; see [`compact_log`](Self::compact_log).
    pub fn create_snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<SnapshotMeta> {
        if index > self.applied {
            return Err(RaftError::SnapshotNotApplied {
                index,
                applied: self.applied,
            });
        }
        let current = self.storage.snapshot_meta();
        if index <= current.index {
            return Ok(current);
        }
        let term = self
            .storage
            .term(index)?
            .ok_or(StorageError::Compacted(index))?;
        let meta = SnapshotMeta {
            index,
            term,
            membership: self.membership_at(index),
        };
        self.storage.save_snapshot(meta.clone(), data)?;
        info!(node = self.id, index, term, "snapshot created");
        Ok(meta)
    }

    /// Drops log entries up to `up_to`, capped at the snapshot index and the
    /// applied index. Returns the new first index.
    pub fn compact_log(&mut self, up_to: u64) -> Result<u64> {
        let up_to = up_to
            .min(self.storage.snapshot_meta().index)
            .min(self.applied);
        if up_to >= self.storage.first_index() {
            self.storage.compact(up_to)?;
            info!(node = self.id, up_to, "log compacted");
        }
        Ok(self.storage.first_index())
    }
}
