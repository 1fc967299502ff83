//! Consistent and leased reads.
//!
//! `read_index` records the commit index at the time of the request and
//! confirms leadership with a fresh broadcast round: once a quorum has
//! answered a message of that round, no other leader can have committed
//! anything the recorded index misses.
//!
//! Leases rely on leader stickiness: a follower that heard from the leader
//! less than `election_timeout_min_ticks` ago ignores ordinary vote
//! requests, so no new leader can exist before the quorum's contact ages
//! out.

use crate::node::{PendingRead, RaftNode};
use crate::storage::Storage;
use crate::{RaftError, Result, Role};
use tracing::debug;

impl<S: Storage> RaftNode<S> {
    /// Starts a ReadIndex request tagged `id`. The answer arrives as a
    /// [`ReadState`](crate::ReadState) in a later `Ready`, or `id` shows up
    /// in `Ready::aborted_reads` if leadership is lost first.
    pub fn read_index(&mut self, id: u64) -> Result<()> {
        if self.fenced {
            return Err(RaftError::Fenced);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader,
            });
        }
        if !self.term_commit_reached {
            debug!(node = self.id, id, "read queued until the term's first commit");
            self.queued_reads.push(id);
            return Ok(());
        }
        self.pending_reads.push_back(PendingRead {
            id,
            index: self.commit,
            round: self.round + 1,
        });
        self.broadcast_append()?;
        self.advance_reads();
        Ok(())
    }

    /// Moves reads queued before the term's first commit into the pending
    /// queue. The caller broadcasts the round they wait for.
    pub(crate) fn release_queued_reads(&mut self) {
        let round = self.round + 1;
        let index = self.commit;
        for id in std::mem::take(&mut self.queued_reads) {
            self.pending_reads.push_back(PendingRead { id, index, round });
        }
    }

    /// Emits every pending read whose round a quorum has answered.
    pub(crate) fn advance_reads(&mut self) {
        let id = self.id;
        while let Some(front) = self.pending_reads.front().copied() {
            let confirmed = self.membership.has_quorum(|p| {
                p == id
                    || self
                        .progress
                        .get(&p)
                        .map_or(false, |pr| pr.acked_round >= front.round)
            });
            if !confirmed {
                break;
            }
            self.pending_reads.pop_front();
            self.read_states.push(crate::ReadState {
                id: front.id,
                index: front.index,
            });
        }
    }

    pub(crate) fn abort_reads(&mut self) {
        let pending = self.pending_reads.drain(..).map(|r| r.id);
        self.aborted_reads.extend(pending);
        self.aborted_reads.append(&mut self.queued_reads);
    }

    /// Tick at which broadcast round `round` started, while still tracked.
    fn round_tick(&self, round: u64) -> Option<u64> {
        let pos = self.round_ticks.partition_point(|(r, _)| *r <= round);
        if pos == 0 {
            return None;
        }
        Some(self.round_ticks[pos - 1].1)
    }

    /// `true` if this leader may serve reads from its applied state without
    /// a ReadIndex round.
    pub fn has_leader_lease(&self) -> bool {
        if self.role != Role::Leader
            || self.fenced
            || !self.config.lease_reads
            || self.transfer.is_some()
            || !self.term_commit_reached
        {
            return false;
        }
        let id = self.id;
        let now = self.now;
        let lease = self.config.election_timeout_min_ticks;
        self.membership.has_quorum(|p| {
            p == id
                || self
                    .progress
                    .get(&p)
                    .and_then(|pr| self.round_tick(pr.acked_round))
                    .map_or(false, |t| now - t < lease)
        })
    }

    /// On a follower holding a lease, the number of ticks since it last
    /// heard from the leader.
    pub fn follower_lease(&self) -> Option<u64> {
        if self.role != Role::Follower || self.fenced || !self.config.lease_reads {
            return None;
        }
        self.leader?;
        let since = self.now - self.last_leader_contact?;
        (since < self.config.election_timeout_min_ticks).then_some(since)
    }
}
