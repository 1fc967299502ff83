//! Timers, elections and leadership transfer.

use crate::command::Command;
use crate::node::{RaftNode, Transfer};
use crate::message::MessageBody;
use crate::progress::Progress;
use crate::storage::Storage;
use crate::{NodeId, RaftError, Result, Role};
use rand::Rng;
use tracing::{debug, info, warn};

impl<S: Storage> RaftNode<S> {
    /// Advances logical time by one tick.
    pub fn tick(&mut self) -> Result<()> {
        self.now += 1;
        if self.fenced {
            return Ok(());
        }
        match self.role {
            Role::Leader => self.tick_leader(),
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_timeout {
                    self.election_elapsed = 0;
                    self.campaign(false)?;
                }
                Ok(())
            }
        }
    }

    fn tick_leader(&mut self) -> Result<()> {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if let Some(t) = self.transfer {
            if self.now - t.started >= self.config.election_timeout_min_ticks {
                warn!(node = self.id, target = t.target, "leadership transfer timed out");
                self.transfer = None;
            }
        }

        if self.election_elapsed >= self.config.election_timeout_min_ticks {
            self.election_elapsed = 0;
            if self.config.check_quorum && !self.quorum_active() {
                warn!(
                    node = self.id,
                    term = self.term,
                    "no contact with a quorum, stepping down"
                );
                self.reset_to_follower(None);
                return Ok(());
            }
            for pr in self.progress.values_mut() {
                pr.recent_active = false;
            }
        }

        if self.heartbeat_elapsed >= self.config.heartbeat_ticks {
            self.heartbeat_elapsed = 0;
            self.broadcast_append()?;
        }
        Ok(())
    }

    fn quorum_active(&self) -> bool {
        let id = self.id;
        self.membership.has_quorum(|p| {
            p == id || self.progress.get(&p).map_or(false, |pr| pr.recent_active)
        })
    }

    /// `true` while this node follows (or is) a leader it heard from within
    /// the minimum election timeout. Vote requests are ignored meanwhile,
    /// unless they come from a leadership transfer.
    pub(crate) fn in_leader_lease(&self) -> bool {
        match self.role {
            Role::Leader => self.config.check_quorum,
            _ => {
                self.leader.is_some()
                    && self.last_leader_contact.map_or(false, |t| {
                        self.now - t < self.config.election_timeout_min_ticks
                    })
            }
        }
    }

    pub(crate) fn reset_timers(&mut self) {
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        let min = self.config.election_timeout_min_ticks;
        let max = self.config.election_timeout_max_ticks.max(min + 1);
        self.randomized_timeout = self.rng.gen_range(min..max);
    }

    /// Starts an election in the next term.
    pub(crate) fn campaign(&mut self, transfer: bool) -> Result<()> {
        if !self.membership.contains(self.id) {
            debug!(node = self.id, "not a voter, not campaigning");
            return Ok(());
        }
        if self.vote_lost {
            debug!(node = self.id, "vote unknown, not campaigning");
            return Ok(());
        }
        self.term += 1;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id, true);
        self.reset_timers();
        self.persist()?;
        info!(node = self.id, term = self.term, transfer, "starting election");

        if self.won_election() {
            return self.become_leader();
        }
        let last_log_index = self.storage.last_index();
        let last_log_term = self.last_term()?;
        for peer in self.membership.ids() {
            if peer != self.id {
                self.send(
                    peer,
                    MessageBody::RequestVote {
                        last_log_index,
                        last_log_term,
                        transfer,
                    },
                );
            }
        }
        Ok(())
    }

    fn won_election(&self) -> bool {
        self.membership
            .has_quorum(|id| self.votes.get(&id).copied() == Some(true))
    }

    fn lost_election(&self) -> bool {
        !self
            .membership
            .has_quorum(|id| self.votes.get(&id).copied() != Some(false))
    }

    pub(crate) fn handle_request_vote(
        &mut self,
        from: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<()> {
        let can_vote = !self.vote_lost
            && (self.voted_for == Some(from)
                || (self.voted_for.is_none() && self.leader.is_none()));
        let my_last_term = self.last_term()?;
        let my_last_index = self.storage.last_index();
        let up_to_date = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index);
        let granted = can_vote && up_to_date;

        if granted {
            self.voted_for = Some(from);
            self.election_elapsed = 0;
            self.persist()?;
        }
        debug!(
            node = self.id,
            term = self.term,
            candidate = from,
            granted,
            up_to_date,
            "vote request"
        );
        self.send(from, MessageBody::RequestVoteResponse { granted });
        Ok(())
    }

    pub(crate) fn handle_vote_response(&mut self, from: NodeId, granted: bool) -> Result<()> {
        if self.role != Role::Candidate {
            return Ok(());
        }
        self.votes.insert(from, granted);
        if self.won_election() {
            self.become_leader()?;
        } else if self.lost_election() {
            info!(node = self.id, term = self.term, "election lost");
            self.reset_to_follower(None);
        }
        Ok(())
    }

    pub(crate) fn become_leader(&mut self) -> Result<()> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.transfer = None;
        self.votes.clear();
        self.round = 0;
        self.round_ticks.clear();
        self.term_commit_reached = false;
        self.reset_timers();
        let next = self.storage.last_index() + 1;
        let me = self.id;
        self.progress = self
            .membership
            .ids()
            .into_iter()
            .filter(|id| *id != me)
            .map(|id| (id, Progress::new(next)))
            .collect();
        info!(node = self.id, term = self.term, last_index = next - 1, "became leader");

        self.append_local(Command::Noop)?;
        self.broadcast_append()?;
        self.maybe_commit()
    }

    /// Moves to `term` (if newer) as a follower of `leader`.
    pub(crate) fn become_follower(&mut self, term: u64, leader: Option<NodeId>) -> Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.reset_to_follower(leader);
        self.persist()
    }

    /// Drops to follower without touching the term.
    pub(crate) fn reset_to_follower(&mut self, leader: Option<NodeId>) {
        if self.role == Role::Leader {
            self.abort_reads();
            self.progress.clear();
            self.transfer = None;
        }
        if self.role != Role::Follower {
            info!(node = self.id, term = self.term, was = %self.role, "stepping down to follower");
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.reset_timers();
    }

    pub(crate) fn handle_timeout_now(&mut self, from: NodeId) -> Result<()> {
        if self.leader != Some(from) {
            debug!(node = self.id, from, "timeout_now from a node that is not the leader");
            return Ok(());
        }
        info!(node = self.id, term = self.term, "leader handed over, campaigning");
        self.campaign(true)
    }

    /// Hands leadership to `target` once its log has caught up. Proposals are
    /// refused until the transfer completes or times out after the minimum
    /// election timeout.
    pub fn transfer_leadership(&mut self, target: NodeId) -> Result<()> {
        if self.fenced {
            return Err(RaftError::Fenced);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader,
            });
        }
        if target == self.id {
            return Ok(());
        }
        if !self.membership.voters.contains(&target) {
            return Err(RaftError::UnknownPeer(target));
        }
        if self.transfer.map(|t| t.target) == Some(target) {
            return Ok(());
        }
        info!(node = self.id, term = self.term, target, "transferring leadership");
        self.transfer = Some(Transfer {
            target,
            started: self.now,
            timeout_sent: false,
        });
        if !self.maybe_finish_transfer(target) {
            self.send_append(target)?;
        }
        Ok(())
    }

    /// Sends `TimeoutNow` to the transfer target if it has the whole log.
    pub(crate) fn maybe_finish_transfer(&mut self, peer: NodeId) -> bool {
        let last = self.storage.last_index();
        let ready = match (&self.transfer, self.progress.get(&peer)) {
            (Some(t), Some(pr)) => t.target == peer && !t.timeout_sent && pr.matched == last,
            _ => false,
        };
        if ready {
            if let Some(t) = self.transfer.as_mut() {
                t.timeout_sent = true;
            }
            self.send(peer, MessageBody::TimeoutNow);
        }
        ready
    }
}
