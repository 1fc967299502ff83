//! # Raft - consensus core
//!
//! A sans-IO Raft implementation: the node never touches a socket, a clock or
//! a thread. Its owner feeds it
//!
//! - [`RaftNode::tick`] at a fixed interval (all timeouts are in ticks),
//! - [`RaftNode::step`] for every message received from a peer,
//! - [`RaftNode::propose`], [`RaftNode::read_index`] and friends for client
//!   requests,
//!
//! and drains a [`Ready`] that holds the messages to send, the newly
//! committed entries to apply and the confirmed reads. Log entries and the
//! vote state are written through the [`Storage`] trait synchronously, before
//! any message that depends on them is handed out.
//!
//! ## Module Responsibilities
//!
//! | Module        | Purpose                                                  |
//! |---------------|----------------------------------------------------------|
//! | `command`     | [`Command`] payload and its binary codec                 |
//! | `message`     | [`Message`], [`Entry`], [`SnapshotMeta`]                 |
//! | `membership`  | voter sets, joint consensus quorums                      |
//! | `storage`     | [`Storage`] trait, [`MemStorage`]                        |
//! | `progress`    | leader's per-follower replication state                  |
//! | `node`        | [`RaftNode`]: roles, step dispatch, proposals, `Ready`   |
//! | `election`    | timers, campaigns, votes, leadership transfer            |
//! | `replication` | AppendEntries, commit rule, snapshot install             |
//! | `read`        | ReadIndex, leader and follower leases                    |
//!
//! ## Safety rules kept by the core
//!
//! - A vote or an append acknowledgement is produced only after the state
//!   it depends on was accepted by [`Storage`].
//! - A leader commits only entries of its own term by counting replicas;
//!   older entries commit with them. A new leader appends a
//!   [`Command::Noop`] so that this happens without waiting for a client.
//! - While a joint configuration is in effect every decision needs a
//!   majority of both the outgoing and the incoming voter set.
//! - A node whose vote record was lost ([`RaftNode::set_vote_lost`]) never
//!   grants a vote or campaigns again; it only replicates.

mod command;
mod election;
mod membership;
mod message;
mod node;
mod progress;
mod read;
mod replication;
mod storage;

#[cfg(test)]
mod tests;

pub use command::Command;
pub use membership::Membership;
pub use message::{Entry, Message, MessageBody, SnapshotMeta};
pub use node::{RaftNode, Ready, ReadState, SoftState, Status};
pub use storage::{HardState, MemStorage, Storage, StorageError};

use std::fmt;
use thiserror::Error;

/// Identifier of a replica inside its consensus group. `0` is reserved.
pub type NodeId = u64;

/// Role of a node in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(s)
    }
}

/// Errors returned by [`RaftNode`] operations.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The request needs the leader; `leader_hint` is the leader this node
    /// last heard from, if any.
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("leadership transfer to {target} in progress")]
    TransferInProgress { target: NodeId },

    #[error("a membership change is already in progress")]
    MembershipChangeInProgress,

    #[error("invalid membership: {0}")]
    InvalidMembership(String),

    #[error("node {0} is not a voter")]
    UnknownPeer(NodeId),

    /// The node refuses work until its storage is healthy again.
    #[error("node is fenced after a storage failure")]
    Fenced,

    #[error("snapshot index {index} is not applied yet (applied {applied})")]
    SnapshotNotApplied { index: u64, applied: u64 },

    #[error("command codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RaftError>;
