use crate::command::Command;
use crate::membership::Membership;
use crate::NodeId;

/// One position of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

impl Entry {
    pub fn new(index: u64, term: u64, command: Command) -> Self {
        Self {
            index,
            term,
            command,
        }
    }
}

/// Position and configuration captured by a snapshot. The default value
/// (index 0) means "no snapshot".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
    pub membership: Membership,
}

/// An envelope exchanged between two nodes of the same group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    /// Sender's term.
    pub term: u64,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    RequestVote {
        last_log_index: u64,
        last_log_term: u64,
        /// Campaign started by a leadership transfer; bypasses leader
        /// stickiness on the voters.
        transfer: bool,
    },
    RequestVoteResponse {
        granted: bool,
    },
    /// Carries entries, or nothing when used as a heartbeat.
    AppendEntries {
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
        /// Leader's broadcast round, echoed back to confirm reads.
        read_ctx: u64,
    },
    AppendEntriesResponse {
        success: bool,
        /// Last index known to match the leader on success.
        match_index: u64,
        /// Follower's suggestion for the previous index to retry from.
        reject_hint: u64,
        read_ctx: u64,
    },
    InstallSnapshot {
        meta: SnapshotMeta,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    },
    InstallSnapshotResponse {
        /// Index of the snapshot being transferred.
        index: u64,
        /// Next byte offset the follower expects.
        next_offset: u64,
        /// The whole snapshot is installed (or was not needed).
        done: bool,
    },
    /// Tells a caught-up follower to start an election right away.
    TimeoutNow,
}

impl MessageBody {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::RequestVote { .. } => "request_vote",
            MessageBody::RequestVoteResponse { .. } => "request_vote_response",
            MessageBody::AppendEntries { .. } => "append_entries",
            MessageBody::AppendEntriesResponse { .. } => "append_entries_response",
            MessageBody::InstallSnapshot { .. } => "install_snapshot",
            MessageBody::InstallSnapshotResponse { .. } => "install_snapshot_response",
            MessageBody::TimeoutNow => "timeout_now",
        }
    }
}
