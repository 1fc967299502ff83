//! Errors surfaced to callers of a replica.

use raft::{NodeId, RaftError, StorageError};
use thiserror::Error;

/// A read could not be served with the requested guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("snapshot {requested} is below the GC watermark {watermark}")]
    SnapshotTooOld { requested: u64, watermark: u64 },

    #[error("no lease covers the requested staleness")]
    LeaseExpired,

    /// Leadership was lost before the read index was confirmed.
    #[error("read aborted by a leadership change")]
    ReadAborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    /// Local storage failed to persist state. The node is fenced until a
    /// storage probe succeeds.
    #[error("durability failure: {0}")]
    Durability(String),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("membership change rejected: {0}")]
    Membership(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A checksummed artifact failed verification. The node must be resynced
    /// from a healthy replica.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("replica is shut down")]
    Shutdown,

    #[error("request timed out")]
    Timeout,
}

impl ReplicaError {
    /// `true` if the same request may succeed later, possibly against another
    /// node.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicaError::Durability(_)
            | ReplicaError::Consistency(_)
            | ReplicaError::NotLeader { .. }
            | ReplicaError::Membership(_)
            | ReplicaError::Timeout => true,
            ReplicaError::InvalidRequest(_)
            | ReplicaError::Corruption(_)
            | ReplicaError::Shutdown => false,
        }
    }

    /// Classifies an error raised by the storage engine.
    pub(crate) fn from_engine(err: anyhow::Error) -> Self {
        if let Some(e) = err
            .chain()
            .find_map(|c| c.downcast_ref::<engine::SnapshotTooOld>())
        {
            return ConsistencyError::SnapshotTooOld {
                requested: e.requested,
                watermark: e.watermark,
            }
            .into();
        }
        if sstable::is_corruption(&err) {
            return ReplicaError::Corruption(format!("{:#}", err));
        }
        ReplicaError::Durability(format!("{:#}", err))
    }
}

impl From<StorageError> for ReplicaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupt(msg) => ReplicaError::Corruption(msg),
            other => ReplicaError::Durability(other.to_string()),
        }
    }
}

impl From<RaftError> for ReplicaError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader_hint } => ReplicaError::NotLeader { leader_hint },
            RaftError::TransferInProgress { target } => ReplicaError::NotLeader {
                leader_hint: Some(target),
            },
            RaftError::MembershipChangeInProgress => ReplicaError::Membership(err.to_string()),
            RaftError::InvalidMembership(msg) => ReplicaError::InvalidRequest(msg),
            RaftError::UnknownPeer(_) | RaftError::SnapshotNotApplied { .. } => {
                ReplicaError::InvalidRequest(err.to_string())
            }
            RaftError::Fenced => ReplicaError::Durability(err.to_string()),
            RaftError::Codec(msg) => ReplicaError::Corruption(msg),
            RaftError::Storage(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(ReplicaError::NotLeader { leader_hint: None }.is_retryable());
        assert!(ReplicaError::from(ConsistencyError::LeaseExpired).is_retryable());
        assert!(ReplicaError::Durability("disk".into()).is_retryable());
        assert!(!ReplicaError::Corruption("crc".into()).is_retryable());
        assert!(!ReplicaError::Shutdown.is_retryable());
    }

    #[test]
    fn raft_errors_map_to_caller_classes() {
        assert_eq!(
            ReplicaError::from(RaftError::TransferInProgress { target: 3 }),
            ReplicaError::NotLeader {
                leader_hint: Some(3)
            }
        );
        assert!(matches!(
            ReplicaError::from(RaftError::MembershipChangeInProgress),
            ReplicaError::Membership(_)
        ));
        assert!(matches!(
            ReplicaError::from(RaftError::Storage(StorageError::Corrupt("bad".into()))),
            ReplicaError::Corruption(_)
        ));
        assert!(matches!(
            ReplicaError::from(RaftError::Storage(StorageError::Io("full".into()))),
            ReplicaError::Durability(_)
        ));
        assert!(matches!(
            ReplicaError::from(RaftError::Fenced),
            ReplicaError::Durability(_)
        ));
    }

    #[test]
    fn engine_errors_are_classified() {
        let too_old = anyhow::Error::new(engine::SnapshotTooOld {
            requested: 3,
            watermark: 10,
        })
        .context("reading");
        assert_eq!(
            ReplicaError::from_engine(too_old),
            ReplicaError::Consistency(ConsistencyError::SnapshotTooOld {
                requested: 3,
                watermark: 10
            })
        );
        let io = anyhow::anyhow!("disk full");
        assert!(matches!(
            ReplicaError::from_engine(io),
            ReplicaError::Durability(_)
        ));
    }
}
