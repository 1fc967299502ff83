//! Snapshot scheduling and the log retention floor.
//!
//! Snapshots and log truncation are decided in one place, on the apply
//! actor, in that order: a snapshot is cut from the engine, handed to raft,
//! and only then is the floor recomputed from the snapshot index raft
//! actually stores. Truncation therefore never assumes a snapshot that does
//! not exist.

use crate::disk::DiskStorage;
use crate::error::{ReplicaError, Result};
use engine::Engine;
use raft::{RaftNode, SnapshotMeta, Storage};
use tracing::{debug, info};

/// Highest log index that may be dropped.
///
/// Everything above the snapshot minus `trailing` stays for lagging
/// followers; everything above `flushed_index` stays so that a restart can
/// replay it into the engine instead of loading the whole image again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionFloor {
    pub snapshot_index: u64,
    pub flushed_index: u64,
    pub trailing: u64,
}

impl RetentionFloor {
    pub fn index(&self) -> u64 {
        self.snapshot_index
            .saturating_sub(self.trailing)
            .min(self.flushed_index)
    }
}

#[derive(Debug)]
pub struct SnapshotManager {
    threshold: u64,
    trailing: u64,
    last_snapshot: u64,
    floor: u64,
}

impl SnapshotManager {
    pub fn new(threshold: u64, trailing: u64, snapshot_index: u64) -> Self {
        Self {
            threshold,
            trailing,
            last_snapshot: snapshot_index,
            floor: 0,
        }
    }

    pub fn last_snapshot(&self) -> u64 {
        self.last_snapshot
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// A snapshot is due once `threshold` entries were applied past the last.
    pub fn due(&self, applied: u64) -> bool {
        applied >= self.last_snapshot.saturating_add(self.threshold)
    }

    /// A snapshot arrived from the leader.
    pub fn installed(&mut self, index: u64) {
        self.last_snapshot = self.last_snapshot.max(index);
    }

    /// Exports the engine and records the image with raft. Must run on the
    /// apply actor so the image matches the applied index exactly.
    pub fn take(&mut self, raft: &mut RaftNode<DiskStorage>, engine: &Engine) -> Result<SnapshotMeta> {
        let mut image = Vec::new();
        let header = engine
            .export_image(&mut image)
            .map_err(ReplicaError::from_engine)?;
        let bytes = image.len();
        let meta = raft.create_snapshot(header.applied_index, image)?;
        self.last_snapshot = meta.index;
        info!(
            node = raft.id(),
            index = meta.index,
            term = meta.term,
            entries = header.entry_count,
            bytes,
            "snapshot taken"
        );
        Ok(meta)
    }

    /// Drops the log below the retention floor. Returns the new first index.
    pub fn truncate(&mut self, raft: &mut RaftNode<DiskStorage>, engine: &Engine) -> Result<u64> {
        let floor = RetentionFloor {
            snapshot_index: raft.storage().snapshot_meta().index,
            flushed_index: engine.flushed_index(),
            trailing: self.trailing,
        }
        .index();
        if floor <= self.floor {
            return Ok(raft.storage().first_index());
        }
        let first = raft.compact_log(floor)?;
        debug!(node = raft.id(), floor, first_index = first, "retention floor raised");
        self.floor = floor;
        Ok(first)
    }
}
