//! Durable state behind a [`RaftNode`](crate::RaftNode).
//!
//! The node calls its storage synchronously: when a method returns `Ok` the
//! data is expected to survive a crash. The log always starts right after a
//! (possibly empty) compacted prefix; `first_index` is the first entry still
//! held and `last_index` the last one, with `last_index = first_index - 1`
//! for an empty log.

use crate::message::{Entry, SnapshotMeta};
use crate::NodeId;
use thiserror::Error;

/// Vote state that must be durable before a vote or acknowledgement leaves
/// the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("log index {0} is compacted")]
    Compacted(u64),

    #[error("log index {0} is not available")]
    Unavailable(u64),

    #[error("storage i/o: {0}")]
    Io(String),

    #[error("storage corrupted: {0}")]
    Corrupt(String),
}

pub trait Storage {
    fn hard_state(&self) -> HardState;

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError>;

    fn first_index(&self) -> u64;

    fn last_index(&self) -> u64;

    /// Term of the entry at `index`, `None` when it is outside the log. The
    /// entry right before `first_index` reports its term when known, and
    /// index 0 has term 0.
    fn term(&self, index: u64) -> Result<Option<u64>, StorageError>;

    /// Entries in `[lo, hi)`, at most `max` of them.
    fn entries(&self, lo: u64, hi: u64, max: usize) -> Result<Vec<Entry>, StorageError>;

    /// Appends `entries`, first discarding every stored entry at or after
    /// `entries[0].index`.
    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError>;

    fn snapshot_meta(&self) -> SnapshotMeta;

    /// Up to `max_len` bytes of the snapshot image starting at `offset`, and
    /// whether that chunk ends the image.
    fn snapshot_chunk(&self, offset: u64, max_len: usize) -> Result<(Vec<u8>, bool), StorageError>;

    /// Replaces the whole log with a snapshot received from the leader.
    fn apply_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError>;

    /// Records a snapshot taken locally; the log is left untouched.
    fn save_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError>;

    /// Drops every entry up to and including `up_to`.
    fn compact(&mut self, up_to: u64) -> Result<(), StorageError>;
}

/// In-memory [`Storage`]. Nothing survives the process; used by tests and
/// simulations.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    hard_state: HardState,
    snapshot: SnapshotMeta,
    snapshot_data: Vec<u8>,
    /// Index and term of the entry before `entries[0]`.
    offset: u64,
    offset_term: u64,
    entries: Vec<Entry>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_data(&self) -> &[u8] {
        &self.snapshot_data
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index <= self.offset {
            return None;
        }
        let pos = (index - self.offset - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }
}

impl Storage for MemStorage {
    fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError> {
        self.hard_state = *hs;
        Ok(())
    }

    fn first_index(&self) -> u64 {
        self.offset + 1
    }

    fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    fn term(&self, index: u64) -> Result<Option<u64>, StorageError> {
        if index == self.offset {
            return Ok(Some(self.offset_term));
        }
        Ok(self.slot(index).map(|pos| self.entries[pos].term))
    }

    fn entries(&self, lo: u64, hi: u64, max: usize) -> Result<Vec<Entry>, StorageError> {
        if lo <= self.offset {
            return Err(StorageError::Compacted(lo));
        }
        let hi = hi.min(self.last_index() + 1);
        if lo >= hi {
            return Ok(Vec::new());
        }
        let start = (lo - self.offset - 1) as usize;
        let end = (hi - self.offset - 1) as usize;
        let end = end.min(start.saturating_add(max));
        Ok(self.entries[start..end].to_vec())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        let first = match entries.first() {
            Some(e) => e.index,
            None => return Ok(()),
        };
        if first <= self.offset {
            return Err(StorageError::Compacted(first));
        }
        if first > self.last_index() + 1 {
            return Err(StorageError::Unavailable(first));
        }
        self.entries.truncate((first - self.offset - 1) as usize);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn snapshot_meta(&self) -> SnapshotMeta {
        self.snapshot.clone()
    }

    fn snapshot_chunk(&self, offset: u64, max_len: usize) -> Result<(Vec<u8>, bool), StorageError> {
        let start = (offset as usize).min(self.snapshot_data.len());
        let end = start.saturating_add(max_len).min(self.snapshot_data.len());
        Ok((
            self.snapshot_data[start..end].to_vec(),
            end == self.snapshot_data.len(),
        ))
    }

    fn apply_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError> {
        self.offset = meta.index;
        self.offset_term = meta.term;
        self.entries.clear();
        self.hard_state.commit = self.hard_state.commit.max(meta.index);
        self.snapshot = meta;
        self.snapshot_data = data;
        Ok(())
    }

    fn save_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError> {
        self.snapshot = meta;
        self.snapshot_data = data;
        Ok(())
    }

    fn compact(&mut self, up_to: u64) -> Result<(), StorageError> {
        if up_to <= self.offset {
            return Ok(());
        }
        if up_to > self.last_index() {
            return Err(StorageError::Unavailable(up_to));
        }
        let term = self.term(up_to)?.unwrap_or_default();
        self.entries.drain(..(up_to - self.offset) as usize);
        self.offset = up_to;
        self.offset_term = term;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
        range.map(|i| Entry::new(i, term, Command::Noop)).collect()
    }

    #[test]
    fn empty_log_bounds() {
        let s = MemStorage::new();
        assert_eq!(s.first_index(), 1);
        assert_eq!(s.last_index(), 0);
        assert_eq!(s.term(0).unwrap(), Some(0));
        assert_eq!(s.term(1).unwrap(), None);
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let mut s = MemStorage::new();
        s.append(&entries(1..=5, 1)).unwrap();
        s.append(&entries(3..=4, 2)).unwrap();
        assert_eq!(s.last_index(), 4);
        assert_eq!(s.term(2).unwrap(), Some(1));
        assert_eq!(s.term(3).unwrap(), Some(2));
        assert_eq!(s.term(5).unwrap(), None);
    }

    #[test]
    fn append_with_gap_is_refused() {
        let mut s = MemStorage::new();
        s.append(&entries(1..=2, 1)).unwrap();
        assert!(matches!(
            s.append(&entries(4..=4, 1)),
            Err(StorageError::Unavailable(4))
        ));
    }

    #[test]
    fn entries_respects_bounds_and_max() {
        let mut s = MemStorage::new();
        s.append(&entries(1..=10, 1)).unwrap();
        assert_eq!(s.entries(3, 7, 100).unwrap().len(), 4);
        assert_eq!(s.entries(3, 7, 2).unwrap().len(), 2);
        assert_eq!(s.entries(9, 100, 100).unwrap().len(), 2);
        assert!(s.entries(11, 12, 10).unwrap().is_empty());
    }

    #[test]
    fn compaction_keeps_boundary_term() {
        let mut s = MemStorage::new();
        s.append(&entries(1..=3, 1)).unwrap();
        s.append(&entries(4..=6, 2)).unwrap();
        s.compact(4).unwrap();
        assert_eq!(s.first_index(), 5);
        assert_eq!(s.last_index(), 6);
        assert_eq!(s.term(4).unwrap(), Some(2));
        assert_eq!(s.term(3).unwrap(), None);
        assert!(matches!(s.entries(4, 6, 10), Err(StorageError::Compacted(4))));
    }

    #[test]
    fn applied_snapshot_replaces_log() {
        let mut s = MemStorage::new();
        s.append(&entries(1..=3, 1)).unwrap();
        let meta = SnapshotMeta {
            index: 10,
            term: 3,
            membership: Default::default(),
        };
        s.apply_snapshot(meta.clone(), b"image".to_vec()).unwrap();
        assert_eq!(s.first_index(), 11);
        assert_eq!(s.last_index(), 10);
        assert_eq!(s.term(10).unwrap(), Some(3));
        assert_eq!(s.snapshot_meta(), meta);
        assert_eq!(s.hard_state().commit, 10);
    }

    #[test]
    fn snapshot_chunks_cover_image() {
        let mut s = MemStorage::new();
        s.save_snapshot(SnapshotMeta::default(), b"abcdefg".to_vec())
            .unwrap();
        assert_eq!(s.snapshot_chunk(0, 3).unwrap(), (b"abc".to_vec(), false));
        assert_eq!(s.snapshot_chunk(3, 3).unwrap(), (b"def".to_vec(), false));
        assert_eq!(s.snapshot_chunk(6, 3).unwrap(), (b"g".to_vec(), true));
    }
}
