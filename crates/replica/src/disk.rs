//! Durable [`raft::Storage`] over the segmented WAL, the hard state file and
//! the snapshot file.
//!
//! ```text
//! <data_dir>/raft/
//!   wal/log-{first_index:020}.wal
//!   hard_state
//!   snapshot
//!   vote_lost      present once a wipe found the hard state unreadable
//! ```
//!
//! Every entry is also cached in memory, so reads never touch the disk. The
//! cache is updated only after the corresponding disk write succeeded. A
//! failed append may leave part of its frames in the newest segment; the
//! log cuts them off before the next append, and the fence does so before
//! it lifts, so they never reappear on restart.
//!
//! WAL prefix truncation drops whole segments only, so records below the
//! logical first index may survive a restart. They are served again after
//! reopening as long as they continue into the snapshot without a gap.

use crate::snapfile::SnapshotFile;
use raft::{Command, Entry, HardState, SnapshotMeta, Storage, StorageError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use wal::{SegmentedLog, WalError, WalRecord};

const WAL_DIR: &str = "wal";
const VOTE_LOST_FILE: &str = "vote_lost";

/// Switches that make the durable writes of a [`DiskStorage`] fail, used to
/// exercise the durability fence.
#[derive(Debug, Clone, Default)]
pub struct WriteFault {
    failing: Arc<AtomicBool>,
    torn: Arc<AtomicBool>,
}

impl WriteFault {
    /// Every durable write fails before touching a file.
    pub fn set(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every durable write fails; a log append first leaves half of its
    /// first frame at the end of the newest segment.
    pub fn set_torn(&self, torn: bool) {
        self.torn.store(torn, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.failing.load(Ordering::SeqCst) || self.is_torn()
    }

    fn is_torn(&self) -> bool {
        self.torn.load(Ordering::SeqCst)
    }
}

pub struct DiskStorage {
    dir: PathBuf,
    log: SegmentedLog,
    hard_state: HardState,
    snapshot: Option<SnapshotFile>,
    /// Index of the entry before `entries[0]`, and its term when known.
    offset: u64,
    offset_term: Option<u64>,
    entries: Vec<Entry>,
    fault: WriteFault,
    vote_lost: bool,
}

impl std::fmt::Debug for DiskStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStorage")
            .field("dir", &self.dir)
            .field("first_index", &self.first_index())
            .field("last_index", &self.last_index())
            .field("snapshot_index", &self.snapshot_meta().index)
            .finish()
    }
}

impl DiskStorage {
    /// Opens the raft state under `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// `Corrupt` when a sealed WAL segment, the hard state or the snapshot
    /// fails its checksum, or when the log and the snapshot leave a gap.
    pub fn open(dir: &Path, segment_bytes: u64, sync: bool) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| StorageError::Io(e.to_string()))?;
        let hs = wal::HardState::load(dir).map_err(wal_err)?;
        let snapshot = SnapshotFile::load(dir)?;
        let (mut log, records) =
            SegmentedLog::open(&dir.join(WAL_DIR), segment_bytes, sync).map_err(wal_err)?;

        let mut entries = Vec::with_capacity(records.len());
        for rec in records {
            let command = Command::decode(&rec.payload)
                .map_err(|e| StorageError::Corrupt(format!("log entry {}: {}", rec.index, e)))?;
            entries.push(Entry::new(rec.index, rec.term, command));
        }

        let (snap_index, snap_term) = snapshot
            .as_ref()
            .map_or((0, 0), |s| (s.meta().index, s.meta().term));
        let mut offset = snap_index;
        let mut offset_term = Some(snap_term);
        let bounds = entries
            .first()
            .map(|e| e.index)
            .zip(entries.last().map(|e| e.index));
        if let Some((first, last)) = bounds {
            if first > snap_index + 1 {
                return Err(StorageError::Corrupt(format!(
                    "log starts at {} but the snapshot ends at {}",
                    first, snap_index
                )));
            }
            let conflicting = snap_index >= first
                && entries[(snap_index - first) as usize].term != snap_term;
            if last < snap_index || conflicting {
                // installed snapshot superseded this log before the reset
                warn!(
                    dir = %dir.display(),
                    first,
                    last,
                    snapshot_index = snap_index,
                    "discarding log older than the snapshot"
                );
                log.reset().map_err(wal_err)?;
                entries.clear();
            } else {
                offset = first - 1;
                offset_term = if offset == snap_index {
                    Some(snap_term)
                } else if offset == 0 {
                    Some(0)
                } else {
                    None
                };
            }
        }

        let hard_state = HardState {
            term: hs.term,
            voted_for: hs.voted_for,
            commit: hs.commit,
        };
        info!(
            dir = %dir.display(),
            term = hard_state.term,
            commit = hard_state.commit,
            first_index = offset + 1,
            last_index = offset + entries.len() as u64,
            snapshot_index = snap_index,
            "raft storage opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            log,
            hard_state,
            snapshot,
            offset,
            offset_term,
            entries,
            fault: WriteFault::default(),
            vote_lost: dir.join(VOTE_LOST_FILE).exists(),
        })
    }

    /// Removes the log and the snapshot under `dir` but keeps term and vote,
    /// so a resynced node cannot vote twice in a term it already voted in.
    ///
    /// An unreadable hard state takes the vote with it. The directory is then
    /// marked with a `vote_lost` file before the hard state is reset, and the
    /// mark is never removed: see [`vote_lost`](Self::vote_lost).
    pub fn wipe_keeping_vote(dir: &Path) -> Result<(), StorageError> {
        if !dir.exists() {
            return Ok(());
        }
        let mut hs = match wal::HardState::load(dir) {
            Ok(hs) => hs,
            Err(WalError::Corrupt { .. }) => {
                mark_vote_lost(dir)?;
                wal::HardState::default()
            }
            Err(e) => return Err(wal_err(e)),
        };
        hs.commit = 0;
        hs.store(dir).map_err(wal_err)?;
        SnapshotFile::remove(dir)?;
        let wal_dir = dir.join(WAL_DIR);
        if wal_dir.exists() {
            fs::remove_dir_all(&wal_dir).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        warn!(dir = %dir.display(), term = hs.term, "wiped raft log and snapshot");
        Ok(())
    }

    /// Whether a wipe ever lost this node's vote. Such a node may already
    /// have voted in any term, so it must never vote or campaign again.
    pub fn vote_lost(&self) -> bool {
        self.vote_lost
    }

    pub fn write_fault(&self) -> WriteFault {
        self.fault.clone()
    }

    /// The whole snapshot image.
    pub fn snapshot_data(&self) -> Result<Vec<u8>, StorageError> {
        match &self.snapshot {
            Some(s) => s.read_data(),
            None => Ok(Vec::new()),
        }
    }

    /// Number of WAL segment files.
    pub fn segment_count(&self) -> usize {
        self.log.segment_count()
    }

    /// Checks that the storage accepts durable writes again by rewriting the
    /// hard state and syncing the log.
    /// Bytes a failed append left at the log tail are cut off first.
    pub fn probe(&mut self) -> Result<(), StorageError> {
        self.check_fault()?;
        self.log.discard_unacknowledged().map_err(wal_err)?;
        let hs = self.hard_state;
        self.store_hard_state(&hs)?;
        self.log.sync().map_err(wal_err)
    }

    /// Writes the first half of `record`'s frame behind the log's back.
    fn leave_torn_frame(&self, record: &WalRecord) -> Result<(), StorageError> {
        let Some(path) = self.log.tail_path() else {
            return Ok(());
        };
        let mut frame = Vec::new();
        wal::encode_frame(record, &mut frame).map_err(wal_err)?;
        let io = |e: std::io::Error| StorageError::Io(e.to_string());
        let mut f = fs::OpenOptions::new().append(true).open(path).map_err(io)?;
        f.write_all(&frame[..frame.len() / 2]).map_err(io)?;
        f.sync_all().map_err(io)
    }

    fn check_fault(&self) -> Result<(), StorageError> {
        if self.fault.is_set() {
            return Err(StorageError::Io("injected write failure".into()));
        }
        Ok(())
    }

    fn store_hard_state(&self, hs: &HardState) -> Result<(), StorageError> {
        wal::HardState {
            term: hs.term,
            voted_for: hs.voted_for,
            commit: hs.commit,
        }
        .store(&self.dir)
        .map_err(wal_err)
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index <= self.offset {
            return None;
        }
        let pos = (index - self.offset - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }
}

impl Storage for DiskStorage {
    fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError> {
        self.check_fault()?;
        self.store_hard_state(hs)?;
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
            return Ok(self.offset_term);
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
        let end = ((hi - self.offset - 1) as usize).min(start.saturating_add(max));
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
        let records: Vec<WalRecord> = entries
            .iter()
            .map(|e| WalRecord::new(e.index, e.term, e.command.encode()))
            .collect();
        if self.fault.is_torn() {
            self.leave_torn_frame(&records[0])?;
        }
        self.check_fault()?;
        if self.log.last_index().map_or(false, |last| first <= last) {
            self.log.truncate_suffix(first).map_err(wal_err)?;
            self.entries.truncate((first - self.offset - 1) as usize);
        }
        self.log.append(&records).map_err(wal_err)?;
        self.entries.truncate((first - self.offset - 1) as usize);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn snapshot_meta(&self) -> SnapshotMeta {
        self.snapshot
            .as_ref()
            .map(|s| s.meta().clone())
            .unwrap_or_default()
    }

    fn snapshot_chunk(&self, offset: u64, max_len: usize) -> Result<(Vec<u8>, bool), StorageError> {
        match &self.snapshot {
            Some(s) => s.read_chunk(offset, max_len),
            None => Ok((Vec::new(), true)),
        }
    }

    fn apply_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError> {
        self.check_fault()?;
        // the snapshot is durable before the log it replaces is dropped
        let file = SnapshotFile::write(&self.dir, &meta, &data)?;
        self.snapshot = Some(file);
        self.log.reset().map_err(wal_err)?;
        self.entries.clear();
        self.offset = meta.index;
        self.offset_term = Some(meta.term);

        let mut hs = self.hard_state;
        hs.commit = hs.commit.max(meta.index);
        self.store_hard_state(&hs)?;
        self.hard_state = hs;
        Ok(())
    }

    fn save_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<(), StorageError> {
        self.check_fault()?;
        let file = SnapshotFile::write(&self.dir, &meta, &data)?;
        self.snapshot = Some(file);
        Ok(())
    }

    fn compact(&mut self, up_to: u64) -> Result<(), StorageError> {
        if up_to <= self.offset {
            return Ok(());
        }
        if up_to > self.last_index() {
            return Err(StorageError::Unavailable(up_to));
        }
        let term = self.term(up_to)?;
        self.log.compact_prefix(up_to).map_err(wal_err)?;
        self.entries.drain(..(up_to - self.offset) as usize);
        self.offset = up_to;
        self.offset_term = term;
        Ok(())
    }
}

/// Durably creates the `vote_lost` mark in `dir`.
fn mark_vote_lost(dir: &Path) -> Result<(), StorageError> {
    let io = |e: std::io::Error| StorageError::Io(e.to_string());
    let path = dir.join(VOTE_LOST_FILE);
    fs::File::create(&path).and_then(|f| f.sync_all()).map_err(io)?;
    fs::File::open(dir).and_then(|d| d.sync_all()).map_err(io)?;
    warn!(dir = %dir.display(), "hard state unreadable; vote marked as lost");
    Ok(())
}

fn wal_err(e: WalError) -> StorageError {
    match e {
        WalError::Io(e) => StorageError::Io(e.to_string()),
        other => StorageError::Corrupt(other.to_string()),
    }
}
