//! Segmented log: the durable log split over files named
//! `log-{first_index:020}.wal`.
//!
//! Only the newest segment is ever appended to. Prefix truncation (after a
//! snapshot) deletes whole segments; suffix truncation (a follower dropping a
//! conflicting tail) cuts the containing segment at a record boundary.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::{sync_dir, WalError, WalReader, WalRecord, WalWriter};

const SEGMENT_PREFIX: &str = "log-";
const SEGMENT_SUFFIX: &str = ".wal";

#[derive(Debug)]
struct Segment {
    first_index: u64,
    path: PathBuf,
    /// Byte offset of every record, `offsets[i]` holds `first_index + i`.
    offsets: Vec<u64>,
    size: u64,
}

impl Segment {
    fn last_index(&self) -> Option<u64> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(self.first_index + self.offsets.len() as u64 - 1)
        }
    }
}

/// The durable log as an ordered list of segment files.
pub struct SegmentedLog {
    dir: PathBuf,
    segment_bytes: u64,
    sync: bool,
    segments: Vec<Segment>,
    writer: Option<WalWriter>,
}

impl std::fmt::Debug for SegmentedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedLog")
            .field("dir", &self.dir)
            .field("segments", &self.segments.len())
            .field("first_index", &self.first_index())
            .field("last_index", &self.last_index())
            .finish()
    }
}

impl SegmentedLog {
    /// Opens the log in `dir`, replaying every segment.
    ///
    /// A torn or checksum-failing frame in the **newest** segment is a partial
    /// write from a crash: the segment is cut back to the last good record.
    /// The same damage in an older, sealed segment is reported as corruption.
    pub fn open(
        dir: &Path,
        segment_bytes: u64,
        sync: bool,
    ) -> Result<(Self, Vec<WalRecord>), WalError> {
        fs::create_dir_all(dir)?;

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for dent in fs::read_dir(dir)? {
            let path = dent?.path();
            if let Some(first) = parse_segment_name(&path) {
                found.push((first, path));
            }
        }
        found.sort_by_key(|(first, _)| *first);

        let mut segments = Vec::with_capacity(found.len());
        let mut records: Vec<WalRecord> = Vec::new();
        let count = found.len();

        for (pos, (first_index, path)) in found.into_iter().enumerate() {
            let is_tail = pos + 1 == count;
            let file_len = fs::metadata(&path)?.len();

            let mut seg_records = Vec::new();
            let valid_len = match WalReader::open(&path)?.replay(|r| seg_records.push(r)) {
                Ok(len) => len,
                Err(WalError::Corrupt { offset }) if is_tail => offset,
                Err(e) => return Err(e),
            };

            if valid_len < file_len {
                if !is_tail {
                    return Err(WalError::Corrupt { offset: valid_len });
                }
                tracing::warn!(
                    segment = %path.display(),
                    valid_len,
                    file_len,
                    "discarding torn tail of log segment"
                );
                let f = OpenOptions::new().write(true).open(&path)?;
                f.set_len(valid_len)?;
                f.sync_all()?;
            }

            let mut offsets = Vec::with_capacity(seg_records.len());
            let mut at = 0u64;
            for (i, rec) in seg_records.iter().enumerate() {
                let expected = first_index + i as u64;
                if rec.index != expected {
                    return Err(WalError::Discontinuity {
                        expected,
                        got: rec.index,
                    });
                }
                offsets.push(at);
                at += rec.framed_len();
            }

            if let (Some(prev), Some(first)) = (records.last(), seg_records.first()) {
                if first.index != prev.index + 1 {
                    return Err(WalError::Discontinuity {
                        expected: prev.index + 1,
                        got: first.index,
                    });
                }
            }

            records.extend(seg_records);
            segments.push(Segment {
                first_index,
                path,
                offsets,
                size: valid_len,
            });
        }

        let mut log = Self {
            dir: dir.to_path_buf(),
            segment_bytes,
            sync,
            segments,
            writer: None,
        };
        log.reopen_tail()?;

        tracing::debug!(
            dir = %dir.display(),
            segments = log.segments.len(),
            records = records.len(),
            "opened log"
        );
        Ok((log, records))
    }

    /// Index of the oldest record still on disk.
    pub fn first_index(&self) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| !s.offsets.is_empty())
            .map(|s| s.first_index)
    }

    /// Index of the newest record on disk.
    pub fn last_index(&self) -> Option<u64> {
        self.segments.iter().rev().find_map(Segment::last_index)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably appends `records`, which must continue the log without a gap.
    /// An empty log accepts any starting index.
    pub fn append(&mut self, records: &[WalRecord]) -> Result<(), WalError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        for pair in records.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(WalError::Discontinuity {
                    expected: pair[0].index + 1,
                    got: pair[1].index,
                });
            }
        }
        if let Some(last) = self.last_index() {
            if first.index != last + 1 {
                return Err(WalError::Discontinuity {
                    expected: last + 1,
                    got: first.index,
                });
            }
        }

        let needs_roll = match self.segments.last() {
            None => true,
            Some(tail) if tail.offsets.is_empty() => tail.first_index != first.index,
            Some(tail) => tail.size >= self.segment_bytes,
        };
        if needs_roll {
            self.roll(first.index)?;
        }

        self.discard_unacknowledged()?;

        let (Some(writer), Some(tail)) = (self.writer.as_mut(), self.segments.last_mut()) else {
            return Err(WalError::Io(std::io::Error::other("log has no open segment")));
        };
        let written = match writer.append_batch(records) {
            Ok(n) => n,
            Err(e) => {
                if let Err(cut) = self.discard_unacknowledged() {
                    tracing::warn!(error = %cut, "could not cut failed append from log tail");
                }
                return Err(e);
            }
        };

        let mut at = tail.size;
        for rec in records {
            tail.offsets.push(at);
            at += rec.framed_len();
        }
        tail.size += written;
        Ok(())
    }

    /// Removes every record with `index >= from`.
    pub fn truncate_suffix(&mut self, from: u64) -> Result<(), WalError> {
        match self.last_index() {
            Some(last) if from <= last => {}
            _ => return Ok(()),
        }
        self.writer = None;

        while let Some(tail) = self.segments.last_mut() {
            if tail.first_index >= from {
                fs::remove_file(&tail.path)?;
                self.segments.pop();
                continue;
            }
            let keep = (from - tail.first_index) as usize;
            if keep < tail.offsets.len() {
                let new_len = tail.offsets[keep];
                let f = OpenOptions::new().write(true).open(&tail.path)?;
                f.set_len(new_len)?;
                f.sync_all()?;
                tail.offsets.truncate(keep);
                tail.size = new_len;
            }
            break;
        }
        sync_dir(&self.dir);
        tracing::debug!(from, "truncated log suffix");
        self.reopen_tail()
    }

    /// Deletes sealed segments whose records all have `index <= up_to`.
    /// The newest segment is never removed here. Returns how many segments
    /// were deleted.
    pub fn compact_prefix(&mut self, up_to: u64) -> Result<usize, WalError> {
        let mut removed = 0;
        while self.segments.len() > 1 {
            let head = &self.segments[0];
            match head.last_index() {
                Some(last) if last > up_to => break,
                _ => {}
            }
            fs::remove_file(&head.path)?;
            self.segments.remove(0);
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.dir);
            tracing::debug!(up_to, removed, "compacted log prefix");
        }
        Ok(removed)
    }

    /// Deletes every segment. The next append may start at any index.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.writer = None;
        for seg in self.segments.drain(..) {
            fs::remove_file(&seg.path)?;
        }
        sync_dir(&self.dir);
        Ok(())
    }

    /// Cuts bytes past the last acknowledged record off the newest segment.
    ///
    /// A failed append may leave part or all of its frames in the file. They
    /// were never reported as durable and must not reappear on replay or sit
    /// in front of the next append.
    pub fn discard_unacknowledged(&mut self) -> Result<(), WalError> {
        let (Some(writer), Some(tail)) = (self.writer.as_mut(), self.segments.last()) else {
            return Ok(());
        };
        let on_disk = writer.file_len()?;
        if on_disk != tail.size {
            tracing::warn!(
                segment = %tail.path.display(),
                acknowledged = tail.size,
                on_disk,
                "discarding unacknowledged bytes at log tail"
            );
            writer.truncate(tail.size)?;
        }
        Ok(())
    }

    /// Path of the segment receiving appends.
    pub fn tail_path(&self) -> Option<&Path> {
        self.segments.last().map(|s| s.path.as_path())
    }

    pub fn sync(&mut self) -> Result<(), WalError> {
        match self.writer.as_mut() {
            Some(w) => w.sync_to_disk(),
            None => Ok(()),
        }
    }

    fn roll(&mut self, first_index: u64) -> Result<(), WalError> {
        // An empty tail left by a crash right after rolling is replaced.
        if let Some(tail) = self.segments.last() {
            if tail.offsets.is_empty() {
                self.writer = None;
                fs::remove_file(&tail.path)?;
                self.segments.pop();
            }
        }
        let path = self.dir.join(segment_name(first_index));
        self.writer = Some(WalWriter::create(&path, self.sync)?);
        sync_dir(&self.dir);
        self.segments.push(Segment {
            first_index,
            path,
            offsets: Vec::new(),
            size: 0,
        });
        Ok(())
    }

    fn reopen_tail(&mut self) -> Result<(), WalError> {
        self.writer = match self.segments.last() {
            Some(tail) => Some(WalWriter::create(&tail.path, self.sync)?),
            None => None,
        };
        Ok(())
    }
}

fn segment_name(first_index: u64) -> String {
    format!("{}{:020}{}", SEGMENT_PREFIX, first_index, SEGMENT_SUFFIX)
}

fn parse_segment_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}
