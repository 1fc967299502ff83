//! Read snapshots.
//!
//! A [`ReadSnapshot`] pins a sequence number: until it is dropped,
//! compaction keeps every version a read at that sequence can observe.
//!
//! The GC watermark is the `last_sequence` seen by the most recent
//! compaction. Versions older than that may have been collapsed, so an
//! unpinned read below the watermark is refused with
//! [`SnapshotTooOld`](crate::SnapshotTooOld) instead of returning data that
//! is silently wrong.

use anyhow::Result;
use memtable::ValueEntry;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Shared, SnapshotTooOld};

#[derive(Debug, Default)]
struct Pins {
    /// sequence -> number of live handles
    counts: BTreeMap<u64, usize>,
    watermark: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SnapshotRegistry {
    inner: Mutex<Pins>,
}

impl SnapshotRegistry {
    pub(crate) fn new(watermark: u64) -> Self {
        Self {
            inner: Mutex::new(Pins {
                counts: BTreeMap::new(),
                watermark,
            }),
        }
    }

    /// Pins `seq`. Fails if versions below it may already be gone.
    pub(crate) fn pin(&self, seq: u64) -> Result<(), SnapshotTooOld> {
        let mut pins = self.inner.lock();
        if seq < pins.watermark && !pins.counts.contains_key(&seq) {
            return Err(SnapshotTooOld {
                requested: seq,
                watermark: pins.watermark,
            });
        }
        *pins.counts.entry(seq).or_insert(0) += 1;
        Ok(())
    }

    pub(crate) fn release(&self, seq: u64) {
        let mut pins = self.inner.lock();
        if let Some(n) = pins.counts.get_mut(&seq) {
            *n -= 1;
            if *n == 0 {
                pins.counts.remove(&seq);
            }
        }
    }

    /// Whether a read at `seq` is still answerable.
    pub(crate) fn check(&self, seq: u64) -> Result<(), SnapshotTooOld> {
        let pins = self.inner.lock();
        if seq >= pins.watermark || pins.counts.contains_key(&seq) {
            Ok(())
        } else {
            Err(SnapshotTooOld {
                requested: seq,
                watermark: pins.watermark,
            })
        }
    }

    /// Raises the watermark to `last_sequence` and returns the pinned
    /// sequences (ascending) a compaction starting now must preserve.
    pub(crate) fn begin_compaction(&self, last_sequence: u64) -> Vec<u64> {
        let mut pins = self.inner.lock();
        pins.watermark = pins.watermark.max(last_sequence);
        pins.counts.keys().copied().collect()
    }

    /// Forgets every pin (the state they referred to was replaced).
    pub(crate) fn reset(&self, watermark: u64) {
        let mut pins = self.inner.lock();
        pins.counts.clear();
        pins.watermark = watermark;
    }

    pub(crate) fn watermark(&self) -> u64 {
        self.inner.lock().watermark
    }

    pub(crate) fn oldest(&self) -> Option<u64> {
        self.inner.lock().counts.keys().next().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().counts.values().sum()
    }
}

/// A pinned, repeatable view of the store at one sequence number.
///
/// Released on drop.
pub struct ReadSnapshot {
    shared: Arc<Shared>,
    seq: u64,
}

impl ReadSnapshot {
    pub(crate) fn new(shared: Arc<Shared>, seq: u64) -> Result<Self> {
        shared.snapshots.pin(seq)?;
        Ok(Self { shared, seq })
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let v = self.shared.current();
        Ok(self
            .shared
            .lookup(&v, key, self.seq)?
            .and_then(|ValueEntry { seq, value }| value.map(|v| (seq, v))))
    }

    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let v = self.shared.current();
        self.shared.range(&v, start, end, self.seq)
    }
}

impl Drop for ReadSnapshot {
    fn drop(&mut self) {
        self.shared.snapshots.release(self.seq);
    }
}

impl std::fmt::Debug for ReadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSnapshot").field("seq", &self.seq).finish()
    }
}
