/// Read path: `get()`, `get_at()`, `scan()`, `scan_at()`, `snapshot()`.
///
/// Every read captures the current [`Version`] once and works on it. Point
/// lookups walk the layers newest first (active memtable, immutables, L0
/// newest first, then one candidate table per deeper level) and keep the
/// version with the greatest sequence `<=` the read's snapshot sequence.
/// A layer whose highest sequence cannot beat the current candidate is
/// skipped, which makes the common case (monotonic sequences) stop after
/// the first hit.
///
/// Range scans k-way merge every overlapping layer and reduce the stream
/// with [`VisibleIter`].
use anyhow::Result;
use memtable::ValueEntry;
use sstable::{EntrySource, MergeIterator, VisibleIter};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::version::{Table, Version};
use crate::{Engine, ReadSnapshot, Shared};

impl Shared {
    /// The latest sequence plus a version holding everything at or below it.
    ///
    /// Retries if a compaction that started after the sequence was read has
    /// already been published: it may have collapsed versions the read needs.
    pub(crate) fn latest(&self) -> (u64, Arc<Version>) {
        loop {
            let seq = self.last_sequence.load(Ordering::Acquire);
            let v = self.current();
            if self.snapshots.watermark() <= seq {
                return (seq, v);
            }
        }
    }

    pub(crate) fn table_lookup(
        &self,
        table: &Table,
        key: &[u8],
        seq: u64,
        best: &Option<ValueEntry>,
    ) -> Result<Option<ValueEntry>> {
        let reader = &table.reader;
        if best.as_ref().is_some_and(|b| b.seq >= reader.max_seq()) {
            return Ok(None);
        }
        if key < reader.min_key() || key > reader.max_key() {
            return Ok(None);
        }
        if !self
            .bloom_cache
            .might_contain(reader.id(), key, || reader.load_bloom())?
        {
            return Ok(None);
        }
        reader.get(key, seq, Some(&self.block_cache))
    }

    /// Newest version of `key` visible at `seq`, tombstones included.
    pub(crate) fn lookup(&self, v: &Version, key: &[u8], seq: u64) -> Result<Option<ValueEntry>> {
        let mut best: Option<ValueEntry> = None;
        let consider = |best: &mut Option<ValueEntry>, found: Option<ValueEntry>| {
            if let Some(found) = found {
                if best.as_ref().map_or(true, |b| found.seq > b.seq) {
                    *best = Some(found);
                }
            }
        };

        for mem in std::iter::once(&v.active).chain(v.immutables.iter()) {
            if best.as_ref().is_some_and(|b| b.seq >= mem.max_seq()) {
                continue;
            }
            consider(&mut best, mem.get(key, seq));
        }

        for table in &v.levels[0] {
            let found = self.table_lookup(table, key, seq, &best)?;
            consider(&mut best, found);
        }

        for level in &v.levels[1..] {
            // non-overlapping: at most one table can hold the key
            let pos = level.partition_point(|t| t.reader.max_key() < key);
            if let Some(table) = level.get(pos) {
                let found = self.table_lookup(table, key, seq, &best)?;
                consider(&mut best, found);
            }
        }
        Ok(best)
    }

    /// Live `(key, value)` pairs with `start <= key < end` at `seq`. An empty
    /// bound is unbounded.
    pub(crate) fn range(
        &self,
        v: &Version,
        start: &[u8],
        end: &[u8],
        seq: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let end: Option<Vec<u8>> = (!end.is_empty()).then(|| end.to_vec());
        let mut sources: Vec<EntrySource> = Vec::new();

        for mem in std::iter::once(&v.active).chain(v.immutables.iter()) {
            let entries = mem.scan(start, end.as_deref(), seq);
            sources.push(Box::new(entries.into_iter().map(Ok)));
        }
        for table in v.tables() {
            if !table.reader.overlaps(start, end.as_deref()) {
                continue;
            }
            let iter = table
                .reader
                .iter_from(start, Some(Arc::clone(&self.block_cache)));
            let end = end.clone();
            sources.push(Box::new(iter.take_while(move |e| match (e, &end) {
                (Ok(e), Some(end)) => e.key < *end,
                _ => true,
            })));
        }

        let merge = MergeIterator::new(sources)?;
        VisibleIter::new(merge, seq).collect()
    }
}

impl Engine {
    /// Looks up `key` at the latest applied sequence, returning
    /// `Some((seq, value))` if it is live.
    ///
    /// # Errors
    ///
    /// Returns an error if a table read fails (corruption, I/O).
    pub fn get(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let (seq, v) = self.shared.latest();
        Ok(self
            .shared
            .lookup(&v, key, seq)?
            .and_then(|e| e.value.map(|val| (e.seq, val))))
    }

    /// Looks up `key` as of `snapshot_seq`.
    ///
    /// # Errors
    ///
    /// [`SnapshotTooOld`](crate::SnapshotTooOld) if `snapshot_seq` is below
    /// the GC watermark and not pinned.
    pub fn get_at(&self, key: &[u8], snapshot_seq: u64) -> Result<Option<(u64, Vec<u8>)>> {
        self.shared.snapshots.check(snapshot_seq)?;
        let v = self.shared.current();
        Ok(self
            .shared
            .lookup(&v, key, snapshot_seq)?
            .and_then(|e| e.value.map(|val| (e.seq, val))))
    }

    /// Scans `[start, end)` at the latest applied sequence, returning live
    /// pairs in ascending key order. Pass `b""` for an open bound.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (seq, v) = self.shared.latest();
        self.shared.range(&v, start, end, seq)
    }

    /// Scans `[start, end)` as of `snapshot_seq`.
    pub fn scan_at(
        &self,
        start: &[u8],
        end: &[u8],
        snapshot_seq: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.shared.snapshots.check(snapshot_seq)?;
        let v = self.shared.current();
        self.shared.range(&v, start, end, snapshot_seq)
    }

    /// Pins the latest applied sequence for repeatable reads.
    pub fn snapshot(&self) -> Result<ReadSnapshot> {
        loop {
            match ReadSnapshot::new(Arc::clone(&self.shared), self.last_sequence()) {
                // a compaction raised the watermark past the sequence just read
                Err(e) if crate::is_snapshot_too_old(&e) => continue,
                other => return other,
            }
        }
    }

    /// Pins an explicit sequence.
    ///
    /// # Errors
    ///
    /// [`SnapshotTooOld`](crate::SnapshotTooOld) if it is below the GC
    /// watermark.
    pub fn snapshot_at(&self, seq: u64) -> Result<ReadSnapshot> {
        ReadSnapshot::new(Arc::clone(&self.shared), seq)
    }
}
