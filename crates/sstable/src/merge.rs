//! K-way merge over sorted version streams.
//!
//! Sources are memtable snapshots or [`TableIterator`](crate::TableIterator)s,
//! each already ordered by `(key ASC, seq DESC)`. The merge yields the union
//! in that same order. When two sources hold the identical `(key, seq)`
//! version (a flushed memtable and its table during a swap), only the copy
//! from the lower-numbered source is emitted, so callers list sources newest
//! first.
//!
//! Picking which versions survive (visibility, compaction retention) is left
//! to the caller.

use anyhow::Result;
use memtable::Entry;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::format::cmp_internal;

pub type EntrySource = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Head of one source, ordered for a min-heap on `BinaryHeap`.
struct HeapEntry {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the smallest version pops
        // first; on ties the lower source index wins.
        cmp_internal(
            &other.entry.key,
            other.entry.seq,
            &self.entry.key,
            self.entry.seq,
        )
        .then_with(|| other.source.cmp(&self.source))
    }
}

pub struct MergeIterator {
    sources: Vec<EntrySource>,
    heap: BinaryHeap<HeapEntry>,
    /// `(key, seq)` of the last emitted version, for duplicate suppression.
    last: Option<(Vec<u8>, u64)>,
    failed: bool,
}

impl MergeIterator {
    /// Builds the merge. `sources` must be listed newest first.
    pub fn new(sources: Vec<EntrySource>) -> Result<Self> {
        let mut merge = Self {
            sources,
            heap: BinaryHeap::new(),
            last: None,
            failed: false,
        };
        for i in 0..merge.sources.len() {
            merge.refill(i)?;
        }
        Ok(merge)
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                entry: next?,
                source,
            });
        }
        Ok(())
    }

    /// Returns the next version, or `None` when every source is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        while let Some(top) = self.heap.pop() {
            self.refill(top.source)?;
            let is_dup = self
                .last
                .as_ref()
                .is_some_and(|(k, s)| *s == top.entry.seq && *k == top.entry.key);
            if is_dup {
                continue;
            }
            self.last = Some((top.entry.key.clone(), top.entry.seq));
            return Ok(Some(top.entry));
        }
        Ok(None)
    }

    /// Collects all remaining versions.
    pub fn collect_all(&mut self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(e) = self.next_entry()? {
            out.push(e);
        }
        Ok(out)
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(Some(e)) => Some(Ok(e)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Reduces a merged version stream to what a read at `snapshot_seq` sees:
/// the newest version per key with `seq <= snapshot_seq`, tombstones
/// dropped. Yields `(key, value)`.
pub struct VisibleIter<I> {
    inner: I,
    snapshot_seq: u64,
    current_key: Option<Vec<u8>>,
}

impl<I> VisibleIter<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    pub fn new(inner: I, snapshot_seq: u64) -> Self {
        Self {
            inner,
            snapshot_seq,
            current_key: None,
        }
    }
}

impl<I> Iterator for VisibleIter<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(e) => e,
                Err(e) => return Some(Err(e)),
            };
            if entry.seq > self.snapshot_seq {
                continue;
            }
            if self.current_key.as_deref() == Some(entry.key.as_slice()) {
                // an older version of a key already decided
                continue;
            }
            self.current_key = Some(entry.key.clone());
            if let Some(value) = entry.value {
                return Some(Ok((entry.key, value)));
            }
        }
    }
}
