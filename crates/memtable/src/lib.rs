//! # Memtable
//!
//! Multi-version in-memory write buffer.
//!
//! Entries are ordered by `(key ASC, seq DESC)` so that all versions of a key
//! are adjacent and the newest comes first. A read at snapshot sequence `S`
//! sees, per key, the version with the greatest `seq <= S`; a tombstone
//! (`value == None`) at that position hides every older version.
//!
//! The table is internally locked: a single writer (the apply path) inserts
//! while any number of readers look up or scan concurrently. Once frozen it is
//! shared read-only (`Arc<Memtable>`) until its contents reach an SSTable.

use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Fixed per-version bookkeeping counted towards [`Memtable::approx_size`].
pub const ENTRY_OVERHEAD: usize = 24;

type InternalKey = (Vec<u8>, Reverse<u64>);

/// One version of a key. `value == None` signifies a tombstone (delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub seq: u64,
    pub value: Option<Vec<u8>>,
}

impl Entry {
    pub fn put(key: impl Into<Vec<u8>>, seq: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            seq,
            value: Some(value.into()),
        }
    }

    pub fn tombstone(key: impl Into<Vec<u8>>, seq: u64) -> Self {
        Self {
            key: key.into(),
            seq,
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// The version visible to a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub seq: u64,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Memtable {
    id: u64,
    map: RwLock<BTreeMap<InternalKey, Option<Vec<u8>>>>,
    approx_size: AtomicUsize,
    /// Highest log index whose command was applied into this table.
    max_index: AtomicU64,
    max_seq: AtomicU64,
    frozen: AtomicBool,
}

impl Memtable {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            map: RwLock::new(BTreeMap::new()),
            approx_size: AtomicUsize::new(0),
            max_index: AtomicU64::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Monotonic id assigned by the owner; newer tables have larger ids.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inserts a live version. Returns `false` (and changes nothing) if a
    /// version with the same `(key, seq)` is already present, which makes
    /// replaying the same log entry twice harmless.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> bool {
        self.insert(key, seq, Some(value))
    }

    /// Inserts a tombstone version.
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> bool {
        self.insert(key, seq, None)
    }

    fn insert(&self, key: Vec<u8>, seq: u64, value: Option<Vec<u8>>) -> bool {
        debug_assert!(!self.is_frozen(), "write into frozen memtable {}", self.id);
        let added = ENTRY_OVERHEAD + key.len() + value.as_ref().map_or(0, Vec::len);
        let mut map = self.map.write();
        let slot = (key, Reverse(seq));
        if map.contains_key(&slot) {
            return false;
        }
        map.insert(slot, value);
        drop(map);
        self.approx_size.fetch_add(added, Ordering::Relaxed);
        self.max_seq.fetch_max(seq, Ordering::Relaxed);
        true
    }

    /// Records that every log entry up to `index` has been applied here.
    pub fn note_applied(&self, index: u64) {
        self.max_index.fetch_max(index, Ordering::Release);
    }

    /// Returns the newest version of `key` with `seq <= snapshot_seq`,
    /// tombstones included. `None` means this table knows nothing about the
    /// key at that snapshot and older layers must be consulted.
    pub fn get(&self, key: &[u8], snapshot_seq: u64) -> Option<ValueEntry> {
        let map = self.map.read();
        let lo = (key.to_vec(), Reverse(snapshot_seq));
        let hi = (key.to_vec(), Reverse(0));
        map.range(lo..=hi)
            .next()
            .map(|((_, Reverse(seq)), value)| ValueEntry {
                seq: *seq,
                value: value.clone(),
            })
    }

    /// Returns every version (tombstones included, newest first per key) with
    /// `start <= key < end` and `seq <= snapshot_seq`. `end == None` means
    /// unbounded.
    pub fn scan(&self, start: &[u8], end: Option<&[u8]>, snapshot_seq: u64) -> Vec<Entry> {
        let map = self.map.read();
        let lo: Bound<InternalKey> = Bound::Included((start.to_vec(), Reverse(u64::MAX)));
        let hi: Bound<InternalKey> = match end {
            Some(end) => Bound::Excluded((end.to_vec(), Reverse(u64::MAX))),
            None => Bound::Unbounded,
        };
        map.range((lo, hi))
            .filter(|((_, Reverse(seq)), _)| *seq <= snapshot_seq)
            .map(|((k, Reverse(seq)), v)| Entry {
                key: k.clone(),
                seq: *seq,
                value: v.clone(),
            })
            .collect()
    }

    /// Copies out every version in `(key ASC, seq DESC)` order.
    pub fn entries(&self) -> Vec<Entry> {
        self.scan(&[], None, u64::MAX)
    }

    /// Number of versions, tombstones included.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn approx_size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }

    pub fn max_index(&self) -> u64 {
        self.max_index.load(Ordering::Acquire)
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Relaxed)
    }

    /// Marks the table read-only. Further writes are a logic error.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}
