//! The published table set.
//!
//! A [`Version`] is an immutable description of everything a read must
//! consult: the active memtable, the frozen memtables awaiting flush and the
//! tables of every level. The engine holds the current one behind an
//! `ArcSwap`; readers `load_full()` it once at read start and keep that view
//! until they drop it. Writers (rotation, flush, compaction) build a new
//! `Version` and publish it with a single `store`.

use memtable::Memtable;
use sstable::SSTableReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A committed table plus its deletion flag.
///
/// Once a compaction subsumes a table it is marked obsolete; the file is
/// unlinked when the last `Arc<Table>` (the last version referencing it) is
/// dropped, so an in-flight read never loses a file under it.
pub struct Table {
    pub(crate) reader: Arc<SSTableReader>,
    pub(crate) level: usize,
    obsolete: AtomicBool,
}

impl Table {
    pub(crate) fn new(reader: SSTableReader, level: usize) -> Self {
        Self {
            reader: Arc::new(reader),
            level,
            obsolete: AtomicBool::new(false),
        }
    }

    /// Same file, assigned to another level (trivial moves, manifest reload).
    pub(crate) fn moved(&self, level: usize) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            level,
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.reader.id()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn file_size(&self) -> u64 {
        self.reader.file_size()
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.reader.path().to_path_buf()
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            let path = self.path();
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "deleted obsolete table"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete obsolete table"),
            }
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id())
            .field("level", &self.level)
            .field("min_key", &String::from_utf8_lossy(self.reader.min_key()))
            .field("max_key", &String::from_utf8_lossy(self.reader.max_key()))
            .finish()
    }
}

/// One consistent view of "current + immutable" tables.
#[derive(Clone)]
pub struct Version {
    pub(crate) active: Arc<Memtable>,
    /// Frozen memtables, newest first.
    pub(crate) immutables: Vec<Arc<Memtable>>,
    /// `levels[0]` is newest first and may overlap; deeper levels are sorted
    /// by `min_key` and never overlap.
    pub(crate) levels: Vec<Vec<Arc<Table>>>,
}

impl Version {
    pub(crate) fn empty(active: Arc<Memtable>, max_levels: usize) -> Self {
        Self {
            active,
            immutables: Vec::new(),
            levels: vec![Vec::new(); max_levels],
        }
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.levels[level].iter().map(|t| t.file_size()).sum()
    }

    pub(crate) fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.levels.iter().flatten()
    }

    /// Tables of `level` whose key range intersects `[start, end]` (inclusive).
    pub(crate) fn overlapping(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<Table>> {
        self.levels[level]
            .iter()
            .filter(|t| t.reader.max_key() >= start && t.reader.min_key() <= end)
            .cloned()
            .collect()
    }

    /// Places `table` into its level, keeping the level's ordering rule.
    pub(crate) fn insert_table(&mut self, table: Arc<Table>) {
        let level = table.level;
        if level == 0 {
            self.levels[0].insert(0, table);
        } else {
            let tables = &mut self.levels[level];
            let pos = tables.partition_point(|t| t.reader.min_key() < table.reader.min_key());
            tables.insert(pos, table);
        }
    }

    /// Adds a table read from the manifest, which lists L0 newest first.
    pub(crate) fn push_loaded(&mut self, table: Arc<Table>) {
        if table.level == 0 {
            self.levels[0].push(table);
        } else {
            self.insert_table(table);
        }
    }

    pub(crate) fn remove_tables(&mut self, ids: &[u64]) {
        for level in &mut self.levels {
            level.retain(|t| !ids.contains(&t.id()));
        }
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("active", &self.active.id())
            .field("immutables", &self.immutables.len())
            .field(
                "levels",
                &self.levels.iter().map(Vec::len).collect::<Vec<_>>(),
            )
            .finish()
    }
}
