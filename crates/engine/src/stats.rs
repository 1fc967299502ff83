//! Counters for the monitoring layer. Read-only snapshots; collecting them
//! never blocks the apply path beyond a few uncontended locks.

use sstable::CacheStats;
use std::sync::atomic::Ordering;

use crate::Engine;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub last_sequence: u64,
    pub applied_index: u64,
    pub flushed_index: u64,
    pub memtable_bytes: usize,
    /// Frozen memtables waiting for the worker.
    pub immutable_memtables: usize,
    pub tables_per_level: Vec<usize>,
    pub bytes_per_level: Vec<u64>,
    /// Levels currently over budget.
    pub compaction_backlog: usize,
    pub flushes: u64,
    pub compactions: u64,
    pub block_cache: CacheStats,
    pub bloom_cache: CacheStats,
    pub gc_watermark: u64,
    pub pinned_snapshots: usize,
    pub oldest_pinned: Option<u64>,
    /// Last failure of the background worker, cleared by the next success.
    pub background_error: Option<String>,
}

impl Engine {
    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let v = shared.current();
        EngineStats {
            last_sequence: self.last_sequence(),
            applied_index: self.applied_index(),
            flushed_index: self.flushed_index(),
            memtable_bytes: v.active.approx_size()
                + v.immutables.iter().map(|m| m.approx_size()).sum::<usize>(),
            immutable_memtables: v.immutables.len(),
            tables_per_level: v.levels.iter().map(Vec::len).collect(),
            bytes_per_level: (0..v.levels.len()).map(|l| v.level_bytes(l)).collect(),
            compaction_backlog: shared.compaction_backlog(&v),
            flushes: shared.flushes.load(Ordering::Relaxed),
            compactions: shared.compactions.load(Ordering::Relaxed),
            block_cache: shared.block_cache.stats(),
            bloom_cache: shared.bloom_cache.stats(),
            gc_watermark: shared.snapshots.watermark(),
            pinned_snapshots: shared.snapshots.len(),
            oldest_pinned: shared.snapshots.oldest(),
            background_error: shared.background_error.lock().clone(),
        }
    }
}
