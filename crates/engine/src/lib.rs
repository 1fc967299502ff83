//! # Engine - RiptideKV state machine
//!
//! The LSM-tree that committed log entries are applied to. It ties together
//! the [`memtable`] and [`sstable`] crates; durability of not-yet-flushed
//! writes is the replicated log's job, so the engine only records how far
//! its tables reach (`flushed_index`) and the owner replays the log from
//! there after a restart.
//!
//! ## Architecture
//!
//! ```text
//! apply actor (single thread)
//!   |
//!   v
//! ┌────────────────────────────────────────────────────────┐
//! │                        ENGINE                          │
//! │                                                        │
//! │ write.rs → active memtable                             │
//! │              |  (threshold exceeded?) rotate           │
//! │              v                                         │
//! │           immutables ──Task::Flush──▶ worker.rs        │
//! │                                         |              │
//! │                          flush → L0 table              │
//! │                          compaction.rs → L1..Ln        │
//! │                                         |              │
//! │                          manifest save, Version swap   │
//! │                                                        │
//! │ read.rs → Version snapshot: active → immutables →      │
//! │           L0 (newest first) → L1..Ln                   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                   |
//! |----------------|-----------------------------------------------------------|
//! | [`version`]    | `Version` table set, `Table` with deferred file deletion  |
//! | [`recovery`]   | Manifest load, orphan / tmp cleanup, table verification   |
//! | [`write`]      | `apply_put()`, `apply_delete()`, rotation, `force_flush()`|
//! | [`read`]       | `get()`, `get_at()`, `scan()`, `scan_at()`                |
//! | [`compaction`] | leveled compaction with snapshot-aware version GC         |
//! | [`worker`]     | background flush / compaction thread with retry backoff   |
//! | [`snapshot`]   | pinned read snapshots and the GC watermark                |
//! | [`image`]      | state image export / install for consensus snapshots      |
//! | [`manifest`]   | persistent table set (atomic file ops)                    |
//! | [`stats`]      | counters for monitoring                                   |
//!
//! ## Consistency
//!
//! The current [`Version`] sits behind an `ArcSwap`. A read loads it once
//! and works on that immutable view, so a concurrent rotation, flush or
//! compaction is never observed half done. Publishing a new version is a
//! single pointer store, made after the manifest describing it is durable.
mod compaction;
mod image;
mod manifest;
mod read;
mod recovery;
mod snapshot;
mod stats;
mod version;
mod worker;
mod write;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use config::StorageConfig;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use sstable::{BlockCache, BloomFilterCache};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub use image::{ImageHeader, IMAGE_MAGIC};
pub use manifest::{Manifest, TableMeta, MANIFEST_FILENAME};
pub use snapshot::ReadSnapshot;
pub use stats::EngineStats;
pub use version::{Table, Version};
pub use write::ApplyOutcome;

use snapshot::SnapshotRegistry;
use worker::Task;

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Name of the table directory inside `StorageConfig::data_dir`.
pub const TABLE_DIR: &str = "sst";

/// A read asked for a sequence whose older versions compaction may already
/// have discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("snapshot {requested} is below the GC watermark {watermark}")]
pub struct SnapshotTooOld {
    pub requested: u64,
    pub watermark: u64,
}

/// `true` if `err` (or anything in its chain) is a [`SnapshotTooOld`].
pub fn is_snapshot_too_old(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<SnapshotTooOld>().is_some())
}

/// Everything the apply path, readers and the background worker share.
pub(crate) struct Shared {
    pub(crate) config: StorageConfig,
    pub(crate) sst_dir: PathBuf,
    pub(crate) version: ArcSwap<Version>,
    /// Serializes apply-path memtable writes against rotation.
    pub(crate) write_lock: Mutex<()>,
    /// Serializes load-modify-store of `version`.
    pub(crate) install_lock: Mutex<()>,
    /// Held while a flush, compaction or image install runs.
    pub(crate) background_lock: Mutex<()>,
    pub(crate) manifest: Mutex<Manifest>,
    pub(crate) block_cache: Arc<BlockCache>,
    pub(crate) bloom_cache: BloomFilterCache,
    pub(crate) snapshots: SnapshotRegistry,
    pub(crate) next_file_id: AtomicU64,
    pub(crate) next_memtable_id: AtomicU64,
    pub(crate) last_sequence: AtomicU64,
    pub(crate) applied_index: AtomicU64,
    pub(crate) flushed_index: AtomicU64,
    /// Per level, the max key of the last table compacted out of it.
    pub(crate) compact_pointer: Mutex<Vec<Vec<u8>>>,
    pub(crate) flushes: AtomicU64,
    pub(crate) compactions: AtomicU64,
    pub(crate) background_error: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn current(&self) -> Arc<Version> {
        self.version.load_full()
    }

    /// Applies `edit` to a copy of the current version and publishes it.
    pub(crate) fn publish(&self, edit: impl FnOnce(&mut Version)) {
        let _g = self.install_lock.lock();
        let mut next = Version::clone(&self.version.load());
        edit(&mut next);
        self.version.store(Arc::new(next));
    }

    pub(crate) fn allocate_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// The storage state machine.
///
/// # Write Path
///
/// Only the owner's apply actor writes, through
/// [`apply_put`](Engine::apply_put), [`apply_delete`](Engine::apply_delete)
/// and [`note_applied`](Engine::note_applied), strictly in log index order.
/// When the active memtable reaches `memtable_size_threshold` it is frozen,
/// swapped for an empty one, and queued for the background worker.
///
/// # Read Path
///
/// Every layer is consulted and the version with the greatest sequence not
/// exceeding the read's snapshot sequence wins; layers whose highest
/// sequence cannot beat the current candidate are skipped.
///
/// # Recovery
///
/// [`Engine::open`] loads the committed table set from the manifest. Writes
/// applied after [`flushed_index`](Engine::flushed_index) are not in any
/// table and must be re-applied from the log.
pub struct Engine {
    pub(crate) shared: Arc<Shared>,
    tasks: Sender<Task>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.shared.current();
        f.debug_struct("Engine")
            .field("sst_dir", &self.shared.sst_dir)
            .field("last_sequence", &self.last_sequence())
            .field("applied_index", &self.applied_index())
            .field("flushed_index", &self.flushed_index())
            .field("memtable_size", &v.active.approx_size())
            .field("immutables", &v.immutables.len())
            .field("tables", &v.table_count())
            .finish()
    }
}

impl Engine {
    /// Opens (or creates) the engine rooted at `config.data_dir`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Create the table directory if it does not exist.
    /// 2. Delete leftover `.tmp` files from interrupted writes.
    /// 3. Load the manifest and open every table it lists.
    /// 4. Delete table files the manifest does not list.
    /// 5. Start the background worker.
    ///
    /// # Errors
    ///
    /// A listed table that is missing or fails its checksums is reported as
    /// an `sstable::CorruptionError`; the caller must resync from a peer.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(recovery::recover(config)?);
        let (tasks, rx) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("engine-worker".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || worker::run(shared, rx)
            })
            .context("spawning engine worker")?;
        let engine = Self {
            shared,
            tasks,
            worker: Some(worker),
        };
        // tables may already be over budget from a previous run
        engine.schedule(Task::Compact);
        Ok(engine)
    }

    /// Deletes every table and the manifest under `config.data_dir`, leaving
    /// an empty store. Used before re-seeding a node from a healthy replica.
    pub fn wipe(config: &StorageConfig) -> Result<()> {
        let dir = config.data_dir.join(TABLE_DIR);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing {}", dir.display()))?;
            tracing::warn!(dir = %dir.display(), "wiped local table data");
        }
        Ok(())
    }

    pub(crate) fn schedule(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            tracing::error!("engine worker is gone; background work not scheduled");
        }
    }

    /// Blocks until the worker has drained every task queued so far.
    pub fn wait_for_background(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.schedule(Task::Barrier(tx));
        let _ = rx.recv();
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Highest write sequence applied so far.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.shared.last_sequence.load(Ordering::Acquire)
    }

    /// Index of the last log entry applied.
    #[must_use]
    pub fn applied_index(&self) -> u64 {
        self.shared.applied_index.load(Ordering::Acquire)
    }

    /// Every entry up to this index is durable in committed tables.
    #[must_use]
    pub fn flushed_index(&self) -> u64 {
        self.shared.flushed_index.load(Ordering::Acquire)
    }

    /// Reads below this sequence fail unless pinned.
    #[must_use]
    pub fn gc_watermark(&self) -> u64 {
        self.shared.snapshots.watermark()
    }

    /// The table set as of now.
    pub fn current_version(&self) -> Arc<Version> {
        self.shared.current()
    }

    #[must_use]
    pub fn sstable_count(&self) -> usize {
        self.shared.current().table_count()
    }

    /// Number of tables per level, L0 first.
    pub fn level_table_counts(&self) -> Vec<usize> {
        self.shared.current().levels.iter().map(Vec::len).collect()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.tasks.send(Task::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("engine worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests;
