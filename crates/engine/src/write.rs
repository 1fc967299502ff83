/// Write path: `apply_put()`, `apply_delete()`, `note_applied()`,
/// `force_flush()`, memtable rotation and the flush itself.
///
/// Mutations arrive from the owner's single apply actor, already committed
/// by consensus, strictly in log index order. They go straight into the
/// active memtable; rotation and flush never block the caller beyond the
/// pointer swap.
use anyhow::{ensure, Result};
use memtable::Memtable;
use sstable::{SSTableReader, SSTableWriter, TableOptions};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::manifest::{table_file_name, TableMeta};
use crate::version::Table;
use crate::worker::Task;
use crate::{Engine, Shared};

/// What applying one committed write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The write is in the active memtable.
    Written,
    /// The entry was applied before; a replay overlapping the tables.
    AlreadyApplied,
    /// The write's sequence is at or below `floor`. The entry is consumed
    /// without touching any key.
    TooLate { floor: u64 },
}

impl Shared {
    /// Highest sequence a new write can no longer use: `late_write_window`
    /// below the highest applied sequence. Tombstones at or below it may be
    /// purged, since no write can land underneath them any more.
    pub(crate) fn late_floor(&self) -> Option<u64> {
        let last = self.last_sequence.load(Ordering::Acquire);
        if last == 0 {
            return None;
        }
        last.checked_sub(self.config.late_write_window)
    }

    /// Inserts a put (`Some`) or tombstone (`None`) as log entry `index`.
    fn apply_write(
        &self,
        index: u64,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        seq: u64,
    ) -> Result<ApplyOutcome> {
        let _w = self.write_lock.lock();
        if !self.admit(index)? {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        let mem = Arc::clone(&self.version.load().active);
        if let Some(floor) = self.late_floor().filter(|&floor| seq <= floor) {
            tracing::warn!(index, seq, floor, "write sequence below the late-write floor; ignored");
            self.finish_apply(&mem, index, None);
            return Ok(ApplyOutcome::TooLate { floor });
        }
        match value {
            Some(value) => mem.put(key, value, seq),
            None => mem.delete(key, seq),
        };
        self.finish_apply(&mem, index, Some(seq));
        Ok(ApplyOutcome::Written)
    }

    /// Checks that `index` is the next entry to apply. Returns `false` for an
    /// entry that was already applied (a replay overlapping the tables).
    fn admit(&self, index: u64) -> Result<bool> {
        let applied = self.applied_index.load(Ordering::Acquire);
        if index <= applied {
            tracing::debug!(index, applied, "skipping already applied entry");
            return Ok(false);
        }
        ensure!(
            index == applied + 1,
            "apply out of order: entry {} after {}",
            index,
            applied
        );
        Ok(true)
    }

    fn finish_apply(&self, mem: &Memtable, index: u64, seq: Option<u64>) {
        mem.note_applied(index);
        if let Some(seq) = seq {
            self.last_sequence.fetch_max(seq, Ordering::AcqRel);
        }
        self.applied_index.store(index, Ordering::Release);
    }

    /// Freezes the active memtable and swaps in an empty one. Returns
    /// `false` if the active memtable was empty and nothing happened.
    pub(crate) fn rotate(&self) -> bool {
        let _w = self.write_lock.lock();
        let current = self.current();
        if current.active.is_empty() {
            return false;
        }
        let old = Arc::clone(&current.active);
        let fresh = Arc::new(Memtable::new(
            self.next_memtable_id.fetch_add(1, Ordering::SeqCst),
        ));
        old.freeze();
        self.publish(|v| {
            v.immutables.insert(0, old.clone());
            v.active = fresh;
        });
        tracing::debug!(
            memtable = old.id(),
            bytes = old.approx_size(),
            max_index = old.max_index(),
            "rotated memtable"
        );
        true
    }

    /// Flushes the oldest immutable memtable into a new L0 table. Returns
    /// `false` when there was nothing to flush. Caller holds
    /// `background_lock`.
    pub(crate) fn flush_oldest(&self) -> Result<bool> {
        let Some(mem) = self.current().immutables.last().cloned() else {
            return Ok(false);
        };

        let table = if mem.is_empty() {
            None
        } else {
            let id = self.allocate_file_id();
            let path = self.sst_dir.join(table_file_name(id));
            let info = SSTableWriter::write_from_memtable(
                &path,
                &mem,
                TableOptions::from(&self.config),
            )?;
            let reader = SSTableReader::open(&path, id)?;
            tracing::info!(
                memtable = mem.id(),
                table = id,
                entries = info.entry_count,
                bytes = info.file_size,
                max_index = mem.max_index(),
                "flushed memtable"
            );
            Some((Arc::new(Table::new(reader, 0)), info))
        };

        {
            let mut manifest = self.manifest.lock();
            let mut next = manifest.clone();
            if let Some((t, info)) = &table {
                next.add(TableMeta {
                    file_name: table_file_name(t.id()),
                    level: 0,
                    min_key: info.range.min_key.clone(),
                    max_key: info.range.max_key.clone(),
                });
            }
            next.flushed_index = next.flushed_index.max(mem.max_index());
            next.last_sequence = next.last_sequence.max(mem.max_seq());
            next.next_file_id = self.next_file_id.load(Ordering::SeqCst);
            if let Err(e) = next.save() {
                if let Some((t, _)) = &table {
                    // not committed: remove the file when the handle drops
                    t.mark_obsolete();
                }
                return Err(e);
            }
            *manifest = next;
        }

        let mem_id = mem.id();
        self.publish(|v| {
            v.immutables.retain(|m| m.id() != mem_id);
            if let Some((t, _)) = table {
                v.insert_table(t);
            }
        });
        self.flushed_index
            .fetch_max(mem.max_index(), Ordering::AcqRel);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Records `flushed_index = applied_index` when nothing is buffered in
    /// memory, so entries that never touched a memtable (no-ops, membership
    /// changes) stop pinning the log.
    pub(crate) fn advance_flushed_if_idle(&self) -> Result<()> {
        let _w = self.write_lock.lock();
        let v = self.current();
        if !v.active.is_empty() || !v.immutables.is_empty() {
            return Ok(());
        }
        let applied = self.applied_index.load(Ordering::Acquire);
        let mut manifest = self.manifest.lock();
        if manifest.flushed_index >= applied {
            return Ok(());
        }
        let mut next = manifest.clone();
        next.flushed_index = applied;
        next.save()?;
        *manifest = next;
        self.flushed_index.fetch_max(applied, Ordering::AcqRel);
        Ok(())
    }
}

impl Engine {
    /// Applies a committed `Put` at log `index` with write sequence `seq`.
    ///
    /// A sequence more than `late_write_window` below the highest applied
    /// one is not written; see [`ApplyOutcome::TooLate`]. Every replica
    /// makes the same call at the same index.
    ///
    /// # Errors
    ///
    /// Fails if `index` is not the entry right after
    /// [`applied_index`](Engine::applied_index).
    pub fn apply_put(
        &self,
        index: u64,
        key: Vec<u8>,
        value: Vec<u8>,
        seq: u64,
    ) -> Result<ApplyOutcome> {
        let outcome = self.shared.apply_write(index, key, Some(value), seq)?;
        self.maybe_rotate();
        Ok(outcome)
    }

    /// Applies a committed `Delete` (writes a tombstone).
    pub fn apply_delete(&self, index: u64, key: Vec<u8>, seq: u64) -> Result<ApplyOutcome> {
        let outcome = self.shared.apply_write(index, key, None, seq)?;
        self.maybe_rotate();
        Ok(outcome)
    }

    /// Sequences at or below this are refused by
    /// [`apply_put`](Engine::apply_put) and [`apply_delete`](Engine::apply_delete).
    pub fn late_floor(&self) -> Option<u64> {
        self.shared.late_floor()
    }

    /// Advances the applied index over an entry that carries no data.
    pub fn note_applied(&self, index: u64) -> Result<()> {
        let _w = self.shared.write_lock.lock();
        if !self.shared.admit(index)? {
            return Ok(());
        }
        let mem = Arc::clone(&self.shared.version.load().active);
        self.shared.finish_apply(&mem, index, None);
        Ok(())
    }

    fn maybe_rotate(&self) {
        let size = self.shared.version.load().active.approx_size();
        if size >= self.shared.config.memtable_size_threshold && self.shared.rotate() {
            self.schedule(Task::Flush);
        }
    }

    /// Freezes the active memtable and flushes every memtable on the calling
    /// thread. A no-op when nothing is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure during the table write or manifest
    /// update; the memtable stays queued and is retried by the worker.
    pub fn force_flush(&self) -> Result<()> {
        let _bg = self.shared.background_lock.lock();
        self.shared.rotate();
        while self.shared.flush_oldest()? {}
        self.shared.advance_flushed_if_idle()
    }
}
