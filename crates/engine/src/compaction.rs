/// Leveled compaction.
///
/// Picks a source level, merges its input tables with the overlapping
/// tables of the next level through a [`MergeIterator`], and writes
/// non-overlapping output tables to the next level, split at key boundaries
/// once `target_table_size` is reached.
///
/// ## Version retention
///
/// Pinned read snapshots divide the sequence space into stripes: stripe `i`
/// holds sequences in `(pins[i-1], pins[i]]`, the last stripe everything
/// above the newest pin. Within a stripe only the newest version of a key
/// can ever be read, so older versions in the same stripe are dropped.
///
/// A tombstone is dropped only when all of these hold:
///
/// - it falls in the oldest stripe, so no pinned read sees what it hides;
/// - no memtable and no table outside the inputs holds an older version of
///   its key;
/// - its sequence is at or below the late-write floor, so no write can
///   still land underneath it.
use anyhow::Result;
use memtable::Entry;
use sstable::{EntrySource, MergeIterator, SSTableReader, TableBuilder, TableOptions};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::manifest::{table_file_name, TableMeta};
use crate::version::{Table, Version};
use crate::{Engine, Shared};

/// What a compaction run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CompactionOutcome {
    pub(crate) inputs: usize,
    pub(crate) outputs: usize,
    pub(crate) dropped_versions: u64,
    pub(crate) trivial_move: bool,
}

/// Index of the stripe `seq` belongs to; `pins` is ascending.
fn stripe_of(pins: &[u64], seq: u64) -> usize {
    pins.partition_point(|&p| p < seq)
}

impl Shared {
    /// How far `level` is over its budget; `>= 1.0` means compaction is due.
    fn level_score(&self, v: &Version, level: usize) -> f64 {
        if level == 0 {
            v.levels[0].len() as f64 / self.config.l0_compaction_trigger as f64
        } else {
            v.level_bytes(level) as f64 / self.config.level_max_bytes(level) as f64
        }
    }

    /// The most urgent level to compact, if any. The bottom level is never
    /// a source.
    pub(crate) fn pick_level(&self, v: &Version) -> Option<usize> {
        let last = v.levels.len() - 1;
        (0..last)
            .map(|l| (l, self.level_score(v, l)))
            .filter(|(_, score)| *score >= 1.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(l, _)| l)
    }

    /// Number of levels currently over budget.
    pub(crate) fn compaction_backlog(&self, v: &Version) -> usize {
        let last = v.levels.len() - 1;
        (0..last)
            .filter(|&l| self.level_score(v, l) >= 1.0)
            .count()
    }

    /// Source tables for compacting `level`: all of L0, or one table of a
    /// deeper level chosen round-robin by key.
    fn pick_inputs(&self, v: &Version, level: usize) -> Vec<Arc<Table>> {
        if level == 0 {
            return v.levels[0].clone();
        }
        let tables = &v.levels[level];
        let pointer = self.compact_pointer.lock()[level].clone();
        tables
            .iter()
            .find(|t| pointer.is_empty() || t.reader.min_key() > pointer.as_slice())
            .or_else(|| tables.first())
            .cloned()
            .into_iter()
            .collect()
    }

    /// Runs until no level is over budget. Caller holds `background_lock`.
    pub(crate) fn compact_while_needed(&self) -> Result<()> {
        while let Some(level) = self.pick_level(&self.current()) {
            self.compact_level(level)?;
        }
        Ok(())
    }

    /// Compacts `level` into `level + 1`. Caller holds `background_lock`.
    pub(crate) fn compact_level(&self, level: usize) -> Result<CompactionOutcome> {
        let v = self.current();
        if level + 1 >= v.levels.len() {
            return Ok(CompactionOutcome::default());
        }
        let upper = self.pick_inputs(&v, level);
        if upper.is_empty() {
            return Ok(CompactionOutcome::default());
        }

        let min = upper
            .iter()
            .map(|t| t.reader.min_key())
            .min()
            .unwrap_or_default()
            .to_vec();
        let max = upper
            .iter()
            .map(|t| t.reader.max_key())
            .max()
            .unwrap_or_default()
            .to_vec();
        let lower = v.overlapping(level + 1, &min, &max);
        self.compact_pointer.lock()[level] = max.clone();

        if level > 0 && lower.is_empty() {
            return self.trivial_move(&upper[0], level + 1);
        }

        // newest first: L0 is already newest first, then the older level
        let inputs: Vec<Arc<Table>> = upper.iter().chain(lower.iter()).cloned().collect();
        let lo = inputs.iter().map(|t| t.reader.min_key()).min().unwrap_or_default();
        let hi = inputs.iter().map(|t| t.reader.max_key()).max().unwrap_or_default();
        let bottom = (level + 2..v.levels.len()).all(|l| v.overlapping(l, lo, hi).is_empty());
        let pins = self
            .snapshots
            .begin_compaction(self.last_sequence.load(Ordering::Acquire));
        let purge = TombstonePurge {
            version: &v,
            inputs: inputs.iter().map(|t| t.id()).collect(),
            floor: self.late_floor(),
        };

        let (outputs, dropped) = match self.merge_into(&inputs, level + 1, &purge, &pins) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(level, error = %format!("{:#}", e), "compaction failed");
                return Err(e);
            }
        };

        let input_names: Vec<String> = inputs.iter().map(|t| table_file_name(t.id())).collect();
        {
            let mut manifest = self.manifest.lock();
            let mut next = manifest.clone();
            next.remove_files(&input_names);
            for t in &outputs {
                next.add(TableMeta {
                    file_name: table_file_name(t.id()),
                    level: level + 1,
                    min_key: t.reader.min_key().to_vec(),
                    max_key: t.reader.max_key().to_vec(),
                });
            }
            next.next_file_id = self.next_file_id.load(Ordering::SeqCst);
            if let Err(e) = next.save() {
                for t in &outputs {
                    t.mark_obsolete();
                }
                return Err(e);
            }
            *manifest = next;
        }

        let input_ids: Vec<u64> = inputs.iter().map(|t| t.id()).collect();
        let published = outputs.clone();
        self.publish(|v| {
            v.remove_tables(&input_ids);
            for t in published {
                v.insert_table(t);
            }
        });
        for t in &inputs {
            t.mark_obsolete();
            self.block_cache.evict_table(t.id());
            self.bloom_cache.evict_table(t.id());
        }
        self.compactions.fetch_add(1, Ordering::Relaxed);

        let outcome = CompactionOutcome {
            inputs: inputs.len(),
            outputs: outputs.len(),
            dropped_versions: dropped,
            trivial_move: false,
        };
        tracing::info!(
            level,
            inputs = outcome.inputs,
            outputs = outcome.outputs,
            dropped = outcome.dropped_versions,
            bottom,
            "compaction finished"
        );
        Ok(outcome)
    }

    /// Reassigns a table to `level` without rewriting it.
    fn trivial_move(&self, table: &Arc<Table>, level: usize) -> Result<CompactionOutcome> {
        let name = table_file_name(table.id());
        {
            let mut manifest = self.manifest.lock();
            let mut next = manifest.clone();
            next.remove_files(std::slice::from_ref(&name));
            next.add(TableMeta {
                file_name: name,
                level,
                min_key: table.reader.min_key().to_vec(),
                max_key: table.reader.max_key().to_vec(),
            });
            next.save()?;
            *manifest = next;
        }
        let moved = Arc::new(table.moved(level));
        let id = table.id();
        self.publish(|v| {
            v.remove_tables(&[id]);
            v.insert_table(moved);
        });
        tracing::debug!(table = id, level, "moved table down");
        Ok(CompactionOutcome {
            inputs: 1,
            outputs: 1,
            dropped_versions: 0,
            trivial_move: true,
        })
    }

    /// Merges `inputs` into fresh tables at `level`. Returns the opened
    /// outputs and how many versions were discarded.
    fn merge_into(
        &self,
        inputs: &[Arc<Table>],
        level: usize,
        purge: &TombstonePurge<'_>,
        pins: &[u64],
    ) -> Result<(Vec<Arc<Table>>, u64)> {
        let sources: Vec<EntrySource> = inputs
            .iter()
            .map(|t| Box::new(t.reader.iter(None)) as EntrySource)
            .collect();
        let expected: usize = inputs.iter().map(|t| t.reader.len() as usize).sum();
        let mut merge = MergeIterator::new(sources)?;
        let mut out = OutputSet::new(self, level, expected);

        let mut prev: Option<(Vec<u8>, usize)> = None;
        let mut dropped = 0u64;
        let result: Result<()> = (|| {
            while let Some(entry) = merge.next_entry()? {
                let stripe = stripe_of(pins, entry.seq);
                let same_key = prev.as_ref().is_some_and(|(k, _)| *k == entry.key);
                if same_key && prev.as_ref().is_some_and(|(_, s)| *s == stripe) {
                    dropped += 1;
                    continue;
                }
                prev = Some((entry.key.clone(), stripe));
                if entry.is_tombstone() && stripe == 0 && purge.allows(self, &entry)? {
                    dropped += 1;
                    continue;
                }
                out.add(&entry, same_key)?;
            }
            Ok(())
        })();

        match result.and_then(|()| out.finish()) {
            Ok(tables) => Ok((tables, dropped)),
            Err(e) => Err(e),
        }
    }
}

/// Decides whether a tombstone in the oldest stripe can leave the merge.
struct TombstonePurge<'a> {
    version: &'a Version,
    inputs: Vec<u64>,
    floor: Option<u64>,
}

impl TombstonePurge<'_> {
    fn allows(&self, shared: &Shared, tombstone: &Entry) -> Result<bool> {
        match self.floor {
            Some(floor) if tombstone.seq <= floor => {}
            _ => return Ok(false),
        }
        let Some(below) = tombstone.seq.checked_sub(1) else {
            return Ok(true);
        };
        let key = tombstone.key.as_slice();
        let v = self.version;
        for mem in std::iter::once(&v.active).chain(v.immutables.iter()) {
            if mem.get(key, below).is_some() {
                return Ok(false);
            }
        }
        for table in v.tables() {
            if self.inputs.contains(&table.id()) {
                continue;
            }
            if shared.table_lookup(table, key, below, &None)?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Output tables of one compaction, cut at key boundaries.
pub(crate) struct OutputSet<'a> {
    shared: &'a Shared,
    level: usize,
    expected: usize,
    current: Option<(u64, TableBuilder)>,
    done: Vec<Arc<Table>>,
}

impl<'a> OutputSet<'a> {
    pub(crate) fn new(shared: &'a Shared, level: usize, expected: usize) -> Self {
        Self {
            shared,
            level,
            expected,
            current: None,
            done: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, entry: &Entry, same_key_as_prev: bool) -> Result<()> {
        let full = self.current.as_ref().is_some_and(|(_, b)| {
            b.estimated_size() >= self.shared.config.target_table_size
        });
        // versions of one key never straddle two tables of a level
        if full && !same_key_as_prev {
            self.seal()?;
        }
        if self.current.is_none() {
            let id = self.shared.allocate_file_id();
            let path = self.shared.sst_dir.join(table_file_name(id));
            let builder =
                TableBuilder::create(&path, self.expected, TableOptions::from(&self.shared.config))?;
            self.current = Some((id, builder));
        }
        if let Some((_, builder)) = self.current.as_mut() {
            builder.add(entry)?;
        }
        Ok(())
    }

    fn seal(&mut self) -> Result<()> {
        if let Some((id, builder)) = self.current.take() {
            let path = self.shared.sst_dir.join(table_file_name(id));
            builder.finish()?;
            let reader = SSTableReader::open(&path, id)?;
            self.done.push(Arc::new(Table::new(reader, self.level)));
        }
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<Vec<Arc<Table>>> {
        self.seal()?;
        Ok(std::mem::take(&mut self.done))
    }
}

impl Drop for OutputSet<'_> {
    /// On failure, drop whatever was written.
    fn drop(&mut self) {
        if let Some((_, mut builder)) = self.current.take() {
            builder.abandon();
        }
        for t in self.done.drain(..) {
            t.mark_obsolete();
        }
    }
}

impl Engine {
    /// Runs compactions on the calling thread until no level is over
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure during merge, write, or manifest
    /// update. The published table set is left untouched in that case.
    pub fn compact(&self) -> Result<()> {
        let _bg = self.shared.background_lock.lock();
        self.shared.compact_while_needed()
    }

    /// Compacts `level` into `level + 1` regardless of its score. A no-op
    /// for an empty level or the bottom level.
    pub fn compact_level(&self, level: usize) -> Result<()> {
        let _bg = self.shared.background_lock.lock();
        self.shared.compact_level(level).map(|_| ())
    }

    /// Number of levels over budget.
    pub fn compaction_backlog(&self) -> usize {
        self.shared.compaction_backlog(&self.shared.current())
    }
}
