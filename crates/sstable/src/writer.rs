use anyhow::{bail, ensure, Context, Result};
use bloom::BloomFilter;
use config::BlockCompression;
use memtable::{Entry, Memtable};
use std::cmp::Ordering;
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{
    cmp_internal, encode_index, encode_meta, seal_block, BlockBuilder, BlockHandle, Footer,
    IndexEntry, KeyRange,
};

/// Knobs for building a table, normally taken from `StorageConfig`.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub block_size: usize,
    pub compression: BlockCompression,
    pub bloom_false_positive_rate: f64,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            compression: BlockCompression::Lz4,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl From<&config::StorageConfig> for TableOptions {
    fn from(cfg: &config::StorageConfig) -> Self {
        Self {
            block_size: cfg.block_size,
            compression: cfg.compression,
            bloom_false_positive_rate: cfg.bloom_false_positive_rate,
        }
    }
}

/// What a finished table contains, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub file_size: u64,
    pub entry_count: u64,
    pub max_seq: u64,
    pub range: KeyRange,
}

/// Streaming table builder.
///
/// Entries must arrive in `(key ASC, seq DESC)` order. Data goes to
/// `<path>.tmp`; [`finish`](TableBuilder::finish) fsyncs it and renames it
/// into place, so a crash mid-build leaves only a temp file that recovery
/// deletes.
pub struct TableBuilder {
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    opts: TableOptions,
    block: BlockBuilder,
    /// Last version added to `block`, becomes the block's index key.
    block_last: Option<(Vec<u8>, u64)>,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    min_key: Option<Vec<u8>>,
    max_seq: u64,
    entry_count: u64,
    scratch: Vec<u8>,
}

impl TableBuilder {
    /// `expected_entries` sizes the bloom filter; over-estimating is safe.
    pub fn create(path: &Path, expected_entries: usize, opts: TableOptions) -> Result<Self> {
        let tmp_path = path.with_extension("sst.tmp");
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            file: BufWriter::new(raw),
            offset: 0,
            opts,
            block: BlockBuilder::default(),
            block_last: None,
            index: Vec::new(),
            bloom: BloomFilter::new(expected_entries.max(1), opts.bloom_false_positive_rate),
            min_key: None,
            max_seq: 0,
            entry_count: 0,
            scratch: Vec::with_capacity(opts.block_size + 64),
        })
    }

    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        if let Some((last_key, last_seq)) = &self.block_last {
            ensure!(
                cmp_internal(last_key, *last_seq, &entry.key, entry.seq) == Ordering::Less,
                "entries out of order: ({:?}, {}) after ({:?}, {})",
                entry.key,
                entry.seq,
                last_key,
                last_seq
            );
        }

        if self.block.estimated_size() >= self.opts.block_size {
            self.flush_block()?;
        }

        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.block.add(entry)?;
        self.bloom.insert(&entry.key);
        self.max_seq = self.max_seq.max(entry.seq);
        self.entry_count += 1;
        self.block_last = Some((entry.key.clone(), entry.seq));
        Ok(())
    }

    /// Bytes written so far plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.estimated_size() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// The last user key added, if any.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.block_last.as_ref().map(|(k, _)| k.as_slice())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let raw = self.block.finish()?;
        let handle = self.write_sealed(&raw, self.opts.compression)?;
        let Some((last_key, last_seq)) = self.block_last.clone() else {
            bail!("non-empty block without a last entry");
        };
        self.index.push(IndexEntry {
            last_key,
            last_seq,
            handle,
        });
        Ok(())
    }

    fn write_sealed(&mut self, raw: &[u8], compression: BlockCompression) -> Result<BlockHandle> {
        self.scratch.clear();
        let size = seal_block(raw, compression, &mut self.scratch)?;
        let handle = BlockHandle {
            offset: self.offset,
            size,
        };
        self.file.write_all(&self.scratch)?;
        self.offset += self.scratch.len() as u64;
        Ok(handle)
    }

    /// Writes the bloom, meta and index blocks plus the footer, fsyncs, and
    /// atomically renames the table into place.
    ///
    /// # Errors
    ///
    /// Refuses to produce an empty table.
    pub fn finish(mut self) -> Result<TableInfo> {
        self.flush_block()?;
        let (Some(min_key), Some((max_key, _))) = (self.min_key.take(), self.block_last.take())
        else {
            self.abandon();
            bail!("refusing to write an empty SSTable (no entries)");
        };

        let bloom_bytes = self.bloom.to_bytes();
        let bloom = self.write_sealed(&bloom_bytes, BlockCompression::None)?;
        let range = KeyRange { min_key, max_key };
        let meta_bytes = encode_meta(&range)?;
        let meta = self.write_sealed(&meta_bytes, BlockCompression::None)?;
        let index_bytes = encode_index(&self.index)?;
        let index = self.write_sealed(&index_bytes, self.opts.compression)?;

        let footer = Footer {
            max_seq: self.max_seq,
            entry_count: self.entry_count,
            index,
            bloom,
            meta,
            compression: self.opts.compression,
        };
        let footer_bytes = footer.encode()?;
        self.file.write_all(&footer_bytes)?;
        self.offset += footer_bytes.len() as u64;

        self.file.flush()?;
        self.file
            .get_ref()
            .sync_all()
            .with_context(|| format!("fsync {}", self.tmp_path.display()))?;

        rename(&self.tmp_path, &self.path)?;
        sync_parent(&self.path);

        Ok(TableInfo {
            file_size: self.offset,
            entry_count: self.entry_count,
            max_seq: self.max_seq,
            range,
        })
    }

    /// Drops the partial output.
    pub fn abandon(&mut self) {
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

/// Fsyncs the parent directory so a rename or unlink survives a crash.
pub fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// One-shot helpers over [`TableBuilder`].
pub struct SSTableWriter {}

impl SSTableWriter {
    /// Flushes a frozen memtable to a new table at `path`.
    pub fn write_from_memtable(path: &Path, mem: &Memtable, opts: TableOptions) -> Result<TableInfo> {
        if mem.is_empty() {
            bail!("refusing to write an empty SSTable (empty memtable)");
        }
        let entries = mem.entries();
        Self::write_from_iterator(path, entries.len(), entries.into_iter().map(Ok), opts)
    }

    /// Writes every entry yielded by `iter` (already sorted) to `path`.
    pub fn write_from_iterator<I>(
        path: &Path,
        expected_count: usize,
        iter: I,
        opts: TableOptions,
    ) -> Result<TableInfo>
    where
        I: Iterator<Item = Result<Entry>>,
    {
        let mut builder = TableBuilder::create(path, expected_count, opts)?;
        for entry in iter {
            let added = entry.and_then(|e| builder.add(&e));
            if let Err(e) = added {
                builder.abandon();
                return Err(e);
            }
        }
        builder.finish()
    }
}
