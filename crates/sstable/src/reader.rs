use anyhow::{Context, Result};
use bloom::BloomFilter;
use memtable::{Entry, ValueEntry};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::format::{
    cmp_internal, decode_index, decode_meta, open_block, Block, BlockHandle, CorruptionError,
    Footer, IndexEntry, KeyRange, BLOCK_TRAILER_BYTES, FOOTER_BYTES,
};

/// An open, immutable table.
///
/// On [`open`](SSTableReader::open) the footer, key range and block index are
/// loaded and checksum-verified. Data blocks are read on demand, through the
/// shared [`BlockCache`] when one is supplied. The bloom filter is not kept
/// here; it lives in the `BloomFilterCache` and is loaded with
/// [`load_bloom`](SSTableReader::load_bloom).
///
/// The file handle is kept open for the lifetime of the reader behind a
/// mutex, so lookups work through `&self`.
pub struct SSTableReader {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    file_size: u64,
    footer: Footer,
    index: Vec<IndexEntry>,
    range: KeyRange,
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("blocks", &self.index.len())
            .field("entries", &self.footer.entry_count)
            .finish()
    }
}

impl SSTableReader {
    /// Opens table `id` at `path`.
    ///
    /// # Errors
    ///
    /// A bad magic, footer checksum, index checksum or key range is returned
    /// as a [`CorruptionError`]; I/O failures as plain errors.
    pub fn open<P: AsRef<Path>>(path: P, id: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let file_size = f.metadata()?.len();
        if file_size < FOOTER_BYTES {
            return Err(CorruptionError::new(&path, "file too small for footer").into());
        }

        let mut footer_buf = vec![0u8; FOOTER_BYTES as usize];
        f.seek(SeekFrom::Start(file_size - FOOTER_BYTES))?;
        f.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)
            .map_err(|e| CorruptionError::new(&path, format!("footer: {:#}", e)))?;

        let index_raw = read_stored(&mut f, &path, file_size, footer.index)?;
        let index = decode_index(&index_raw)
            .map_err(|e| CorruptionError::new(&path, format!("index: {:#}", e)))?;
        for e in &index {
            check_handle(&path, file_size, e.handle)?;
        }

        let meta_raw = read_stored(&mut f, &path, file_size, footer.meta)?;
        let range = decode_meta(&meta_raw)
            .map_err(|e| CorruptionError::new(&path, format!("meta: {:#}", e)))?;

        Ok(Self {
            id,
            path,
            file: Mutex::new(f),
            file_size,
            footer,
            index,
            range,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn max_seq(&self) -> u64 {
        self.footer.max_seq
    }

    /// Number of versions stored, tombstones included.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.footer.entry_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.footer.entry_count == 0
    }

    pub fn min_key(&self) -> &[u8] {
        &self.range.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.range.max_key
    }

    pub fn key_range(&self) -> &KeyRange {
        &self.range
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// `true` if `[start, end)` may intersect this table's keys.
    pub fn overlaps(&self, start: &[u8], end: Option<&[u8]>) -> bool {
        if self.range.max_key.as_slice() < start {
            return false;
        }
        match end {
            Some(end) => self.range.min_key.as_slice() < end,
            None => true,
        }
    }

    /// Reads and verifies the embedded bloom filter.
    pub fn load_bloom(&self) -> Result<BloomFilter> {
        let raw = {
            let mut f = self.file.lock();
            read_stored(&mut f, &self.path, self.file_size, self.footer.bloom)?
        };
        BloomFilter::read_from(&mut raw.as_slice())
            .map_err(|e| CorruptionError::new(&self.path, format!("bloom: {}", e)).into())
    }

    /// Reads, verifies and decodes data block `i`, bypassing any cache.
    pub fn read_block(&self, i: usize) -> Result<Block> {
        let handle = self.index[i].handle;
        let raw = {
            let mut f = self.file.lock();
            read_stored(&mut f, &self.path, self.file_size, handle)?
        };
        Block::decode(raw).map_err(|e| {
            CorruptionError::new(&self.path, format!("block at {}: {:#}", handle.offset, e)).into()
        })
    }

    fn block(&self, i: usize, cache: Option<&BlockCache>) -> Result<Arc<Block>> {
        match cache {
            Some(cache) => cache.get_block(self.id, self.index[i].handle.offset, || {
                self.read_block(i)
            }),
            None => Ok(Arc::new(self.read_block(i)?)),
        }
    }

    /// First block whose last version is ordered at or after `(key, seq)`.
    fn find_block(&self, key: &[u8], seq: u64) -> usize {
        self.index.partition_point(|e| {
            cmp_internal(&e.last_key, e.last_seq, key, seq) == Ordering::Less
        })
    }

    /// Point lookup: the newest version of `key` with `seq <= snapshot_seq`,
    /// tombstones included. Callers consult the bloom filter first.
    pub fn get(
        &self,
        key: &[u8],
        snapshot_seq: u64,
        cache: Option<&BlockCache>,
    ) -> Result<Option<ValueEntry>> {
        if key < self.range.min_key.as_slice() || key > self.range.max_key.as_slice() {
            return Ok(None);
        }
        let bi = self.find_block(key, snapshot_seq);
        if bi >= self.index.len() {
            return Ok(None);
        }
        let block = self.block(bi, cache)?;
        let pos = block
            .seek(key, snapshot_seq)
            .map_err(|e| CorruptionError::new(&self.path, format!("{:#}", e)))?;
        if pos >= block.len() {
            return Ok(None);
        }
        let entry = block
            .entry_at(pos)
            .map_err(|e| CorruptionError::new(&self.path, format!("{:#}", e)))?;
        if entry.key != key {
            return Ok(None);
        }
        Ok(Some(ValueEntry {
            seq: entry.seq,
            value: entry.value,
        }))
    }

    /// Iterates every version in stored order.
    pub fn iter(self: &Arc<Self>, cache: Option<Arc<BlockCache>>) -> TableIterator {
        TableIterator {
            reader: Arc::clone(self),
            cache,
            block_idx: 0,
            block: None,
            pos: 0,
            seek_key: None,
        }
    }

    /// Iterates every version with `key >= start`.
    pub fn iter_from(self: &Arc<Self>, start: &[u8], cache: Option<Arc<BlockCache>>) -> TableIterator {
        let mut it = self.iter(cache);
        it.block_idx = self.find_block(start, u64::MAX);
        it.seek_key = Some(start.to_vec());
        it
    }

    /// Reads every block and the bloom filter, verifying all checksums.
    pub fn verify(&self) -> Result<()> {
        let mut count = 0u64;
        for i in 0..self.index.len() {
            count += self.read_block(i)?.len() as u64;
        }
        if count != self.footer.entry_count {
            return Err(CorruptionError::new(
                &self.path,
                format!(
                    "footer counts {} entries, blocks hold {}",
                    self.footer.entry_count, count
                ),
            )
            .into());
        }
        self.load_bloom()?;
        Ok(())
    }
}

fn check_handle(path: &Path, file_size: u64, handle: BlockHandle) -> Result<()> {
    let end = handle
        .offset
        .checked_add(handle.size)
        .and_then(|e| e.checked_add(BLOCK_TRAILER_BYTES));
    match end {
        Some(end) if end <= file_size - FOOTER_BYTES => Ok(()),
        _ => Err(CorruptionError::new(
            path,
            format!("block handle {:?} outside file of {} bytes", handle, file_size),
        )
        .into()),
    }
}

/// Reads the stored block at `handle` and returns its verified, decompressed
/// payload.
fn read_stored(f: &mut File, path: &Path, file_size: u64, handle: BlockHandle) -> Result<Vec<u8>> {
    check_handle(path, file_size, handle)?;
    let mut stored = vec![0u8; (handle.size + BLOCK_TRAILER_BYTES) as usize];
    f.seek(SeekFrom::Start(handle.offset))?;
    f.read_exact(&mut stored)?;
    open_block(&stored).map_err(|e| {
        CorruptionError::new(path, format!("block at {}: {:#}", handle.offset, e)).into()
    })
}

/// Streams a table's versions in `(key ASC, seq DESC)` order.
pub struct TableIterator {
    reader: Arc<SSTableReader>,
    cache: Option<Arc<BlockCache>>,
    block_idx: usize,
    block: Option<Arc<Block>>,
    pos: usize,
    seek_key: Option<Vec<u8>>,
}

impl TableIterator {
    fn load_next_block(&mut self) -> Result<bool> {
        if self.block_idx >= self.reader.index.len() {
            return Ok(false);
        }
        let block = self.reader.block(self.block_idx, self.cache.as_deref())?;
        self.pos = match self.seek_key.take() {
            Some(key) => block
                .seek(&key, u64::MAX)
                .map_err(|e| CorruptionError::new(&self.reader.path, format!("{:#}", e)))?,
            None => 0,
        };
        self.block = Some(block);
        self.block_idx += 1;
        Ok(true)
    }
}

impl Iterator for TableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(block) = &self.block {
                if self.pos < block.len() {
                    let entry = block.entry_at(self.pos).map_err(|e| {
                        CorruptionError::new(&self.reader.path, format!("{:#}", e)).into()
                    });
                    self.pos += 1;
                    return Some(entry);
                }
                self.block = None;
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    // stop after reporting the failure
                    self.block_idx = usize::MAX;
                    return Some(Err(e));
                }
            }
        }
    }
}
