//! State images: the payload of a consensus snapshot.
//!
//! An image is the newest version of every key at one applied index,
//! streamed in key order, so installing it can feed the entries straight
//! into bottom-level tables without sorting. Tombstones above the
//! late-write floor travel with it: a write that may still arrive below
//! them must stay hidden on the receiving node too.
//!
//! ```text
//! [magic: u32 "RKIM"][version: u32][applied_index: u64][last_sequence: u64]
//! repeated: [1u8][key_len: u32][key][seq: u64][val_len: u32][value]
//!       or: [2u8][key_len: u32][key][seq: u64]
//! [0u8][entry_count: u64][crc32 of everything before: u32]
//! ```
//!
//! All integers are little-endian.

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memtable::{Entry, Memtable};
use sstable::{CorruptionError, EntrySource, MergeIterator};
use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::compaction::OutputSet;
use crate::manifest::{table_file_name, TableMeta};
use crate::version::Version;
use crate::Engine;

pub const IMAGE_MAGIC: u32 = 0x524B_494D;
const IMAGE_VERSION: u32 = 1;

const ENTRY_END: u8 = 0;
const ENTRY_PUT: u8 = 1;
const ENTRY_TOMBSTONE: u8 = 2;

/// What an image describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub applied_index: u64,
    pub last_sequence: u64,
    pub entry_count: u64,
}

struct CrcWriter<W> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct CrcReader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn write_key<W: Write>(w: &mut W, e: &Entry) -> io::Result<()> {
    w.write_u32::<LittleEndian>(e.key.len() as u32)?;
    w.write_all(&e.key)?;
    w.write_u64::<LittleEndian>(e.seq)
}

fn read_bytes<R: Read>(r: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

impl Engine {
    /// Streams the state at the current applied index into `out`.
    ///
    /// Must be called from the apply actor so that no entry is applied while
    /// the applied index and the table set are captured.
    pub fn export_image<W: Write>(&self, out: W) -> Result<ImageHeader> {
        let applied_index = self.applied_index();
        let last_sequence = self.last_sequence();
        let v = self.shared.current();
        let visible = self.visible_entries(&v, last_sequence)?;

        let mut w = CrcWriter {
            inner: out,
            hasher: crc32fast::Hasher::new(),
        };
        w.write_u32::<LittleEndian>(IMAGE_MAGIC)?;
        w.write_u32::<LittleEndian>(IMAGE_VERSION)?;
        w.write_u64::<LittleEndian>(applied_index)?;
        w.write_u64::<LittleEndian>(last_sequence)?;

        let floor = self.shared.late_floor();
        let mut count = 0u64;
        for item in visible {
            let e = item?;
            match &e.value {
                Some(value) => {
                    w.write_u8(ENTRY_PUT)?;
                    write_key(&mut w, &e)?;
                    w.write_u32::<LittleEndian>(value.len() as u32)?;
                    w.write_all(value)?;
                }
                None if floor.is_some_and(|f| e.seq <= f) => continue,
                None => {
                    w.write_u8(ENTRY_TOMBSTONE)?;
                    write_key(&mut w, &e)?;
                }
            }
            count += 1;
        }
        w.write_u8(ENTRY_END)?;
        w.write_u64::<LittleEndian>(count)?;
        let crc = w.hasher.clone().finalize();
        let mut out = w.inner;
        out.write_u32::<LittleEndian>(crc)?;
        out.flush()?;

        tracing::info!(applied_index, last_sequence, entries = count, "exported state image");
        Ok(ImageHeader {
            applied_index,
            last_sequence,
            entry_count: count,
        })
    }

    /// Newest visible version per key at `seq`, with its sequence number.
    fn visible_entries(
        &self,
        v: &Version,
        seq: u64,
    ) -> Result<impl Iterator<Item = Result<Entry>>> {
        let mut sources: Vec<EntrySource> = Vec::new();
        for mem in std::iter::once(&v.active).chain(v.immutables.iter()) {
            sources.push(Box::new(mem.scan(&[], None, seq).into_iter().map(Ok)));
        }
        for t in v.tables() {
            sources.push(Box::new(t.reader.iter(None)));
        }
        let merge = MergeIterator::new(sources)?;
        Ok(NewestPerKey {
            inner: merge,
            seq,
            last_key: None,
        })
    }

    /// Replaces the whole state with the image read from `input`.
    ///
    /// Entries go to bottom-level tables; once the image's checksum has been
    /// verified the new table set is committed to the manifest and
    /// published, memtables are discarded and every pinned read snapshot is
    /// invalidated.
    ///
    /// # Errors
    ///
    /// A bad magic, checksum or ordering is a `CorruptionError`; nothing is
    /// changed in that case.
    pub fn install_image<R: Read>(&self, input: R) -> Result<ImageHeader> {
        self.install(input, None)
    }

    /// Like [`install_image`](Engine::install_image), but the image must
    /// hold the state through log `index`. Any other applied index is a
    /// `CorruptionError` and nothing is changed.
    pub fn install_image_at<R: Read>(&self, input: R, index: u64) -> Result<ImageHeader> {
        self.install(input, Some(index))
    }

    fn install<R: Read>(&self, input: R, expected_index: Option<u64>) -> Result<ImageHeader> {
        let shared = &self.shared;
        let _bg = shared.background_lock.lock();
        let bottom = shared.config.max_levels - 1;
        let corrupt = |detail: String| -> anyhow::Error {
            CorruptionError::new(&shared.sst_dir, format!("state image: {}", detail)).into()
        };

        let mut r = CrcReader {
            inner: input,
            hasher: crc32fast::Hasher::new(),
        };
        let mut out = OutputSet::new(shared, bottom, 1024);
        let header = match read_image(&mut r, &mut out, expected_index) {
            Ok(Ok(header)) => header,
            Ok(Err(detail)) => return Err(corrupt(detail)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(corrupt("truncated".into()))
            }
            Err(e) => return Err(e.into()),
        };
        let ImageHeader {
            applied_index,
            last_sequence,
            entry_count: count,
        } = header;
        let tables = out.finish()?;

        {
            let mut manifest = shared.manifest.lock();
            let mut next = manifest.clone();
            next.replace_all(
                tables
                    .iter()
                    .map(|t| TableMeta {
                        file_name: table_file_name(t.id()),
                        level: bottom,
                        min_key: t.reader.min_key().to_vec(),
                        max_key: t.reader.max_key().to_vec(),
                    })
                    .collect(),
            );
            next.flushed_index = applied_index;
            next.last_sequence = last_sequence;
            next.next_file_id = shared.next_file_id.load(Ordering::SeqCst);
            if let Err(e) = next.save() {
                for t in &tables {
                    t.mark_obsolete();
                }
                return Err(e);
            }
            *manifest = next;
        }

        let _w = shared.write_lock.lock();
        let old = shared.current();
        let fresh = Arc::new(Memtable::new(
            shared.next_memtable_id.fetch_add(1, Ordering::SeqCst),
        ));
        let mut next = Version::empty(fresh, shared.config.max_levels);
        for t in tables {
            next.insert_table(t);
        }
        {
            let _g = shared.install_lock.lock();
            shared.version.store(Arc::new(next));
        }
        for t in old.tables() {
            t.mark_obsolete();
            shared.block_cache.evict_table(t.id());
            shared.bloom_cache.evict_table(t.id());
        }
        shared.applied_index.store(applied_index, Ordering::Release);
        shared.flushed_index.store(applied_index, Ordering::Release);
        shared.last_sequence.store(last_sequence, Ordering::Release);
        shared.snapshots.reset(last_sequence);

        tracing::info!(applied_index, last_sequence, entries = count, "installed state image");
        Ok(ImageHeader {
            applied_index,
            last_sequence,
            entry_count: count,
        })
    }
}

/// Parses an image into `out`. The outer error is I/O; the inner one
/// describes a malformed image.
fn read_image<R: Read>(
    r: &mut CrcReader<R>,
    out: &mut OutputSet<'_>,
    expected_index: Option<u64>,
) -> io::Result<std::result::Result<ImageHeader, String>> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != IMAGE_MAGIC {
        return Ok(Err(format!("bad magic {:#x}", magic)));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != IMAGE_VERSION {
        return Ok(Err(format!("unsupported version {}", version)));
    }
    let applied_index = r.read_u64::<LittleEndian>()?;
    if let Some(expected) = expected_index.filter(|&i| i != applied_index) {
        return Ok(Err(format!(
            "holds state through index {} but belongs at index {}",
            applied_index, expected
        )));
    }
    let last_sequence = r.read_u64::<LittleEndian>()?;

    let mut count = 0u64;
    let mut prev_key: Option<Vec<u8>> = None;
    loop {
        let marker = r.read_u8()?;
        match marker {
            ENTRY_END => break,
            ENTRY_PUT | ENTRY_TOMBSTONE => {}
            other => return Ok(Err(format!("bad entry marker {}", other))),
        }
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        if key_len > crate::MAX_KEY_SIZE {
            return Ok(Err(format!("key of {} bytes", key_len)));
        }
        let key = read_bytes(r, key_len)?;
        let seq = r.read_u64::<LittleEndian>()?;
        let entry = if marker == ENTRY_PUT {
            let val_len = r.read_u32::<LittleEndian>()? as usize;
            if val_len > crate::MAX_VALUE_SIZE {
                return Ok(Err(format!("value of {} bytes", val_len)));
            }
            Entry::put(key.clone(), seq, read_bytes(r, val_len)?)
        } else {
            Entry::tombstone(key.clone(), seq)
        };
        if prev_key.as_ref().is_some_and(|p| *p >= key) {
            return Ok(Err("keys out of order".into()));
        }
        out.add(&entry, false)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:#}", e)))?;
        prev_key = Some(key);
        count += 1;
    }

    let stored_count = r.read_u64::<LittleEndian>()?;
    let computed = r.hasher.clone().finalize();
    let stored_crc = r.inner.read_u32::<LittleEndian>()?;
    if stored_count != count {
        return Ok(Err(format!("count {} but {} entries", stored_count, count)));
    }
    if stored_crc != computed {
        return Ok(Err(format!(
            "checksum mismatch: stored {:#x}, computed {:#x}",
            stored_crc, computed
        )));
    }
    Ok(Ok(ImageHeader {
        applied_index,
        last_sequence,
        entry_count: count,
    }))
}

/// Keeps the newest version with `seq <= snapshot` of each key, tombstones
/// included (the caller skips them).
struct NewestPerKey {
    inner: MergeIterator,
    seq: u64,
    last_key: Option<Vec<u8>>,
}

impl Iterator for NewestPerKey {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let e = match self.inner.next()? {
                Ok(e) => e,
                Err(e) => return Some(Err(e)),
            };
            if e.seq > self.seq || self.last_key.as_deref() == Some(e.key.as_slice()) {
                continue;
            }
            self.last_key = Some(e.key.clone());
            return Some(Ok(e));
        }
    }
}
