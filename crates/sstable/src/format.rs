//! SSTable binary format: blocks, block handles, the index, the footer, and
//! the checksummed block trailer.
//!
//! ## Block (uncompressed)
//!
//! ```text
//! [entry]* [offset: u32 LE]* [num_entries: u32 LE]
//! entry = key_len(u32) | key | seq(u64) | kind(u8: 0 = tombstone, 1 = value) | [val_len(u32) | val]
//! ```
//!
//! ## Stored block
//!
//! ```text
//! [payload (possibly compressed)][compression: u8][crc32: u32 LE]
//! ```
//!
//! The CRC covers the payload and the compression byte. A [`BlockHandle`]
//! records the payload's offset and length (trailer excluded).
//!
//! ## Footer (73 bytes, last in file)
//!
//! ```text
//! [max_seq: u64][entry_count: u64]
//! [index: offset u64, size u64][bloom: offset u64, size u64][meta: offset u64, size u64]
//! [compression: u8][crc32 of the preceding 57 bytes: u32][magic: u32 = "SSTB"]
//! ```

use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use config::BlockCompression;
use crc32fast::Hasher as Crc32;
use memtable::Entry;
use std::cmp::{Ordering, Reverse};
use std::path::{Path, PathBuf};

/// Magic number identifying block-based tables (ASCII "SSTB").
pub const SSTABLE_MAGIC: u32 = 0x5353_5442;

pub const FOOTER_BYTES: u64 = 8 + 8 + 16 * 3 + 1 + 4 + 4;

/// `[compression: u8][crc32: u32]` after every stored block.
pub const BLOCK_TRAILER_BYTES: u64 = 1 + 4;

/// Maximum key size accepted while decoding (64 KiB).
pub const MAX_KEY_BYTES: usize = 64 * 1024;
/// Maximum value size accepted while decoding (10 MiB).
pub const MAX_VALUE_BYTES: usize = 10 * 1024 * 1024;
/// Maximum decoded block size; anything larger is treated as corruption.
const MAX_BLOCK_BYTES: usize = 64 * 1024 * 1024;

/// A checksum or structural failure in a committed table. Raised inside
/// `anyhow::Error` so callers can `downcast_ref::<CorruptionError>()`.
#[derive(Debug, thiserror::Error)]
#[error("sstable corruption in {}: {detail}", path.display())]
pub struct CorruptionError {
    pub path: PathBuf,
    pub detail: String,
}

impl CorruptionError {
    pub fn new(path: &Path, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }
}

/// Returns `true` if `err` (or anything in its chain) is a [`CorruptionError`].
pub fn is_corruption(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<CorruptionError>().is_some())
}

/// Orders versions as stored: key ascending, then seq descending.
pub fn cmp_internal(a_key: &[u8], a_seq: u64, b_key: &[u8], b_seq: u64) -> Ordering {
    a_key
        .cmp(b_key)
        .then_with(|| Reverse(a_seq).cmp(&Reverse(b_seq)))
}

/// Location of a stored block within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u64::<LittleEndian>(self.offset)?;
        buf.write_u64::<LittleEndian>(self.size)
    }

    fn read_from(r: &mut &[u8]) -> std::io::Result<Self> {
        Ok(Self {
            offset: r.read_u64::<LittleEndian>()?,
            size: r.read_u64::<LittleEndian>()?,
        })
    }
}

/// One index record per data block: the block's last version and its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub last_key: Vec<u8>,
    pub last_seq: u64,
    pub handle: BlockHandle,
}

pub fn encode_index(entries: &[IndexEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(entries.len() as u32)?;
    for e in entries {
        buf.write_u32::<LittleEndian>(e.last_key.len() as u32)?;
        buf.extend_from_slice(&e.last_key);
        buf.write_u64::<LittleEndian>(e.last_seq)?;
        e.handle.write_to(&mut buf)?;
    }
    Ok(buf)
}

pub fn decode_index(mut r: &[u8]) -> Result<Vec<IndexEntry>> {
    let count = r.read_u32::<LittleEndian>()? as usize;
    // each entry is at least 4 + 8 + 16 bytes
    if count > r.len() / 28 + 1 {
        bail!("index claims {} entries in {} bytes", count, r.len());
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_KEY_BYTES || key_len > r.len() {
            bail!("index key_len {} out of range", key_len);
        }
        let last_key = r[..key_len].to_vec();
        r = &r[key_len..];
        let last_seq = r.read_u64::<LittleEndian>()?;
        let handle = BlockHandle::read_from(&mut r)?;
        entries.push(IndexEntry {
            last_key,
            last_seq,
            handle,
        });
    }
    Ok(entries)
}

/// Smallest and largest user key of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

pub fn encode_meta(range: &KeyRange) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + range.min_key.len() + range.max_key.len());
    buf.write_u32::<LittleEndian>(range.min_key.len() as u32)?;
    buf.extend_from_slice(&range.min_key);
    buf.write_u32::<LittleEndian>(range.max_key.len() as u32)?;
    buf.extend_from_slice(&range.max_key);
    Ok(buf)
}

pub fn decode_meta(mut r: &[u8]) -> Result<KeyRange> {
    fn read_key(r: &mut &[u8]) -> Result<Vec<u8>> {
        let len = r.read_u32::<LittleEndian>()? as usize;
        if len > MAX_KEY_BYTES || len > r.len() {
            bail!("meta key_len {} out of range", len);
        }
        let key = r[..len].to_vec();
        *r = &r[len..];
        Ok(key)
    }
    let min_key = read_key(&mut r)?;
    let max_key = read_key(&mut r)?;
    Ok(KeyRange { min_key, max_key })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub max_seq: u64,
    pub entry_count: u64,
    pub index: BlockHandle,
    pub bloom: BlockHandle,
    pub meta: BlockHandle,
    pub compression: BlockCompression,
}

impl Footer {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FOOTER_BYTES as usize);
        buf.write_u64::<LittleEndian>(self.max_seq)?;
        buf.write_u64::<LittleEndian>(self.entry_count)?;
        self.index.write_to(&mut buf)?;
        self.bloom.write_to(&mut buf)?;
        self.meta.write_to(&mut buf)?;
        buf.write_u8(self.compression.tag())?;
        let crc = crc32(&[&buf]);
        buf.write_u32::<LittleEndian>(crc)?;
        buf.write_u32::<LittleEndian>(SSTABLE_MAGIC)?;
        Ok(buf)
    }

    /// Decodes the last [`FOOTER_BYTES`] of a table. Any mismatch is reported
    /// as a plain error; the reader wraps it into a [`CorruptionError`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_BYTES as usize {
            bail!("footer has {} bytes, expected {}", buf.len(), FOOTER_BYTES);
        }
        let body_len = buf.len() - 8;
        let mut tail = &buf[body_len..];
        let stored_crc = tail.read_u32::<LittleEndian>()?;
        let magic = tail.read_u32::<LittleEndian>()?;
        if magic != SSTABLE_MAGIC {
            bail!("unknown SSTable magic: {:#x}", magic);
        }
        if crc32(&[&buf[..body_len]]) != stored_crc {
            bail!("footer checksum mismatch");
        }

        let mut r = &buf[..body_len];
        let max_seq = r.read_u64::<LittleEndian>()?;
        let entry_count = r.read_u64::<LittleEndian>()?;
        let index = BlockHandle::read_from(&mut r)?;
        let bloom = BlockHandle::read_from(&mut r)?;
        let meta = BlockHandle::read_from(&mut r)?;
        let tag = r.read_u8()?;
        let Some(compression) = BlockCompression::from_tag(tag) else {
            bail!("unknown compression tag {}", tag);
        };
        Ok(Self {
            max_seq,
            entry_count,
            index,
            bloom,
            meta,
            compression,
        })
    }
}

pub fn crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize()
}

/// Compresses `raw` and appends `[payload][tag][crc]` to `out`. Returns the
/// payload length (the handle size).
pub fn seal_block(raw: &[u8], compression: BlockCompression, out: &mut Vec<u8>) -> Result<u64> {
    let start = out.len();
    match compression {
        BlockCompression::None => out.extend_from_slice(raw),
        BlockCompression::Lz4 => out.extend_from_slice(&lz4_flex::compress_prepend_size(raw)),
    }
    let payload_len = (out.len() - start) as u64;
    let tag = compression.tag();
    let crc = crc32(&[&out[start..], &[tag]]);
    out.write_u8(tag)?;
    out.write_u32::<LittleEndian>(crc)?;
    Ok(payload_len)
}

/// Verifies and decompresses a stored block (payload + trailer).
pub fn open_block(stored: &[u8]) -> Result<Vec<u8>> {
    if stored.len() < BLOCK_TRAILER_BYTES as usize {
        bail!("stored block shorter than its trailer");
    }
    let payload_len = stored.len() - BLOCK_TRAILER_BYTES as usize;
    let payload = &stored[..payload_len];
    let tag = stored[payload_len];
    let mut crc_bytes = &stored[payload_len + 1..];
    let stored_crc = crc_bytes.read_u32::<LittleEndian>()?;
    if crc32(&[payload, &[tag]]) != stored_crc {
        bail!("block checksum mismatch");
    }
    match BlockCompression::from_tag(tag) {
        Some(BlockCompression::None) => Ok(payload.to_vec()),
        Some(BlockCompression::Lz4) => {
            if payload.len() >= 4 {
                let claimed = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if claimed as usize > MAX_BLOCK_BYTES {
                    bail!("block claims {} decompressed bytes", claimed);
                }
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| anyhow::anyhow!("lz4 decompression failed: {}", e))
        }
        None => bail!("unknown compression tag {}", tag),
    }
}

/// Accumulates entries for one data block.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: Vec<u8>,
    offsets: Vec<u32>,
}

impl BlockBuilder {
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        self.offsets.push(self.buf.len() as u32);
        self.buf.write_u32::<LittleEndian>(entry.key.len() as u32)?;
        self.buf.extend_from_slice(&entry.key);
        self.buf.write_u64::<LittleEndian>(entry.seq)?;
        match &entry.value {
            Some(v) => {
                self.buf.write_u8(1)?;
                self.buf.write_u32::<LittleEndian>(v.len() as u32)?;
                self.buf.extend_from_slice(v);
            }
            None => self.buf.write_u8(0)?,
        }
        Ok(())
    }

    /// Uncompressed size so far, including the offsets array.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.offsets.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Returns the raw block bytes and resets the builder.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let mut out = std::mem::take(&mut self.buf);
        for off in &self.offsets {
            out.write_u32::<LittleEndian>(*off)?;
        }
        out.write_u32::<LittleEndian>(self.offsets.len() as u32)?;
        self.offsets.clear();
        Ok(out)
    }
}

/// A decoded data block, shared through the block cache.
#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
    offsets: Vec<u32>,
}

impl Block {
    pub fn decode(mut data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            bail!("block too small");
        }
        let n_at = data.len() - 4;
        let n = u32::from_le_bytes([data[n_at], data[n_at + 1], data[n_at + 2], data[n_at + 3]])
            as usize;
        let offsets_len = n.checked_mul(4).unwrap_or(usize::MAX);
        if offsets_len > n_at {
            bail!("block offsets array overruns block ({} entries)", n);
        }
        let offsets_at = n_at - offsets_len;
        let mut r = &data[offsets_at..n_at];
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            let off = r.read_u32::<LittleEndian>()?;
            if off as usize >= offsets_at {
                bail!("block entry offset {} out of range", off);
            }
            offsets.push(off);
        }
        data.truncate(offsets_at);
        Ok(Self { data, offsets })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Approximate heap footprint, charged against the cache budget.
    pub fn charge(&self) -> usize {
        self.data.len() + self.offsets.len() * 4 + std::mem::size_of::<Self>()
    }

    /// Decodes entry `i` without copying the value.
    pub fn key_seq_at(&self, i: usize) -> Result<(&[u8], u64)> {
        let mut r = &self.data[self.offsets[i] as usize..];
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_KEY_BYTES || key_len > r.len() {
            bail!("block key_len {} out of range", key_len);
        }
        let key = &r[..key_len];
        r = &r[key_len..];
        let seq = r.read_u64::<LittleEndian>()?;
        Ok((key, seq))
    }

    pub fn entry_at(&self, i: usize) -> Result<Entry> {
        let mut r = &self.data[self.offsets[i] as usize..];
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_KEY_BYTES || key_len > r.len() {
            bail!("block key_len {} out of range", key_len);
        }
        let key = r[..key_len].to_vec();
        r = &r[key_len..];
        let seq = r.read_u64::<LittleEndian>()?;
        let value = match r.read_u8()? {
            0 => None,
            1 => {
                let val_len = r.read_u32::<LittleEndian>()? as usize;
                if val_len > MAX_VALUE_BYTES || val_len > r.len() {
                    bail!("block val_len {} out of range", val_len);
                }
                Some(r[..val_len].to_vec())
            }
            kind => bail!("unknown entry kind {}", kind),
        };
        Ok(Entry { key, seq, value })
    }

    /// Index of the first entry ordered at or after `(key, seq)`, or `len()`.
    pub fn seek(&self, key: &[u8], seq: u64) -> Result<usize> {
        let (mut lo, mut hi) = (0usize, self.offsets.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (k, s) = self.key_seq_at(mid)?;
            if cmp_internal(k, s, key, seq) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}
