//! On-disk consensus snapshot.
//!
//! ```text
//! [magic u32][version u8][index u64][term u64]
//! [n u32][voter u64 ...][m u32][outgoing u64 ...]
//! [data_len u64][header_crc u32]
//! [data ...]
//! [data_crc u32]
//! ```
//!
//! Little endian. The data is an engine image; this file only frames it
//! with the log position and configuration it represents. A mismatching
//! checksum is corruption of a committed artifact, never a torn tail: the
//! file is written to a temp name and renamed into place.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use raft::{Membership, NodeId, SnapshotMeta, StorageError};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_MAGIC: u32 = 0x524B_5653; // "RKVS"
const VERSION: u8 = 1;
const FILE_NAME: &str = "snapshot";
const MAX_VOTERS: u32 = 4096;

/// A verified snapshot file. Only the header is kept in memory.
#[derive(Debug)]
pub(crate) struct SnapshotFile {
    path: PathBuf,
    meta: SnapshotMeta,
    data_offset: u64,
    data_len: u64,
}

impl SnapshotFile {
    pub(crate) fn path_in(dir: &Path) -> PathBuf {
        dir.join(FILE_NAME)
    }

    /// Loads and verifies the snapshot in `dir`; `None` if there is none.
    pub(crate) fn load(dir: &Path) -> Result<Option<Self>, StorageError> {
        let path = Self::path_in(dir);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        let mut reader = BufReader::new(file);
        let (meta, data_len, header_len) = read_header(&mut reader, &path)?;

        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = data_len;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            reader
                .read_exact(&mut buf[..want])
                .map_err(|_| corrupt(&path, "image shorter than its header says"))?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }
        let stored = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupt(&path, "missing image checksum"))?;
        if stored != hasher.finalize() {
            return Err(corrupt(&path, "image checksum mismatch"));
        }
        Ok(Some(Self {
            path,
            meta,
            data_offset: header_len,
            data_len,
        }))
    }

    /// Atomically replaces the snapshot in `dir`.
    pub(crate) fn write(dir: &Path, meta: &SnapshotMeta, data: &[u8]) -> Result<Self, StorageError> {
        let path = Self::path_in(dir);
        let tmp = path.with_extension("tmp");
        let header = encode_header(meta, data.len() as u64);
        let result = (|| -> io::Result<()> {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&header)?;
            f.write_all(data)?;
            f.write_u32::<LittleEndian>(crc32fast::hash(data))?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        result.map_err(|e| io_err(&path, e))?;
        sstable::sync_parent(&path);
        Ok(Self {
            path,
            meta: meta.clone(),
            data_offset: header.len() as u64,
            data_len: data.len() as u64,
        })
    }

    /// Deletes the snapshot in `dir`, if any.
    pub(crate) fn remove(dir: &Path) -> Result<(), StorageError> {
        let path = Self::path_in(dir);
        match fs::remove_file(&path) {
            Ok(()) => {
                sstable::sync_parent(&path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    pub(crate) fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    pub(crate) fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Up to `max_len` image bytes from `offset`, and whether they end it.
    pub(crate) fn read_chunk(&self, offset: u64, max_len: usize) -> Result<(Vec<u8>, bool), StorageError> {
        let start = offset.min(self.data_len);
        let len = (self.data_len - start).min(max_len as u64);
        let mut buf = vec![0u8; len as usize];
        let result = (|| -> io::Result<()> {
            let mut f = File::open(&self.path)?;
            f.seek(SeekFrom::Start(self.data_offset + start))?;
            f.read_exact(&mut buf)
        })();
        result.map_err(|e| io_err(&self.path, e))?;
        Ok((buf, start + len == self.data_len))
    }

    pub(crate) fn read_data(&self) -> Result<Vec<u8>, StorageError> {
        let (data, _) = self.read_chunk(0, self.data_len as usize)?;
        Ok(data)
    }
}

fn encode_header(meta: &SnapshotMeta, data_len: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    // writes into a Vec cannot fail
    let _ = (|| -> io::Result<()> {
        buf.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
        buf.write_u8(VERSION)?;
        buf.write_u64::<LittleEndian>(meta.index)?;
        buf.write_u64::<LittleEndian>(meta.term)?;
        write_ids(&mut buf, &meta.membership.voters)?;
        write_ids(&mut buf, &meta.membership.outgoing)?;
        buf.write_u64::<LittleEndian>(data_len)?;
        Ok(())
    })();
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn write_ids(buf: &mut Vec<u8>, ids: &BTreeSet<NodeId>) -> io::Result<()> {
    buf.write_u32::<LittleEndian>(ids.len() as u32)?;
    for id in ids {
        buf.write_u64::<LittleEndian>(*id)?;
    }
    Ok(())
}

/// Returns the meta, the image length and the header length.
fn read_header<R: Read>(reader: &mut R, path: &Path) -> Result<(SnapshotMeta, u64, u64), StorageError> {
    // fixed part, then the two id lists
    let mut fixed = [0u8; 4 + 1 + 8 + 8];
    reader
        .read_exact(&mut fixed)
        .map_err(|_| corrupt(path, "truncated header"))?;
    let mut raw = fixed.to_vec();
    let mut cur = Cursor::new(&fixed[..]);
    let magic = cur.read_u32::<LittleEndian>().map_err(|e| io_err(path, e))?;
    if magic != SNAPSHOT_MAGIC {
        return Err(corrupt(path, format!("bad magic {:#x}", magic)));
    }
    let version = cur.read_u8().map_err(|e| io_err(path, e))?;
    if version != VERSION {
        return Err(corrupt(path, format!("unsupported version {}", version)));
    }
    let index = cur.read_u64::<LittleEndian>().map_err(|e| io_err(path, e))?;
    let term = cur.read_u64::<LittleEndian>().map_err(|e| io_err(path, e))?;

    let voters = read_ids(reader, &mut raw, path)?;
    let outgoing = read_ids(reader, &mut raw, path)?;
    let mut tail = [0u8; 8 + 4];
    reader
        .read_exact(&mut tail)
        .map_err(|_| corrupt(path, "truncated header"))?;
    raw.extend_from_slice(&tail[..8]);
    let mut cur = Cursor::new(&tail[..]);
    let data_len = cur.read_u64::<LittleEndian>().map_err(|e| io_err(path, e))?;
    let stored = cur.read_u32::<LittleEndian>().map_err(|e| io_err(path, e))?;
    if stored != crc32fast::hash(&raw) {
        return Err(corrupt(path, "header checksum mismatch"));
    }
    let meta = SnapshotMeta {
        index,
        term,
        membership: Membership { voters, outgoing },
    };
    Ok((meta, data_len, raw.len() as u64 + 4))
}

fn read_ids<R: Read>(reader: &mut R, raw: &mut Vec<u8>, path: &Path) -> Result<BTreeSet<NodeId>, StorageError> {
    let n = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| corrupt(path, "truncated header"))?;
    if n > MAX_VOTERS {
        return Err(corrupt(path, format!("{} voters", n)));
    }
    raw.extend_from_slice(&n.to_le_bytes());
    let mut ids = BTreeSet::new();
    for _ in 0..n {
        let id = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| corrupt(path, "truncated header"))?;
        raw.extend_from_slice(&id.to_le_bytes());
        ids.insert(id);
    }
    Ok(ids)
}

fn corrupt(path: &Path, detail: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt(format!("{}: {}", path.display(), detail))
}

fn io_err(path: &Path, e: io::Error) -> StorageError {
    StorageError::Io(format!("{}: {}", path.display(), e))
}
