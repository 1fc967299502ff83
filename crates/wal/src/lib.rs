//! # WAL - Durable Replicated Log
//!
//! Crash-safe storage for the consensus log and the node's persistent vote
//! state.
//!
//! Every log entry accepted by consensus is framed, checksummed and appended
//! here **before** it is acknowledged to the leader. On restart the log is
//! replayed to rebuild the in-memory entry list.
//!
//! ## Binary Record Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! Body: `[index: u64][term: u64][payload_len: u32][payload]`
//!
//! `record_len` includes the 4-byte CRC but **not** itself. The payload is an
//! opaque, already-encoded command.
//!
//! ## Modules
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | (root)       | record framing, [`WalWriter`], [`WalReader`]          |
//! | `segment`    | [`SegmentedLog`]: fixed-size segments, truncation     |
//! | `hard_state` | [`HardState`] file: term, vote, commit index          |
//!
//! ## Example
//!
//! ```rust,no_run
//! use wal::{WalWriter, WalReader, WalRecord};
//!
//! let mut w = WalWriter::create("log-00000000000000000001.wal", true).unwrap();
//! w.append(&WalRecord::new(1, 1, b"cmd".to_vec())).unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("log-00000000000000000001.wal").unwrap();
//! r.replay(|rec| println!("{:?}", rec)).unwrap();
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

mod hard_state;
mod segment;

pub use hard_state::HardState;
pub use segment::SegmentedLog;

/// Largest frame the reader accepts. Anything bigger is treated as corruption.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Frame header: `record_len` + `crc32`.
const FRAME_HEADER: usize = 8;

/// One durable log record: a consensus log entry in encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Position in the replicated log. Gap-free and strictly increasing.
    pub index: u64,
    /// Leadership epoch that created the entry.
    pub term: u64,
    /// Encoded command bytes.
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn new(index: u64, term: u64, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }

    /// Size of this record once framed on disk.
    pub fn framed_len(&self) -> u64 {
        (FRAME_HEADER + 8 + 8 + 4 + self.payload.len()) as u64
    }
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or had an impossible length.
    #[error("corrupt record at byte offset {offset}")]
    Corrupt { offset: u64 },

    /// Appended records do not continue the log without a gap.
    #[error("log discontinuity: expected index {expected}, got {got}")]
    Discontinuity { expected: u64, got: u64 },
}

/// Serializes `record` as a complete frame, appending it to `buf`.
pub fn encode_frame(record: &WalRecord, buf: &mut Vec<u8>) -> Result<(), WalError> {
    let start = buf.len();
    // Reserve the frame header (record_len + crc), filled below
    buf.extend_from_slice(&[0u8; FRAME_HEADER]);

    buf.write_u64::<LittleEndian>(record.index)?;
    buf.write_u64::<LittleEndian>(record.term)?;
    buf.write_u32::<LittleEndian>(record.payload.len() as u32)?;
    buf.extend_from_slice(&record.payload);

    let body = &buf[start + FRAME_HEADER..];
    let crc = crc32fast::hash(body);

    let record_len = (body.len() as u64) + 4;
    if record_len > u64::from(MAX_RECORD_SIZE) {
        buf.truncate(start);
        return Err(WalError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "WAL record too large",
        )));
    }

    buf[start..start + 4].copy_from_slice(&(record_len as u32).to_le_bytes());
    buf[start + 4..start + 8].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Append-only writer over a single log file.
///
/// Records are framed into a reusable buffer and written with a single
/// `write_all`. When `sync` is `true`, every append is followed by
/// `sync_all()`; otherwise durability points are chosen by the caller through
/// [`sync_to_disk`](WalWriter::sync_to_disk).
pub struct WalWriter {
    file: File,
    sync: bool,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
}

impl WalWriter {
    /// Opens (or creates) a log file in append mode.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self {
            file,
            sync,
            buf: Vec::with_capacity(256),
        })
    }

    /// Appends one record. Returns the number of bytes written.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64, WalError> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Appends several records with one write (and at most one fsync).
    /// Returns the number of bytes written.
    pub fn append_batch(&mut self, records: &[WalRecord]) -> Result<u64, WalError> {
        self.buf.clear();
        for record in records {
            encode_frame(record, &mut self.buf)?;
        }

        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_all()?;
        }
        Ok(self.buf.len() as u64)
    }

    /// Forces all written data to disk via `sync_all()`.
    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Current length of the file on disk, including bytes from a write
    /// that failed part way.
    pub fn file_len(&self) -> Result<u64, WalError> {
        Ok(self.file.metadata()?.len())
    }

    /// Cuts the file back to `len` bytes and syncs. Later appends land at the
    /// new end.
    pub fn truncate(&mut self, len: u64) -> Result<(), WalError> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader that yields valid records.
///
/// Generic over any `Read` implementor, so tests can replay in-memory buffers.
///
/// Each record's CRC32 is verified. A truncated tail record (a crash
/// mid-write) is a clean end of log: every complete record before it is still
/// returned.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    /// Opens an existing log file for sequential replay.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Replays every valid record, calling `apply` for each one.
    ///
    /// Returns the byte length of the valid prefix. That is the whole input
    /// on a clean EOF, or the offset where a truncated tail record starts.
    ///
    /// A CRC mismatch or an impossible length is `WalError::Corrupt` carrying
    /// the offset of the bad frame; callers decide whether that is a torn
    /// tail or real damage.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u64, WalError>
    where
        F: FnMut(WalRecord),
    {
        let mut body = Vec::with_capacity(256);
        let mut offset: u64 = 0;
        while self.next_frame(offset, &mut body)? {
            apply(decode_body(&body, offset)?);
            offset += (FRAME_HEADER + body.len()) as u64;
        }
        Ok(offset)
    }

    /// Reads the next frame body into `body` after checking its CRC.
    /// `Ok(false)` means the input ended, cleanly or inside a torn frame.
    fn next_frame(&mut self, offset: u64, body: &mut Vec<u8>) -> Result<bool, WalError> {
        let mut header = [0u8; FRAME_HEADER];
        if !read_or_eof(&mut self.rdr, &mut header)? {
            return Ok(false);
        }
        let mut hr = &header[..];
        let record_len = hr.read_u32::<LittleEndian>()?;
        let crc = hr.read_u32::<LittleEndian>()?;
        if record_len < MIN_RECORD_LEN || record_len > MAX_RECORD_SIZE {
            return Err(WalError::Corrupt { offset });
        }

        body.clear();
        body.resize((record_len - 4) as usize, 0);
        if !read_or_eof(&mut self.rdr, body)? {
            return Ok(false);
        }
        if crc32fast::hash(body) != crc {
            return Err(WalError::Corrupt { offset });
        }
        Ok(true)
    }
}

/// `index + term + payload_len + crc`, the smallest legal `record_len`.
const MIN_RECORD_LEN: u32 = 8 + 8 + 4 + 4;

fn read_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, WalError> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(WalError::Io(e)),
    }
}

fn decode_body(body: &[u8], offset: u64) -> Result<WalRecord, WalError> {
    let mut br = body;
    let index = br.read_u64::<LittleEndian>()?;
    let term = br.read_u64::<LittleEndian>()?;
    let payload_len = br.read_u32::<LittleEndian>()? as usize;
    if payload_len != br.len() {
        return Err(WalError::Corrupt { offset });
    }
    Ok(WalRecord::new(index, term, br.to_vec()))
}

/// Fsyncs a directory so that renames and unlinks inside it are durable.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(test)]
mod tests;
