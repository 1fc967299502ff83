//! Persistent vote state.
//!
//! ```text
//! [magic: u32 = "RKHS"][term: u64][voted_for: u64, 0 = none][commit: u64][crc32: u32]
//! ```
//!
//! Rewritten atomically (temp file, fsync, rename, directory fsync) so a
//! crash leaves either the old or the new state, never a mix.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::{sync_dir, WalError};

const HARD_STATE_MAGIC: u32 = 0x524B_4853;
const HARD_STATE_LEN: usize = 4 + 8 + 8 + 8 + 4;
const FILE_NAME: &str = "hard_state";

/// The consensus state that must survive a crash before the node votes or
/// acknowledges entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
    pub commit: u64,
}

impl HardState {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(FILE_NAME)
    }

    /// Loads the state stored in `dir`. A missing file is a fresh node.
    pub fn load(dir: &Path) -> Result<Self, WalError> {
        let path = Self::path_in(dir);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let mut buf = Vec::with_capacity(HARD_STATE_LEN);
        file.read_to_end(&mut buf)?;
        Self::decode(&buf)
    }

    /// Atomically replaces the state stored in `dir`.
    pub fn store(&self, dir: &Path) -> Result<(), WalError> {
        let path = Self::path_in(dir);
        let tmp = path.with_extension("tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&self.encode())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(dir);
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HARD_STATE_LEN);
        // Vec writes are infallible
        let _ = buf.write_u32::<LittleEndian>(HARD_STATE_MAGIC);
        let _ = buf.write_u64::<LittleEndian>(self.term);
        let _ = buf.write_u64::<LittleEndian>(self.voted_for.unwrap_or(0));
        let _ = buf.write_u64::<LittleEndian>(self.commit);
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        let _ = buf.write_u32::<LittleEndian>(crc);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WalError> {
        if buf.len() != HARD_STATE_LEN {
            return Err(WalError::Corrupt { offset: 0 });
        }
        let (body, tail) = buf.split_at(HARD_STATE_LEN - 4);
        let mut hasher = Crc32::new();
        hasher.update(body);
        let expected = (&tail[..]).read_u32::<LittleEndian>()?;
        if hasher.finalize() != expected {
            return Err(WalError::Corrupt { offset: 0 });
        }

        let mut r = body;
        if r.read_u32::<LittleEndian>()? != HARD_STATE_MAGIC {
            return Err(WalError::Corrupt { offset: 0 });
        }
        let term = r.read_u64::<LittleEndian>()?;
        let voted_for = match r.read_u64::<LittleEndian>()? {
            0 => None,
            id => Some(id),
        };
        let commit = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            term,
            voted_for,
            commit,
        })
    }
}
