//! Replicated command and its log payload encoding.
//!
//! ```text
//! Put:        [1][sequence u64][key_len u32][key][value_len u32][value]
//! Delete:     [2][sequence u64][key_len u32][key]
//! Membership: [3][n u32][voter u64 ...][m u32][outgoing u64 ...]
//! Noop:       [4]
//! ```
//!
//! All integers are little endian.

use crate::membership::Membership;
use crate::{NodeId, RaftError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeSet;
use std::io::{Cursor, Read};

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_MEMBERSHIP: u8 = 3;
const TAG_NOOP: u8 = 4;

/// Largest key or value the decoder accepts.
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        sequence: u64,
    },
    Delete {
        key: Vec<u8>,
        sequence: u64,
    },
    /// New voter configuration. Takes effect as soon as it is appended.
    MembershipChange(Membership),
    /// Appended by every new leader.
    Noop,
}

impl Command {
    /// MVCC sequence of a data command.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Command::Put { sequence, .. } | Command::Delete { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    pub fn is_membership_change(&self) -> bool {
        matches!(self, Command::MembershipChange(_))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // writes into a Vec cannot fail
        let _ = self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            Command::Put {
                key,
                value,
                sequence,
            } => {
                buf.write_u8(TAG_PUT)?;
                buf.write_u64::<LittleEndian>(*sequence)?;
                write_bytes(buf, key)?;
                write_bytes(buf, value)?;
            }
            Command::Delete { key, sequence } => {
                buf.write_u8(TAG_DELETE)?;
                buf.write_u64::<LittleEndian>(*sequence)?;
                write_bytes(buf, key)?;
            }
            Command::MembershipChange(m) => {
                buf.write_u8(TAG_MEMBERSHIP)?;
                write_ids(buf, &m.voters)?;
                write_ids(buf, &m.outgoing)?;
            }
            Command::Noop => buf.write_u8(TAG_NOOP)?,
        }
        Ok(())
    }

    /// Decodes a payload produced by [`Command::encode`]. Trailing bytes are
    /// rejected.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(payload);
        let cmd = Self::decode_from(&mut cur).map_err(|e| RaftError::Codec(e.to_string()))?;
        if (cur.position() as usize) != payload.len() {
            return Err(RaftError::Codec(format!(
                "{} trailing bytes after command",
                payload.len() - cur.position() as usize
            )));
        }
        Ok(cmd)
    }

    fn decode_from(cur: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let tag = cur.read_u8()?;
        let cmd = match tag {
            TAG_PUT => {
                let sequence = cur.read_u64::<LittleEndian>()?;
                let key = read_bytes(cur)?;
                let value = read_bytes(cur)?;
                Command::Put {
                    key,
                    value,
                    sequence,
                }
            }
            TAG_DELETE => {
                let sequence = cur.read_u64::<LittleEndian>()?;
                let key = read_bytes(cur)?;
                Command::Delete { key, sequence }
            }
            TAG_MEMBERSHIP => {
                let voters = read_ids(cur)?;
                let outgoing = read_ids(cur)?;
                Command::MembershipChange(Membership { voters, outgoing })
            }
            TAG_NOOP => Command::Noop,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown command tag {}", other),
                ))
            }
        };
        Ok(cmd)
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> std::io::Result<()> {
    buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes(cur: &mut Cursor<&[u8]>) -> std::io::Result<Vec<u8>> {
    let len = cur.read_u32::<LittleEndian>()?;
    let remaining = cur.get_ref().len() as u64 - cur.position();
    if len > MAX_FIELD_LEN || u64::from(len) > remaining {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("field of {} bytes exceeds payload", len),
        ));
    }
    let mut out = vec![0u8; len as usize];
    cur.read_exact(&mut out)?;
    Ok(out)
}

fn write_ids(buf: &mut Vec<u8>, ids: &BTreeSet<NodeId>) -> std::io::Result<()> {
    buf.write_u32::<LittleEndian>(ids.len() as u32)?;
    for id in ids {
        buf.write_u64::<LittleEndian>(*id)?;
    }
    Ok(())
}

fn read_ids(cur: &mut Cursor<&[u8]>) -> std::io::Result<BTreeSet<NodeId>> {
    let n = cur.read_u32::<LittleEndian>()?;
    let mut ids = BTreeSet::new();
    for _ in 0..n {
        ids.insert(cur.read_u64::<LittleEndian>()?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_decodes_to_itself() {
        let cmds = vec![
            Command::Put {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
                sequence: 7,
            },
            Command::Put {
                key: Vec::new(),
                value: Vec::new(),
                sequence: 0,
            },
            Command::Delete {
                key: b"gone".to_vec(),
                sequence: 9,
            },
            Command::MembershipChange(Membership::joint(
                &Membership::new([1, 2, 3]),
                [2, 3, 4].into_iter().collect(),
            )),
            Command::Noop,
        ];
        for cmd in cmds {
            assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let enc = Command::Put {
            key: b"key".to_vec(),
            value: b"value".to_vec(),
            sequence: 1,
        }
        .encode();
        for cut in 0..enc.len() {
            assert!(Command::decode(&enc[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut enc = Command::Noop.encode();
        enc.push(0);
        let err = Command::decode(&enc).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(Command::decode(&[42]), Err(RaftError::Codec(_))));
    }

    #[test]
    fn sequence_only_on_data_commands() {
        assert_eq!(
            Command::Delete {
                key: vec![1],
                sequence: 5
            }
            .sequence(),
            Some(5)
        );
        assert_eq!(Command::Noop.sequence(), None);
        assert!(Command::MembershipChange(Membership::new([1])).is_membership_change());
    }
}
