use crate::commitlog::{EntryId, Position};
use crate::replica::{ReplicaId, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::string::FromUtf8Error;

/// Byte representation:
///
/// ```text
/// |                                         1                   2           |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | ... | 7 | 8 | 9 | 0 | 1 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+-...-+---+---+---+---+---+-...-+
/// |Vrs|Knd|       Position (8 bytes)      |  Term (8 bytes) |  Len (4)  | Data|
/// +---+---+-------------------------------+-------------...-+-----------+-...-+
/// ```
///
/// * `Vrs` - version of the serialized entry
/// * `Knd` - entry kind (initialize, configuration, data)
/// * `Position` - position of the entry in the replicated log
/// * `Term` - raft leadership term when this entry was created
/// * `Len` - size of `Data`; a storage block holds many entries back to back
/// * `Data` - payload; for configuration entries, the encoded member list
///
/// All integers are big endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub position: Position,
    pub term: Term,
    pub kind: EntryKind,
    pub data: Bytes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Empty entry a new leader appends to establish its term.
    Initialize,
    /// Membership list; effective once committed.
    Configuration,
    /// Application payload.
    Data,
}

#[derive(Debug, thiserror::Error)]
pub enum EntryDecodeError {
    #[error("Entry truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("Unknown entry format version {0}")]
    UnknownVersion(u8),
    #[error("Unknown entry kind {0}")]
    UnknownKind(u8),
    #[error("Entry has position 0")]
    ZeroPosition,
    #[error("Entry is not a configuration entry")]
    NotConfiguration,
    #[error("Member ID is not utf8")]
    InvalidMemberId(#[from] FromUtf8Error),
}

const ENTRY_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 8 + 8 + 4;

impl EntryKind {
    fn as_u8(&self) -> u8 {
        match self {
            EntryKind::Initialize => 1,
            EntryKind::Configuration => 2,
            EntryKind::Data => 3,
        }
    }

    fn from_u8(kind: u8) -> Result<Self, EntryDecodeError> {
        match kind {
            1 => Ok(EntryKind::Initialize),
            2 => Ok(EntryKind::Configuration),
            3 => Ok(EntryKind::Data),
            other => Err(EntryDecodeError::UnknownKind(other)),
        }
    }
}

impl LogEntry {
    pub fn initialize(position: Position, term: Term) -> Self {
        LogEntry {
            position,
            term,
            kind: EntryKind::Initialize,
            data: Bytes::new(),
        }
    }

    pub fn configuration(position: Position, term: Term, members: &[ReplicaId]) -> Self {
        LogEntry {
            position,
            term,
            kind: EntryKind::Configuration,
            data: encode_members(members),
        }
    }

    pub fn data(position: Position, term: Term, data: Bytes) -> Self {
        LogEntry {
            position,
            term,
            kind: EntryKind::Data,
            data,
        }
    }

    pub fn id(&self) -> EntryId {
        EntryId::new(self.position, self.term)
    }

    /// Decodes the member list carried by a configuration entry.
    pub fn members(&self) -> Result<Vec<ReplicaId>, EntryDecodeError> {
        if self.kind != EntryKind::Configuration {
            return Err(EntryDecodeError::NotConfiguration);
        }

        decode_members(self.data.clone())
    }

    pub(crate) fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(ENTRY_FORMAT_VERSION);
        buf.put_u8(self.kind.as_u8());
        buf.put_u64(self.position.as_u64());
        buf.put_u64(self.term.as_u64());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Decodes one entry from the front of `buf`, advancing past it.
    pub(crate) fn decode(buf: &mut Bytes) -> Result<LogEntry, EntryDecodeError> {
        ensure_remaining(buf, HEADER_LEN)?;

        let version = buf.get_u8();
        if version != ENTRY_FORMAT_VERSION {
            return Err(EntryDecodeError::UnknownVersion(version));
        }
        let kind = EntryKind::from_u8(buf.get_u8())?;
        let position = buf.get_u64();
        if position == 0 {
            return Err(EntryDecodeError::ZeroPosition);
        }
        let term = buf.get_u64();
        let len = buf.get_u32() as usize;
        ensure_remaining(buf, len)?;
        let data = buf.split_to(len);

        Ok(LogEntry {
            position: Position::new(position),
            term: Term::new(term),
            kind,
            data,
        })
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), EntryDecodeError> {
    if buf.remaining() < needed {
        Err(EntryDecodeError::Truncated {
            needed,
            remaining: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

// | count (u16) | len (u16) | id bytes | len (u16) | id bytes | ...
fn encode_members(members: &[ReplicaId]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(members.len() as u16);
    for member in members {
        let id = member.as_str().as_bytes();
        buf.put_u16(id.len() as u16);
        buf.put_slice(id);
    }

    buf.freeze()
}

fn decode_members(mut buf: Bytes) -> Result<Vec<ReplicaId>, EntryDecodeError> {
    ensure_remaining(&buf, 2)?;
    let count = buf.get_u16() as usize;

    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        ensure_remaining(&buf, 2)?;
        let len = buf.get_u16() as usize;
        ensure_remaining(&buf, len)?;
        let id = String::from_utf8(buf.split_to(len).to_vec())?;
        members.push(ReplicaId::new(id));
    }

    Ok(members)
}
