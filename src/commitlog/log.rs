use crate::replica::Term;
use bytes::Bytes;
use std::{fmt, io};

/// Position is the position of an entry in the replicated log. Positions are consecutive and
/// start from 1; there is never an entry at position 0.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Position(u64);

impl Position {
    pub fn new(position: u64) -> Self {
        assert_ne!(position, 0, "Log positions start from 1");
        Position(position)
    }

    pub fn start_position() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Position {
        Position(self.0 + 1)
    }

    /// The position of the entry preceding this one, or `None` for the first entry.
    pub fn previous(&self) -> Option<Position> {
        if self.0 > 1 {
            Some(Position(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position following `last`, where `None` means the log is empty.
pub fn next_position(last: Option<Position>) -> Position {
    last.map(|p| p.next()).unwrap_or_else(Position::start_position)
}

/// Address is a byte offset into durable log storage.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Address(u64);

impl Address {
    pub fn new(address: u64) -> Self {
        Address(address)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: usize) -> Address {
        Address(self.0 + delta as u64)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// EntryId uniquely identifies a log entry across the cluster.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct EntryId {
    pub position: Position,
    pub term: Term,
}

impl EntryId {
    pub fn new(position: Position, term: Term) -> Self {
        EntryId { position, term }
    }

    /// Raft's "at least as up to date" comparison: later term wins, otherwise the longer log.
    pub fn is_at_least_as_up_to_date_as(candidate: Option<EntryId>, mine: Option<EntryId>) -> bool {
        match (candidate, mine) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(theirs), Some(mine)) => {
                if theirs.term != mine.term {
                    theirs.term > mine.term
                } else {
                    theirs.position >= mine.position
                }
            }
        }
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(P{:?}, T{:?})", self.position, self.term)
    }
}

/// LogStorage is durable, append-only block storage. A block is written and read back as a unit
/// of bytes; the caller owns the framing of entries within a block.
pub trait LogStorage: Send {
    /// Durably appends `block`, returning the address of its first byte.
    fn append(&mut self, block: &[u8]) -> Result<Address, io::Error>;

    /// Reads from `address` through the end of the block containing it. Returns `None` once
    /// `address` is at or past the end of storage.
    fn read(&self, address: Address) -> Result<Option<Bytes>, io::Error>;

    /// Discards every byte at and after `address`.
    fn truncate(&mut self, address: Address) -> Result<(), io::Error>;

    fn first_block_address(&self) -> Option<Address>;
}

/// BlockIndex maps log positions to the storage address of the block holding them.
pub trait BlockIndex: Send {
    /// Address of the block whose first entry is the greatest position not exceeding `position`.
    fn lookup_block_address(&self, position: Position) -> Option<Address>;

    fn add_block(&mut self, first_position: Position, address: Address);

    /// Forgets every block whose first entry lies after `last_kept`. `None` forgets everything.
    fn truncate_after(&mut self, last_kept: Option<Position>);

    fn is_empty(&self) -> bool;
}
