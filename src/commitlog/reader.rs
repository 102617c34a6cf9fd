use crate::commitlog::{Address, LogEntry, LogStorage};
use bytes::Bytes;
use std::io;

/// LogReader walks entries sequentially through storage, crossing block boundaries.
pub(crate) struct LogReader<'a> {
    storage: &'a dyn LogStorage,
    cursor: Option<Address>,
    // Unconsumed bytes of the current block, starting at `cursor`.
    remaining: Bytes,
}

impl<'a> LogReader<'a> {
    pub(crate) fn new(storage: &'a dyn LogStorage, start: Option<Address>) -> Self {
        LogReader {
            storage,
            cursor: start,
            remaining: Bytes::new(),
        }
    }

    /// Starts from storage's first block.
    pub(crate) fn from_first_block(storage: &'a dyn LogStorage) -> Self {
        let start = storage.first_block_address();
        Self::new(storage, start)
    }

    /// Returns the next entry along with the storage address it starts at.
    pub(crate) fn next_entry(&mut self) -> Result<Option<(Address, LogEntry)>, io::Error> {
        let address = match self.cursor {
            Some(address) => address,
            None => return Ok(None),
        };

        if self.remaining.is_empty() {
            match self.storage.read(address)? {
                Some(bytes) if !bytes.is_empty() => self.remaining = bytes,
                _ => {
                    self.cursor = None;
                    return Ok(None);
                }
            }
        }

        let len_before = self.remaining.len();
        let entry = LogEntry::decode(&mut self.remaining)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let consumed = len_before - self.remaining.len();
        self.cursor = Some(address.plus(consumed));

        Ok(Some((address, entry)))
    }
}
