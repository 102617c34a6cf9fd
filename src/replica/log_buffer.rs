use crate::commitlog::{next_position, Address, BlockIndex, EntryId, LogEntry, LogReader, LogStorage, Position};
use crate::replica::time::Clock;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum LogBufferError {
    /// Staged entries stay buffered and are retried by the next flush.
    #[error("Failed to flush buffered entries")]
    Flush(#[source] io::Error),
    #[error("Log storage failure")]
    Storage(#[source] io::Error),
    #[error("Entry at position {actual:?} does not follow the last received position; expected {expected:?}")]
    NonContiguous { expected: Position, actual: Position },
    /// Block index and storage disagree. Not recoverable.
    #[error("No storage address for position {0:?}")]
    TruncateAddressNotFound(Position),
}

impl LogBufferError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogBufferError::TruncateAddressNotFound(_))
    }
}

/// ReplicatedLogBuffer stages appended entries in memory and writes them to storage as a single
/// block per flush.
///
/// Invariant: `last_written <= last_received`. Entries in `(last_written, last_received]` are
/// buffered; everything up to `last_written` is durable.
pub struct ReplicatedLogBuffer {
    logger: slog::Logger,
    storage: Box<dyn LogStorage>,
    index: Box<dyn BlockIndex>,
    clock: Arc<dyn Clock>,
    staging: BytesMut,
    capacity: usize,
    flush_interval: Duration,
    // Ids of staged entries, in order.
    buffered: Vec<EntryId>,
    last_written: Option<EntryId>,
    last_received: Option<EntryId>,
    last_flush: Instant,
}

impl ReplicatedLogBuffer {
    /// Opens the buffer over existing storage, recovering the last durable entry.
    pub(crate) fn open(
        logger: slog::Logger,
        storage: Box<dyn LogStorage>,
        index: Box<dyn BlockIndex>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        flush_interval: Duration,
    ) -> Result<Self, LogBufferError> {
        let mut last_written = None;
        let mut reader = LogReader::from_first_block(storage.as_ref());
        while let Some((_, entry)) = reader.next_entry().map_err(LogBufferError::Storage)? {
            last_written = Some(entry.id());
        }
        slog::info!(logger, "Opened log with last entry {:?}", last_written);

        let now = clock.now();
        Ok(ReplicatedLogBuffer {
            logger,
            storage,
            index,
            clock,
            staging: BytesMut::with_capacity(capacity),
            capacity,
            flush_interval,
            buffered: vec![],
            last_written,
            last_received: last_written,
            last_flush: now,
        })
    }

    // ------- Writes -------

    /// Stages `entry`. Flushes first if it would overflow a non-empty staging buffer.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), LogBufferError> {
        let expected = next_position(self.last_received.map(|e| e.position));
        if entry.position != expected {
            return Err(LogBufferError::NonContiguous {
                expected,
                actual: entry.position,
            });
        }

        if !self.staging.is_empty() && self.staging.len() + entry.encoded_len() > self.capacity {
            self.flush()?;
        }

        entry.encode(&mut self.staging);
        self.buffered.push(entry.id());
        self.last_received = Some(entry.id());

        Ok(())
    }

    /// Writes staged entries as one block. Returns the block's address, or `None` if nothing was
    /// buffered. On failure the staged entries are retained.
    pub fn flush(&mut self) -> Result<Option<Address>, LogBufferError> {
        let first_buffered = match self.first_buffered_position() {
            Some(position) => position,
            None => return Ok(None),
        };

        let address = self.storage.append(&self.staging).map_err(LogBufferError::Flush)?;
        self.index.add_block(first_buffered, address);
        self.last_written = self.last_received;
        self.staging.clear();
        self.buffered.clear();
        self.last_flush = self.clock.now();

        Ok(Some(address))
    }

    pub fn discard_buffered_entries(&mut self) {
        if !self.buffered.is_empty() {
            slog::debug!(
                self.logger,
                "Discarding {} buffered entries after {:?}",
                self.buffered.len(),
                self.last_written
            );
        }
        self.staging.clear();
        self.buffered.clear();
        self.last_received = self.last_written;
    }

    /// True once more than the flush interval has passed since the last flush.
    pub fn should_flush(&self) -> bool {
        self.clock.now().duration_since(self.last_flush) > self.flush_interval
    }

    /// Makes `last` the final entry of the log: buffered entries are discarded and every durable
    /// entry after `last` is truncated. `None` empties the log.
    pub fn set_last_written_entry(&mut self, last: Option<EntryId>) -> Result<(), LogBufferError> {
        self.discard_buffered_entries();

        let following = next_position(last.map(|e| e.position));
        let durable_beyond = self.last_written.map_or(false, |e| e.position >= following);
        if durable_beyond {
            self.truncate(following)?;
        }

        self.last_written = last;
        self.last_received = last;
        Ok(())
    }

    /// Removes the entry at `position` and everything after it from storage.
    pub fn truncate(&mut self, position: Position) -> Result<(), LogBufferError> {
        let address = self
            .resolve_address(position)?
            .ok_or(LogBufferError::TruncateAddressNotFound(position))?;
        let previous = match position.previous() {
            Some(p) => self.entry_id(p)?,
            None => None,
        };

        slog::info!(self.logger, "Truncating log from position {:?} ({:?})", position, address);
        self.storage.truncate(address).map_err(LogBufferError::Storage)?;
        self.index.truncate_after(position.previous());
        self.discard_buffered_entries();
        self.last_written = previous;
        self.last_received = previous;

        Ok(())
    }

    // ------- Reads -------

    /// Reads a durable entry.
    pub fn read_entry(&self, position: Position) -> Result<Option<LogEntry>, LogBufferError> {
        if !self.is_durable(position) {
            return Ok(None);
        }

        let start = self.scan_start(position);
        let mut reader = LogReader::new(self.storage.as_ref(), start);
        while let Some((_, entry)) = reader.next_entry().map_err(LogBufferError::Storage)? {
            if entry.position == position {
                return Ok(Some(entry));
            } else if entry.position > position {
                break;
            }
        }

        Ok(None)
    }

    pub fn entry_id(&self, position: Position) -> Result<Option<EntryId>, LogBufferError> {
        Ok(self.read_entry(position)?.map(|e| e.id()))
    }

    /// Up to `max` durable entries following `previous`.
    pub fn entries_after(&self, previous: Option<Position>, max: usize) -> Result<Vec<LogEntry>, LogBufferError> {
        let first = next_position(previous);
        if max == 0 || !self.is_durable(first) {
            return Ok(vec![]);
        }

        let mut entries = Vec::new();
        let mut reader = LogReader::new(self.storage.as_ref(), self.scan_start(first));
        while let Some((_, entry)) = reader.next_entry().map_err(LogBufferError::Storage)? {
            if entry.position < first {
                continue;
            }
            entries.push(entry);
            if entries.len() >= max {
                break;
            }
        }

        Ok(entries)
    }

    // ------- Predicates -------

    /// True if the log holds exactly this entry, durably or buffered. The empty prefix (`None`)
    /// is always contained.
    pub fn contains_entry(&self, id: Option<EntryId>) -> Result<bool, LogBufferError> {
        let id = match id {
            Some(id) => id,
            None => return Ok(true),
        };

        if self.is_buffered(id.position) {
            return Ok(self.buffered.contains(&id));
        }

        Ok(self.entry_id(id.position)? == Some(id))
    }

    pub fn is_last_written_entry(&self, id: Option<EntryId>) -> bool {
        self.last_written == id
    }

    pub fn is_last_received_entry(&self, id: Option<EntryId>) -> bool {
        self.last_received == id
    }

    /// True if `position` is staged but not yet durable.
    pub fn is_buffered(&self, position: Position) -> bool {
        match (self.first_buffered_position(), self.last_received) {
            (Some(first), Some(last)) => first <= position && position <= last.position,
            _ => false,
        }
    }

    pub fn has_buffered_entries(&self) -> bool {
        !self.buffered.is_empty()
    }

    pub fn last_written(&self) -> Option<EntryId> {
        self.last_written
    }

    pub fn last_received(&self) -> Option<EntryId> {
        self.last_received
    }

    pub fn first_buffered_position(&self) -> Option<Position> {
        self.buffered.first().map(|e| e.position)
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    // ------- Internals -------

    fn is_durable(&self, position: Position) -> bool {
        self.last_written.map_or(false, |e| position <= e.position)
    }

    fn scan_start(&self, position: Position) -> Option<Address> {
        if self.index.is_empty() {
            self.storage.first_block_address()
        } else {
            self.index
                .lookup_block_address(position)
                .or_else(|| self.storage.first_block_address())
        }
    }

    /// Storage address of the entry at `position`: block index fast path, linear scan from
    /// storage's first block otherwise.
    fn resolve_address(&self, position: Position) -> Result<Option<Address>, LogBufferError> {
        if let Some(block) = self.index.lookup_block_address(position) {
            if let Some(address) = self.scan_for(Some(block), position)? {
                return Ok(Some(address));
            }
            slog::warn!(
                self.logger,
                "Block index points at {:?} for {:?} but the entry isn't there. Scanning.",
                block,
                position
            );
        }

        self.scan_for(self.storage.first_block_address(), position)
    }

    fn scan_for(&self, start: Option<Address>, position: Position) -> Result<Option<Address>, LogBufferError> {
        let mut reader = LogReader::new(self.storage.as_ref(), start);
        while let Some((address, entry)) = reader.next_entry().map_err(LogBufferError::Storage)? {
            if entry.position == position {
                return Ok(Some(address));
            } else if entry.position > position {
                break;
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{InMemoryBlockIndex, InMemoryStorage};
    use crate::replica::test_utils::{test_logger, RecordingStorage};
    use crate::replica::{mocked_clock, MockClockController, Term};
    use bytes::{Bytes, BytesMut};

    fn data(position: u64, term: u64) -> LogEntry {
        LogEntry::data(
            Position::new(position),
            Term::new(term),
            Bytes::from(format!("data-{}", position)),
        )
    }

    fn id(position: u64, term: u64) -> Option<EntryId> {
        Some(EntryId::new(Position::new(position), Term::new(term)))
    }

    fn buffer_over(storage: Box<dyn LogStorage>, index: Box<dyn BlockIndex>) -> (ReplicatedLogBuffer, MockClockController) {
        let (clock, controller) = mocked_clock();
        let buffer = ReplicatedLogBuffer::open(
            test_logger(),
            storage,
            index,
            Arc::new(clock),
            64 * 1024,
            Duration::from_secs(2),
        )
        .unwrap();

        (buffer, controller)
    }

    fn new_buffer() -> (ReplicatedLogBuffer, RecordingStorage, MockClockController) {
        let storage = RecordingStorage::new();
        let (buffer, clock) = buffer_over(Box::new(storage.clone()), Box::new(InMemoryBlockIndex::new()));
        (buffer, storage, clock)
    }

    #[test]
    fn flush_writes_one_block_with_both_entries() {
        // -- setup --
        let (mut buffer, storage, _clock) = new_buffer();
        let e1 = data(1, 1);
        let e2 = data(2, 1);

        // -- execute --
        buffer.append(&e1).unwrap();
        buffer.append(&e2).unwrap();
        assert_eq!(storage.appended_blocks().len(), 0);
        assert_eq!(buffer.last_written(), None);
        assert_eq!(buffer.last_received(), id(2, 1));

        let address = buffer.flush().unwrap();

        // -- verify --
        let blocks = storage.appended_blocks();
        assert_eq!(blocks.len(), 1);
        let mut expected = BytesMut::new();
        e1.encode(&mut expected);
        e2.encode(&mut expected);
        assert_eq!(blocks[0], expected.to_vec());
        assert_eq!(address, Some(Address::new(0)));
        assert_eq!(buffer.last_written(), id(2, 1));
        assert!(!buffer.has_buffered_entries());
        assert_eq!(buffer.read_entry(Position::new(2)).unwrap(), Some(e2));
    }

    #[test]
    fn flush_of_empty_buffer_is_noop() {
        let (mut buffer, storage, _clock) = new_buffer();
        assert_eq!(buffer.flush().unwrap(), None);
        assert!(storage.appended_blocks().is_empty());
    }

    #[test]
    fn discard_reverts_to_last_written() {
        let (mut buffer, _storage, _clock) = new_buffer();
        buffer.append(&data(1, 1)).unwrap();
        buffer.flush().unwrap();
        buffer.append(&data(2, 1)).unwrap();
        assert!(buffer.is_buffered(Position::new(2)));

        buffer.discard_buffered_entries();

        assert_eq!(buffer.last_received(), id(1, 1));
        assert_eq!(buffer.last_written(), id(1, 1));
        assert!(!buffer.has_buffered_entries());
        assert!(!buffer.is_buffered(Position::new(2)));
        assert_eq!(buffer.first_buffered_position(), None);
        // Position 2 is free again.
        buffer.append(&data(2, 2)).unwrap();
    }

    #[test]
    fn failed_flush_retains_entries() {
        let (mut buffer, storage, _clock) = new_buffer();
        buffer.append(&data(1, 1)).unwrap();
        storage.fail_appends(true);

        let result = buffer.flush();
        assert!(matches!(result, Err(LogBufferError::Flush(_))));
        assert_eq!(buffer.last_written(), None);
        assert!(buffer.is_buffered(Position::new(1)));

        storage.fail_appends(false);
        buffer.flush().unwrap();
        assert_eq!(buffer.last_written(), id(1, 1));
        assert_eq!(storage.appended_blocks().len(), 1);
    }

    #[test]
    fn append_overflow_flushes_first() {
        let (clock, _controller) = mocked_clock();
        let storage = RecordingStorage::new();
        let e1 = data(1, 1);
        let mut buffer = ReplicatedLogBuffer::open(
            test_logger(),
            Box::new(storage.clone()),
            Box::new(InMemoryBlockIndex::new()),
            Arc::new(clock),
            e1.encoded_len() + 1,
            Duration::from_secs(2),
        )
        .unwrap();

        buffer.append(&e1).unwrap();
        buffer.append(&data(2, 1)).unwrap();

        assert_eq!(storage.appended_blocks().len(), 1);
        assert_eq!(buffer.last_written(), id(1, 1));
        assert_eq!(buffer.last_received(), id(2, 1));
    }

    #[test]
    fn rejects_gaps() {
        let (mut buffer, _storage, _clock) = new_buffer();
        let result = buffer.append(&data(2, 1));
        assert!(matches!(result, Err(LogBufferError::NonContiguous { .. })));
    }

    #[test]
    fn should_flush_after_interval() {
        let (buffer, _storage, mut clock) = new_buffer();
        assert!(!buffer.should_flush());
        clock.advance(Duration::from_secs(2));
        assert!(!buffer.should_flush());
        clock.advance(Duration::from_millis(1));
        assert!(buffer.should_flush());
    }

    #[test]
    fn predicates() {
        let (mut buffer, _storage, _clock) = new_buffer();
        buffer.append(&data(1, 1)).unwrap();
        buffer.append(&data(2, 1)).unwrap();
        buffer.flush().unwrap();
        buffer.append(&data(3, 2)).unwrap();

        assert!(buffer.contains_entry(None).unwrap());
        assert!(buffer.contains_entry(id(2, 1)).unwrap());
        assert!(!buffer.contains_entry(id(2, 2)).unwrap());
        assert!(buffer.contains_entry(id(3, 2)).unwrap());
        assert!(!buffer.contains_entry(id(4, 2)).unwrap());

        assert!(buffer.is_last_written_entry(id(2, 1)));
        assert!(buffer.is_last_received_entry(id(3, 2)));
        assert!(!buffer.is_last_received_entry(id(2, 1)));
        assert!(buffer.is_buffered(Position::new(3)));
        assert!(!buffer.is_buffered(Position::new(2)));
    }

    #[test]
    fn set_last_written_entry_truncates_the_rest() {
        let (mut buffer, _storage, _clock) = new_buffer();
        for p in 1..=3 {
            buffer.append(&data(p, 1)).unwrap();
        }
        buffer.flush().unwrap();
        for p in 4..=5 {
            buffer.append(&data(p, 1)).unwrap();
        }
        buffer.flush().unwrap();
        buffer.append(&data(6, 1)).unwrap();

        buffer.set_last_written_entry(id(2, 1)).unwrap();

        assert_eq!(buffer.last_written(), id(2, 1));
        assert_eq!(buffer.last_received(), id(2, 1));
        assert!(!buffer.has_buffered_entries());
        assert_eq!(buffer.read_entry(Position::new(3)).unwrap(), None);
        assert_eq!(buffer.entries_after(None, 10).unwrap().len(), 2);

        // The log continues right after the kept entry.
        buffer.append(&data(3, 2)).unwrap();
        buffer.flush().unwrap();
        assert_eq!(buffer.entry_id(Position::new(3)).unwrap(), id(3, 2));
    }

    #[test]
    fn truncate_falls_back_to_scan_without_index() {
        // -- setup -- storage written by someone else; the index knows nothing.
        let mut storage = InMemoryStorage::new();
        let mut block = BytesMut::new();
        for p in 1..=4 {
            data(p, 1).encode(&mut block);
        }
        storage.append(&block).unwrap();
        let (mut buffer, _clock) = buffer_over(Box::new(storage), Box::new(InMemoryBlockIndex::new()));
        assert_eq!(buffer.last_written(), id(4, 1));

        // -- execute --
        buffer.truncate(Position::new(3)).unwrap();

        // -- verify --
        assert_eq!(buffer.last_written(), id(2, 1));
        assert_eq!(buffer.read_entry(Position::new(3)).unwrap(), None);
        assert_eq!(buffer.read_entry(Position::new(2)).unwrap(), Some(data(2, 1)));
    }

    #[test]
    fn truncate_unknown_position_is_fatal() {
        let (mut buffer, _storage, _clock) = new_buffer();
        buffer.append(&data(1, 1)).unwrap();
        buffer.flush().unwrap();

        let error = buffer.truncate(Position::new(7)).unwrap_err();
        assert!(error.is_fatal());
        assert!(matches!(error, LogBufferError::TruncateAddressNotFound(p) if p == Position::new(7)));
    }

    #[test]
    fn entries_after_crosses_blocks() {
        let (mut buffer, _storage, _clock) = new_buffer();
        for p in 1..=2 {
            buffer.append(&data(p, 1)).unwrap();
        }
        buffer.flush().unwrap();
        for p in 3..=5 {
            buffer.append(&data(p, 1)).unwrap();
        }
        buffer.flush().unwrap();
        buffer.append(&data(6, 1)).unwrap();

        let positions: Vec<u64> = buffer
            .entries_after(Some(Position::new(1)), 3)
            .unwrap()
            .iter()
            .map(|e| e.position.as_u64())
            .collect();
        assert_eq!(positions, vec![2, 3, 4]);

        // Buffered entries aren't replicated.
        assert!(buffer.entries_after(Some(Position::new(5)), 3).unwrap().is_empty());
    }

    #[test]
    fn reopen_recovers_last_entry() {
        let mut storage = InMemoryStorage::new();
        let mut block = BytesMut::new();
        data(1, 1).encode(&mut block);
        data(2, 3).encode(&mut block);
        storage.append(&block).unwrap();

        let (buffer, _clock) = buffer_over(Box::new(storage), Box::new(InMemoryBlockIndex::new()));
        assert_eq!(buffer.last_written(), id(2, 3));
        assert_eq!(buffer.last_received(), id(2, 3));
    }
}
