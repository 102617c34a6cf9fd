mod entry;
mod in_memory;
mod log;
mod reader;

pub use entry::EntryDecodeError;
pub use entry::EntryKind;
pub use entry::LogEntry;
pub use in_memory::InMemoryBlockIndex;
pub use in_memory::InMemoryStorage;
pub use log::next_position;
pub use log::Address;
pub use log::BlockIndex;
pub use log::EntryId;
pub use log::LogStorage;
pub use log::Position;

pub(crate) use reader::LogReader;
