use crate::commitlog::{Address, BlockIndex, LogStorage, Position};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;

// I am focusing on the consensus algorithm, not strictly about exactly how to persist the data
// durably. Storage is modeled here as a list of immutable blocks at increasing byte offsets.
#[derive(Default)]
pub struct InMemoryStorage {
    blocks: Vec<Block>,
    end: u64,
}

struct Block {
    address: u64,
    bytes: Bytes,
}

impl Block {
    fn end(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block_containing(&self, address: u64) -> Option<&Block> {
        let i = self.blocks.partition_point(|b| b.end() <= address);
        self.blocks.get(i).filter(|b| b.address <= address)
    }
}

impl LogStorage for InMemoryStorage {
    fn append(&mut self, block: &[u8]) -> Result<Address, io::Error> {
        if block.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Refusing to append empty block"));
        }

        let address = self.end;
        self.blocks.push(Block {
            address,
            bytes: Bytes::copy_from_slice(block),
        });
        self.end += block.len() as u64;

        Ok(Address::new(address))
    }

    fn read(&self, address: Address) -> Result<Option<Bytes>, io::Error> {
        let address = address.as_u64();
        let bytes = self
            .block_containing(address)
            .map(|b| b.bytes.slice((address - b.address) as usize..));

        Ok(bytes)
    }

    fn truncate(&mut self, address: Address) -> Result<(), io::Error> {
        let address = address.as_u64();
        if address >= self.end {
            return Ok(());
        }

        self.blocks.retain(|b| b.address < address);
        if let Some(last) = self.blocks.last_mut() {
            if last.end() > address {
                last.bytes.truncate((address - last.address) as usize);
            }
        }
        self.end = address;

        Ok(())
    }

    fn first_block_address(&self) -> Option<Address> {
        self.blocks.first().map(|b| Address::new(b.address))
    }
}

#[derive(Default)]
pub struct InMemoryBlockIndex {
    blocks: BTreeMap<Position, Address>,
}

impl InMemoryBlockIndex {
    pub fn new() -> Self {
        InMemoryBlockIndex::default()
    }
}

impl BlockIndex for InMemoryBlockIndex {
    fn lookup_block_address(&self, position: Position) -> Option<Address> {
        self.blocks.range(..=position).next_back().map(|(_, address)| *address)
    }

    fn add_block(&mut self, first_position: Position, address: Address) {
        self.blocks.insert(first_position, address);
    }

    fn truncate_after(&mut self, last_kept: Option<Position>) {
        match last_kept {
            Some(position) => {
                self.blocks.split_off(&position.next());
            }
            None => self.blocks.clear(),
        }
    }

    fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_read_and_truncate_mid_block() {
        let mut storage = InMemoryStorage::new();
        let a1 = storage.append(b"abcd").unwrap();
        let a2 = storage.append(b"efg").unwrap();
        assert_eq!(a1, Address::new(0));
        assert_eq!(a2, Address::new(4));
        assert_eq!(storage.first_block_address(), Some(a1));

        assert_eq!(storage.read(Address::new(2)).unwrap().unwrap(), Bytes::from_static(b"cd"));
        assert_eq!(storage.read(a2).unwrap().unwrap(), Bytes::from_static(b"efg"));
        assert_eq!(storage.read(Address::new(7)).unwrap(), None);

        storage.truncate(Address::new(5)).unwrap();
        assert_eq!(storage.read(a2).unwrap().unwrap(), Bytes::from_static(b"e"));

        // Subsequent appends land directly after the truncation point.
        let a3 = storage.append(b"xy").unwrap();
        assert_eq!(a3, Address::new(5));
        assert_eq!(storage.block_count(), 3);

        storage.truncate(Address::new(0)).unwrap();
        assert_eq!(storage.block_count(), 0);
        assert_eq!(storage.first_block_address(), None);
    }

    #[test]
    fn index_lookup_and_truncate() {
        let mut index = InMemoryBlockIndex::new();
        assert!(index.is_empty());
        index.add_block(Position::new(1), Address::new(0));
        index.add_block(Position::new(4), Address::new(100));
        index.add_block(Position::new(9), Address::new(250));

        assert_eq!(index.lookup_block_address(Position::new(3)), Some(Address::new(0)));
        assert_eq!(index.lookup_block_address(Position::new(4)), Some(Address::new(100)));
        assert_eq!(index.lookup_block_address(Position::new(20)), Some(Address::new(250)));

        index.truncate_after(Some(Position::new(5)));
        assert_eq!(index.lookup_block_address(Position::new(20)), Some(Address::new(100)));

        index.truncate_after(None);
        assert!(index.is_empty());
    }
}
