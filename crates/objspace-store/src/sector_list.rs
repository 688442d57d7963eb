//! Variable-length records stored as sector chains.

use std::marker::PhantomData;

use tracing::trace;

use crate::buffer::WritableBuffer;
use crate::clustered::{ClusteredStream, SharedContainer};
use crate::error::{StoreError, StoreResult};
use crate::paged_list::StreamPagedList;
use crate::sector::{END_OF_CHAIN, FREE_SECTOR};
use crate::serializer::ItemSerializer;

/// Head sector and byte size of one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemPointer {
    pub head: i32,
    pub size: u32,
}

impl ItemPointer {
    /// Pointer of a removed record.
    pub const VACANT: Self = Self {
        head: FREE_SECTOR,
        size: 0,
    };

    pub fn is_vacant(&self) -> bool {
        self.head == FREE_SECTOR
    }
}

/// `head i32 | size u32`, little-endian.
#[derive(Clone, Copy, Debug, Default)]
pub struct PointerSerializer;

impl ItemSerializer<ItemPointer> for PointerSerializer {
    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }

    fn calculate_size(&self, _item: &ItemPointer) -> StoreResult<usize> {
        Ok(8)
    }

    fn serialize(&self, item: &ItemPointer, out: &mut Vec<u8>) -> StoreResult<()> {
        out.extend_from_slice(&item.head.to_le_bytes());
        out.extend_from_slice(&item.size.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<ItemPointer> {
        if bytes.len() != 8 {
            return Err(StoreError::FormatViolation(format!(
                "item pointer is {} bytes",
                bytes.len()
            )));
        }
        Ok(ItemPointer {
            head: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

/// A list of variable-length records.
///
/// A pointer table stream maps each index to the head of the sector chain
/// holding the record. Removing a record returns its sectors to the
/// container's free set and leaves a vacant pointer, so indexes of other
/// records never move.
pub struct SectorMappedList<T, S, B> {
    container: SharedContainer<B>,
    table: StreamPagedList<ItemPointer, PointerSerializer, ClusteredStream<B>>,
    serializer: S,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S, B> SectorMappedList<T, S, B>
where
    S: ItemSerializer<T>,
    B: WritableBuffer,
{
    /// Open the list whose pointer table is stream `table_stream`.
    pub fn open(
        container: SharedContainer<B>,
        table_stream: usize,
        serializer: S,
        page_size: usize,
        max_memory: usize,
    ) -> StoreResult<Self> {
        let stream = ClusteredStream::new(container.clone(), table_stream)?;
        let table = StreamPagedList::open(stream, PointerSerializer, page_size, max_memory)?;
        Ok(Self {
            container,
            table,
            serializer,
            _marker: PhantomData,
        })
    }

    /// Number of indexes, vacant ones included.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn pointer(&mut self, index: usize) -> StoreResult<ItemPointer> {
        self.table.read(index)
    }

    pub fn is_live(&mut self, index: usize) -> StoreResult<bool> {
        if index >= self.len() {
            return Ok(false);
        }
        Ok(!self.pointer(index)?.is_vacant())
    }

    /// The record at `index`, or `None` if it was removed.
    pub fn read(&mut self, index: usize) -> StoreResult<Option<T>> {
        let ptr = self.pointer(index)?;
        if ptr.is_vacant() {
            return Ok(None);
        }
        let bytes = self
            .container
            .lock()
            .sectors_mut()
            .read_chain(ptr.head, ptr.size as u64)?;
        Ok(Some(self.serializer.deserialize(&bytes)?))
    }

    /// Append a record and return its index.
    pub fn insert(&mut self, item: &T) -> StoreResult<usize> {
        let bytes = self.encode(item)?;
        let head = self.container.lock().sectors_mut().write_chain(&bytes)?;
        let range = self.table.append([ItemPointer {
            head,
            size: bytes.len() as u32,
        }])?;
        trace!(index = range.start, size = bytes.len(), "inserted record");
        Ok(range.start)
    }

    /// Store `item` at `index`, replacing a live record, filling a vacant
    /// one, or appending when `index == len()`.
    pub fn write(&mut self, index: usize, item: &T) -> StoreResult<()> {
        if index == self.len() {
            self.insert(item)?;
            return Ok(());
        }
        let ptr = self.pointer(index)?;
        let bytes = self.encode(item)?;
        let head = {
            let mut container = self.container.lock();
            let sectors = container.sectors_mut();
            if ptr.is_vacant() {
                sectors.write_chain(&bytes)?
            } else {
                sectors.rewrite_chain(ptr.head, ptr.size as u64, &bytes)?
            }
        };
        self.table.update(
            index,
            [ItemPointer {
                head,
                size: bytes.len() as u32,
            }],
        )
    }

    /// Replace the live record at `index`.
    pub fn update(&mut self, index: usize, item: &T) -> StoreResult<()> {
        if !self.is_live(index)? {
            return Err(StoreError::ObjectNotFound(index as u64));
        }
        self.write(index, item)
    }

    /// Remove the record at `index`, freeing its sectors. Returns `false`
    /// if it was already vacant.
    pub fn remove(&mut self, index: usize) -> StoreResult<bool> {
        let ptr = self.pointer(index)?;
        if ptr.is_vacant() {
            return Ok(false);
        }
        if ptr.head != END_OF_CHAIN {
            self.container
                .lock()
                .sectors_mut()
                .free_chain(ptr.head, ptr.size as u64)?;
        }
        self.table.update(index, [ItemPointer::VACANT])?;
        trace!(index, "removed record");
        Ok(true)
    }

    pub fn flush(&mut self) -> StoreResult<()> {
        self.table.flush()
    }

    /// Forget cached pointers, e.g. after a rollback below.
    pub fn discard_cache(&mut self) -> StoreResult<()> {
        self.table.discard_cache()
    }

    fn encode(&self, item: &T) -> StoreResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.serializer.calculate_size(item)?);
        self.serializer.serialize(item, &mut bytes)?;
        if u32::try_from(bytes.len()).is_err() {
            return Err(StoreError::range("record byte", bytes.len() as u64, u32::MAX as u64));
        }
        Ok(bytes)
    }
}
