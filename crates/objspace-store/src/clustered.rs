//! Logical byte streams realised as sector chains.
//!
//! A [`StreamContainer`] multiplexes any number of growable streams over
//! one [`SectorStore`]. Stream 0 is the directory: a chain headed by
//! sector 0 holding one 16-byte entry per stream
//! (`head i32 | length u64 | capacity u32`, little-endian). Entry 0 is
//! reserved; the directory's own length and sector count live in the
//! sector header.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::{check_range, check_write, ReadableBuffer, WritableBuffer};
use crate::config::ContainerPolicy;
use crate::error::{StoreError, StoreResult};
use crate::sector::{SectorStore, END_OF_CHAIN};

/// Stream id of the directory.
pub const DIRECTORY_STREAM: usize = 0;

const ENTRY_SIZE: u64 = 16;

/// Location and size of one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub head: i32,
    pub length: u64,
    /// Sectors reserved for the stream, at least enough for `length`.
    pub capacity: u32,
}

impl StreamInfo {
    const EMPTY: Self = Self {
        head: END_OF_CHAIN,
        length: 0,
        capacity: 0,
    };

    fn encode(&self) -> [u8; ENTRY_SIZE as usize] {
        let mut raw = [0u8; ENTRY_SIZE as usize];
        raw[0..4].copy_from_slice(&self.head.to_le_bytes());
        raw[4..12].copy_from_slice(&self.length.to_le_bytes());
        raw[12..16].copy_from_slice(&self.capacity.to_le_bytes());
        raw
    }

    fn decode(raw: &[u8]) -> Self {
        let mut len8 = [0u8; 8];
        len8.copy_from_slice(&raw[4..12]);
        Self {
            head: i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            length: u64::from_le_bytes(len8),
            capacity: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }
}

/// Allocation figures reported by [`StreamContainer::stats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerStats {
    pub sector_size: usize,
    pub sectors: u64,
    pub free_sectors: usize,
    /// `(length, capacity in sectors)` per stream, directory first.
    pub streams: Vec<(u64, u32)>,
}

/// Growable streams multiplexed over one sector store.
pub struct StreamContainer<B> {
    sectors: SectorStore<B>,
    policy: ContainerPolicy,
    streams: Vec<StreamInfo>,
    chains: Vec<Vec<i32>>,
}

/// A container shared between the handles of its streams.
pub type SharedContainer<B> = Arc<Mutex<StreamContainer<B>>>;

impl<B: WritableBuffer> StreamContainer<B> {
    /// Open the container in `buffer`, formatting an empty buffer.
    pub fn open(buffer: B, sector_size: usize, policy: ContainerPolicy) -> StoreResult<Self> {
        let fresh = buffer.is_empty();
        let sectors = SectorStore::open(buffer, sector_size)?;
        let mut container = Self {
            sectors,
            policy,
            streams: Vec::new(),
            chains: Vec::new(),
        };
        if fresh {
            container.format()?;
        } else {
            container.load_directory()?;
        }
        Ok(container)
    }

    fn format(&mut self) -> StoreResult<()> {
        let first = self.sectors.allocate(1)?;
        if first != [0] {
            return Err(StoreError::IntegrityViolation(
                "directory must start at sector 0".into(),
            ));
        }
        self.streams = vec![StreamInfo {
            head: 0,
            length: 0,
            capacity: 1,
        }];
        self.chains = vec![first];
        self.sectors.set_directory(0, 1)?;
        // Reserve entry 0 so stream ids match entry positions.
        self.write(DIRECTORY_STREAM, 0, &[0u8; ENTRY_SIZE as usize])?;
        debug!(sector_size = self.sectors.sector_size(), "formatted stream container");
        Ok(())
    }

    fn load_directory(&mut self) -> StoreResult<()> {
        let directory = StreamInfo {
            head: 0,
            length: self.sectors.directory_len(),
            capacity: self.sectors.directory_sectors(),
        };
        let chain = self.sectors.follow(directory.head, directory.capacity as usize)?;
        if directory.length > chain.len() as u64 * self.sectors.sector_size() as u64
            || directory.length % ENTRY_SIZE != 0
        {
            return Err(StoreError::FormatViolation(format!(
                "directory length {} does not fit its {} sectors",
                directory.length, directory.capacity
            )));
        }
        self.streams = vec![directory];
        self.chains = vec![chain];

        let count = (directory.length / ENTRY_SIZE) as usize;
        for id in 1..count {
            let mut raw = [0u8; ENTRY_SIZE as usize];
            self.read(DIRECTORY_STREAM, id as u64 * ENTRY_SIZE, &mut raw)?;
            let info = StreamInfo::decode(&raw);
            let chain = self.sectors.follow(info.head, info.capacity as usize)?;
            if info.length > info.capacity as u64 * self.sectors.sector_size() as u64 {
                return Err(StoreError::IntegrityViolation(format!(
                    "stream {id} is {} bytes but holds {} sectors",
                    info.length, info.capacity
                )));
            }
            self.streams.push(info);
            self.chains.push(chain);
        }
        debug!(streams = self.streams.len(), "loaded stream directory");
        Ok(())
    }

    /// Re-read everything from the buffer, e.g. after the buffer below was
    /// rolled back.
    pub fn reload(&mut self) -> StoreResult<()> {
        self.sectors.reload()?;
        self.load_directory()
    }

    pub fn policy(&self) -> ContainerPolicy {
        self.policy
    }

    pub fn sector_size(&self) -> usize {
        self.sectors.sector_size()
    }

    /// Streams including the directory.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_info(&self, id: usize) -> StoreResult<StreamInfo> {
        self.streams
            .get(id)
            .copied()
            .ok_or_else(|| StoreError::range("stream", id as u64, self.streams.len() as u64))
    }

    pub fn stream_len(&self, id: usize) -> StoreResult<u64> {
        Ok(self.stream_info(id)?.length)
    }

    pub fn sectors(&self) -> &SectorStore<B> {
        &self.sectors
    }

    /// Sector-level access for records chained outside the streams.
    pub fn sectors_mut(&mut self) -> &mut SectorStore<B> {
        &mut self.sectors
    }

    pub fn buffer(&self) -> &B {
        self.sectors.buffer()
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        self.sectors.buffer_mut()
    }

    pub fn into_inner(self) -> B {
        self.sectors.into_inner()
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            sector_size: self.sectors.sector_size(),
            sectors: self.sectors.sector_count(),
            free_sectors: self.sectors.free_count(),
            streams: self.streams.iter().map(|s| (s.length, s.capacity)).collect(),
        }
    }

    /// Create an empty stream and return its id.
    pub fn add_stream(&mut self) -> StoreResult<usize> {
        let id = self.streams.len();
        self.streams.push(StreamInfo::EMPTY);
        self.chains.push(Vec::new());
        self.persist_info(id)?;
        debug!(stream = id, "added stream");
        Ok(id)
    }

    /// Fill `buf` from stream `id` at `offset`.
    pub fn read(&mut self, id: usize, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        let info = self.stream_info(id)?;
        check_range(offset, buf.len(), info.length)?;
        let size = self.sectors.sector_size() as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let sector = self.chains[id][(pos / size) as usize];
            let at = (pos % size) as usize;
            let take = (size as usize - at).min(buf.len() - done);
            self.sectors.read_data(sector, at, &mut buf[done..done + take])?;
            done += take;
        }
        Ok(())
    }

    /// Write `data` into stream `id` at `offset`, growing it if needed.
    pub fn write(&mut self, id: usize, offset: u64, data: &[u8]) -> StoreResult<()> {
        let info = self.stream_info(id)?;
        check_write(offset, info.length)?;
        let end = offset + data.len() as u64;
        self.reserve(id, end)?;
        let size = self.sectors.sector_size() as u64;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let sector = self.chains[id][(pos / size) as usize];
            let at = (pos % size) as usize;
            let take = (size as usize - at).min(data.len() - done);
            self.sectors.write_data(sector, at, &data[done..done + take])?;
            done += take;
        }
        if end > info.length {
            self.streams[id].length = end;
            self.persist_info(id)?;
        }
        Ok(())
    }

    /// Truncate stream `id`, or zero-extend it, to `len` bytes.
    pub fn set_len(&mut self, id: usize, len: u64) -> StoreResult<()> {
        let info = self.stream_info(id)?;
        if len > info.length {
            // Bytes past the old end may be stale: zero them explicitly.
            let zeros = vec![0u8; (len - info.length) as usize];
            return self.write(id, info.length, &zeros);
        }
        if len == info.length {
            return Ok(());
        }
        let keep = self.policy.round_up(self.sectors.sectors_for(len));
        if keep < self.chains[id].len() {
            let surplus = self.chains[id].split_off(keep);
            match self.chains[id].last() {
                Some(last) => self.sectors.set_next(*last, END_OF_CHAIN)?,
                None => self.streams[id].head = END_OF_CHAIN,
            }
            self.sectors.release_all(&surplus)?;
            self.streams[id].capacity = keep as u32;
        }
        self.streams[id].length = len;
        self.persist_info(id)
    }

    /// Make sure stream `id` has sectors for `len` bytes.
    fn reserve(&mut self, id: usize, len: u64) -> StoreResult<()> {
        let needed = self.sectors.sectors_for(len);
        let have = self.chains[id].len();
        if needed <= have {
            return Ok(());
        }
        let target = self.policy.round_up(needed);
        let capacity = u32::try_from(target).map_err(|_| StoreError::FreeListExhausted)?;
        let fresh = self.sectors.allocate(target - have)?;
        for pair in fresh.windows(2) {
            self.sectors.set_next(pair[0], pair[1])?;
        }
        match self.chains[id].last() {
            Some(last) => self.sectors.set_next(*last, fresh[0])?,
            None => self.streams[id].head = fresh[0],
        }
        self.chains[id].extend(fresh);
        self.streams[id].capacity = capacity;
        self.persist_info(id)
    }

    fn persist_info(&mut self, id: usize) -> StoreResult<()> {
        let info = self.streams[id];
        if id == DIRECTORY_STREAM {
            return self.sectors.set_directory(info.length, info.capacity);
        }
        self.write(DIRECTORY_STREAM, id as u64 * ENTRY_SIZE, &info.encode())
    }

    /// Push buffered state to the buffer below.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.sectors.buffer_mut().flush()
    }
}

/// One stream of a shared container, usable wherever a byte buffer is.
///
/// Handles are cheap to clone; each operation takes the container lock
/// once.
pub struct ClusteredStream<B> {
    container: SharedContainer<B>,
    id: usize,
}

impl<B> Clone for ClusteredStream<B> {
    fn clone(&self) -> Self {
        Self {
            container: Arc::clone(&self.container),
            id: self.id,
        }
    }
}

impl<B: WritableBuffer> ClusteredStream<B> {
    /// Handle for existing stream `id`.
    pub fn new(container: SharedContainer<B>, id: usize) -> StoreResult<Self> {
        container.lock().stream_info(id)?;
        Ok(Self { container, id })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn container(&self) -> &SharedContainer<B> {
        &self.container
    }
}

impl<B: WritableBuffer> ReadableBuffer for ClusteredStream<B> {
    fn len(&self) -> u64 {
        self.container.lock().stream_len(self.id).unwrap_or(0)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.container.lock().read(self.id, offset, buf)
    }
}

impl<B: WritableBuffer> WritableBuffer for ClusteredStream<B> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.container.lock().write(self.id, offset, data)
    }

    fn set_len(&mut self, len: u64) -> StoreResult<()> {
        self.container.lock().set_len(self.id, len)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.container.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(policy: ContainerPolicy) -> StreamContainer<Vec<u8>> {
        StreamContainer::open(Vec::new(), 8, policy).unwrap()
    }

    #[test]
    fn streams_are_independent() {
        let mut c = container(ContainerPolicy::Shared);
        let a = c.add_stream().unwrap();
        let b = c.add_stream().unwrap();
        assert_eq!((a, b), (1, 2));

        c.write(a, 0, b"first stream, long enough to chain").unwrap();
        c.write(b, 0, b"second").unwrap();
        c.write(a, 34, b"!").unwrap();

        let mut out = vec![0u8; 35];
        c.read(a, 0, &mut out).unwrap();
        assert_eq!(&out, b"first stream, long enough to chain!");
        let mut out = vec![0u8; 6];
        c.read(b, 0, &mut out).unwrap();
        assert_eq!(&out, b"second");
        assert!(c.read(b, 4, &mut out).is_err());
    }

    #[test]
    fn reopen_restores_directory() {
        let mut c = container(ContainerPolicy::Shared);
        let a = c.add_stream().unwrap();
        c.write(a, 0, &[7u8; 50]).unwrap();
        let b = c.add_stream().unwrap();
        c.write(b, 0, &[9u8; 3]).unwrap();

        let mut c = StreamContainer::open(c.into_inner(), 8, ContainerPolicy::Shared).unwrap();
        assert_eq!(c.stream_count(), 3);
        assert_eq!(c.stream_len(a).unwrap(), 50);
        let mut out = vec![0u8; 50];
        c.read(a, 0, &mut out).unwrap();
        assert_eq!(out, vec![7u8; 50]);
        assert_eq!(c.stream_len(b).unwrap(), 3);
    }

    #[test]
    fn shrink_frees_sectors_and_regrow_zero_fills() {
        let mut c = container(ContainerPolicy::Shared);
        let a = c.add_stream().unwrap();
        c.write(a, 0, &[5u8; 40]).unwrap();
        let before = c.stats().free_sectors;
        c.set_len(a, 4).unwrap();
        assert_eq!(c.stats().free_sectors, before + 4);
        assert_eq!(c.stream_info(a).unwrap().capacity, 1);

        c.set_len(a, 12).unwrap();
        let mut out = vec![0u8; 12];
        c.read(a, 0, &mut out).unwrap();
        assert_eq!(&out[..4], &[5u8; 4]);
        assert_eq!(&out[4..], &[0u8; 8]);
    }

    #[test]
    fn extent_policy_reserves_whole_extents() {
        let mut c = container(ContainerPolicy::Extent { sectors: 4 });
        let a = c.add_stream().unwrap();
        c.write(a, 0, &[1u8; 9]).unwrap();
        assert_eq!(c.stream_info(a).unwrap().capacity, 4);
        c.write(a, 9, &[1u8; 30]).unwrap();
        assert_eq!(c.stream_info(a).unwrap().capacity, 8);
        c.set_len(a, 0).unwrap();
        assert_eq!(c.stream_info(a).unwrap().capacity, 0);
        assert_eq!(c.stream_info(a).unwrap().head, END_OF_CHAIN);
    }

    #[test]
    fn handles_share_the_container() {
        let shared: SharedContainer<Vec<u8>> = Arc::new(Mutex::new(container(ContainerPolicy::Shared)));
        let id = shared.lock().add_stream().unwrap();
        let mut one = ClusteredStream::new(Arc::clone(&shared), id).unwrap();
        let mut two = one.clone();
        one.write_at(0, b"hello").unwrap();
        assert_eq!(two.len(), 5);
        assert_eq!(two.read_vec(1, 3).unwrap(), b"ell");
        assert!(ClusteredStream::new(shared, 9).is_err());
    }

    #[test]
    fn write_past_end_is_range_violation() {
        let mut c = container(ContainerPolicy::Shared);
        let a = c.add_stream().unwrap();
        assert!(matches!(
            c.write(a, 3, b"x"),
            Err(StoreError::RangeViolation { .. })
        ));
    }
}
