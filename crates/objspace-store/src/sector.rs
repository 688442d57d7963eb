//! Fixed-size sectors linked into chains.
//!
//! Content layout of a sector store (little-endian):
//! ```text
//! [0..32)  header: magic "OSSECTOR", version u16, sector size u32,
//!          directory length u64, directory sector count u32, zero padding
//! [32..)   sector i at 32 + i * (sector_size + 8):
//!          number i32 | data [sector_size] | next i32
//! ```
//! `next == -1` ends a chain, `next == -2` marks a free sector.

use tracing::debug;

use crate::buffer::WritableBuffer;
use crate::error::{StoreError, StoreResult};
use crate::free_index::FreeIndexStore;

/// `next` value terminating a chain.
pub const END_OF_CHAIN: i32 = -1;

/// `next` value marking a sector as free.
pub const FREE_SECTOR: i32 = -2;

/// Bytes reserved for the sector store header.
pub const SECTOR_HEADER_SIZE: u64 = 32;

const SECTOR_MAGIC: &[u8; 8] = b"OSSECTOR";
const SECTOR_VERSION: u16 = 1;

/// One sector as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sector {
    pub number: i32,
    pub data: Vec<u8>,
    pub next: i32,
}

impl Sector {
    /// A free sector with zeroed data.
    pub fn free(number: i32, sector_size: usize) -> Self {
        Self {
            number,
            data: vec![0; sector_size],
            next: FREE_SECTOR,
        }
    }

    pub fn is_free(&self) -> bool {
        self.next == FREE_SECTOR
    }

    /// `number | data | next`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 8);
        out.extend_from_slice(&self.number.to_le_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.next.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8], sector_size: usize) -> StoreResult<Self> {
        if bytes.len() != sector_size + 8 {
            return Err(StoreError::FormatViolation(format!(
                "sector record is {} bytes, expected {}",
                bytes.len(),
                sector_size + 8
            )));
        }
        let number = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let tail = &bytes[4 + sector_size..];
        let next = i32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        Ok(Self {
            number,
            data: bytes[4..4 + sector_size].to_vec(),
            next,
        })
    }
}

/// Sector allocator over a byte buffer.
///
/// Free sectors are reused lowest number first; when none are free the
/// store appends new sectors at the end. The free set is rebuilt at open
/// by scanning for free markers.
pub struct SectorStore<B> {
    buffer: B,
    sector_size: usize,
    sector_count: u64,
    free: FreeIndexStore,
    directory_len: u64,
    directory_sectors: u32,
}

impl<B: WritableBuffer> SectorStore<B> {
    /// Open the store in `buffer`, formatting an empty buffer with
    /// `sector_size`-byte sectors.
    pub fn open(buffer: B, sector_size: usize) -> StoreResult<Self> {
        if sector_size == 0 || u32::try_from(sector_size).is_err() {
            return Err(StoreError::InvalidConfig(format!(
                "sector size {sector_size}"
            )));
        }
        let mut store = Self {
            buffer,
            sector_size,
            sector_count: 0,
            free: FreeIndexStore::new(),
            directory_len: 0,
            directory_sectors: 0,
        };
        if store.buffer.is_empty() {
            store.write_header()?;
            debug!(sector_size, "formatted sector store");
        } else {
            store.reload()?;
        }
        Ok(store)
    }

    /// Re-read the header and rebuild the free set from the buffer.
    pub fn reload(&mut self) -> StoreResult<()> {
        let raw = self.buffer.read_vec(0, SECTOR_HEADER_SIZE as usize).map_err(|_| {
            StoreError::FormatViolation("buffer too short for a sector header".into())
        })?;
        if &raw[0..8] != SECTOR_MAGIC {
            return Err(StoreError::FormatViolation("missing OSSECTOR magic".into()));
        }
        let version = u16::from_le_bytes([raw[8], raw[9]]);
        if version != SECTOR_VERSION {
            return Err(StoreError::FormatViolation(format!(
                "unsupported sector version {version}"
            )));
        }
        let stored_size = u32::from_le_bytes([raw[10], raw[11], raw[12], raw[13]]) as usize;
        if stored_size != self.sector_size {
            return Err(StoreError::FormatViolation(format!(
                "sector size {stored_size} on disk, {} configured",
                self.sector_size
            )));
        }
        let mut len8 = [0u8; 8];
        len8.copy_from_slice(&raw[14..22]);
        self.directory_len = u64::from_le_bytes(len8);
        self.directory_sectors = u32::from_le_bytes([raw[22], raw[23], raw[24], raw[25]]);

        let body = self.buffer.len() - SECTOR_HEADER_SIZE;
        if body % self.record_size() != 0 {
            return Err(StoreError::FormatViolation(format!(
                "sector area of {body} bytes is not a whole number of {}-byte sectors",
                self.record_size()
            )));
        }
        self.sector_count = body / self.record_size();
        self.free.clear();
        for n in 0..self.sector_count {
            let offset = self.offset(n as i32);
            let mut raw = [0u8; 4];
            self.buffer.read_at(offset, &mut raw)?;
            let number = i32::from_le_bytes(raw);
            if number as u64 != n {
                return Err(StoreError::IntegrityViolation(format!(
                    "sector {n} is labelled {number}"
                )));
            }
            if self.read_next(n as i32)? == FREE_SECTOR {
                self.free.release(n);
            }
        }
        debug!(
            sectors = self.sector_count,
            free = self.free.len(),
            "opened sector store"
        );
        Ok(())
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// On-disk bytes per sector.
    pub fn record_size(&self) -> u64 {
        self.sector_size as u64 + 8
    }

    /// Sectors in the store, free ones included.
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Sectors needed for `len` bytes.
    pub fn sectors_for(&self, len: u64) -> usize {
        len.div_ceil(self.sector_size as u64) as usize
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub fn into_inner(self) -> B {
        self.buffer
    }

    pub fn directory_len(&self) -> u64 {
        self.directory_len
    }

    pub fn directory_sectors(&self) -> u32 {
        self.directory_sectors
    }

    /// Record the directory stream's length and sector count in the header.
    pub fn set_directory(&mut self, len: u64, sectors: u32) -> StoreResult<()> {
        self.directory_len = len;
        self.directory_sectors = sectors;
        self.write_header()
    }

    fn write_header(&mut self) -> StoreResult<()> {
        let mut raw = [0u8; SECTOR_HEADER_SIZE as usize];
        raw[0..8].copy_from_slice(SECTOR_MAGIC);
        raw[8..10].copy_from_slice(&SECTOR_VERSION.to_le_bytes());
        raw[10..14].copy_from_slice(&(self.sector_size as u32).to_le_bytes());
        raw[14..22].copy_from_slice(&self.directory_len.to_le_bytes());
        raw[22..26].copy_from_slice(&self.directory_sectors.to_le_bytes());
        self.buffer.write_at(0, &raw)
    }

    fn offset(&self, number: i32) -> u64 {
        SECTOR_HEADER_SIZE + number as u64 * self.record_size()
    }

    fn check_number(&self, number: i32) -> StoreResult<()> {
        if number < 0 || number as u64 >= self.sector_count {
            return Err(StoreError::IntegrityViolation(format!(
                "dangling link to sector {number} ({} sectors)",
                self.sector_count
            )));
        }
        Ok(())
    }

    pub fn read_sector(&mut self, number: i32) -> StoreResult<Sector> {
        self.check_number(number)?;
        let bytes = self
            .buffer
            .read_vec(self.offset(number), self.record_size() as usize)?;
        let sector = Sector::decode(&bytes, self.sector_size)?;
        if sector.number != number {
            return Err(StoreError::IntegrityViolation(format!(
                "sector {number} is labelled {}",
                sector.number
            )));
        }
        Ok(sector)
    }

    pub fn write_sector(&mut self, sector: &Sector) -> StoreResult<()> {
        self.check_number(sector.number)?;
        if sector.data.len() != self.sector_size {
            return Err(StoreError::SchemaViolation(format!(
                "sector payload is {} bytes, sectors hold {}",
                sector.data.len(),
                self.sector_size
            )));
        }
        self.buffer.write_at(self.offset(sector.number), &sector.encode())
    }

    /// Next link of `number`.
    pub fn read_next(&mut self, number: i32) -> StoreResult<i32> {
        let mut raw = [0u8; 4];
        let offset = self.offset(number) + 4 + self.sector_size as u64;
        self.buffer.read_at(offset, &mut raw)?;
        Ok(i32::from_le_bytes(raw))
    }

    /// Rewrite only the next link of `number`.
    pub fn set_next(&mut self, number: i32, next: i32) -> StoreResult<()> {
        self.check_number(number)?;
        let offset = self.offset(number) + 4 + self.sector_size as u64;
        self.buffer.write_at(offset, &next.to_le_bytes())
    }

    /// Read part of a sector's data.
    pub fn read_data(&mut self, number: i32, at: usize, buf: &mut [u8]) -> StoreResult<()> {
        self.check_number(number)?;
        if at + buf.len() > self.sector_size {
            return Err(StoreError::range("sector byte", (at + buf.len()) as u64, self.sector_size as u64));
        }
        self.buffer.read_at(self.offset(number) + 4 + at as u64, buf)
    }

    /// Overwrite part of a sector's data.
    pub fn write_data(&mut self, number: i32, at: usize, data: &[u8]) -> StoreResult<()> {
        self.check_number(number)?;
        if at + data.len() > self.sector_size {
            return Err(StoreError::range("sector byte", (at + data.len()) as u64, self.sector_size as u64));
        }
        self.buffer.write_at(self.offset(number) + 4 + at as u64, data)
    }

    /// Take `count` sectors: free ones lowest first, then new ones at the
    /// end. Every returned sector is marked as the end of a chain.
    pub fn allocate(&mut self, count: usize) -> StoreResult<Vec<i32>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match self.free.claim() {
                Some(n) => {
                    let n = n as i32;
                    self.set_next(n, END_OF_CHAIN)?;
                    out.push(n);
                }
                None => break,
            }
        }
        while out.len() < count {
            if self.sector_count >= i32::MAX as u64 {
                for n in &out {
                    self.release(*n)?;
                }
                return Err(StoreError::FreeListExhausted);
            }
            let n = self.sector_count as i32;
            self.sector_count += 1;
            let sector = Sector {
                number: n,
                data: vec![0; self.sector_size],
                next: END_OF_CHAIN,
            };
            self.buffer.write_at(self.offset(n), &sector.encode())?;
            out.push(n);
        }
        Ok(out)
    }

    /// Return sectors to the free set, zeroing their data.
    pub fn release_all(&mut self, sectors: &[i32]) -> StoreResult<()> {
        for n in sectors {
            self.release(*n)?;
        }
        Ok(())
    }

    fn release(&mut self, number: i32) -> StoreResult<()> {
        self.write_sector(&Sector::free(number, self.sector_size))?;
        self.free.release(number as u64);
        Ok(())
    }

    /// Follow a chain of exactly `expected` sectors from `head`.
    ///
    /// Fails on early termination, extra links, links to free sectors,
    /// dangling numbers and cycles.
    pub fn follow(&mut self, head: i32, expected: usize) -> StoreResult<Vec<i32>> {
        if expected as u64 > self.sector_count {
            return Err(StoreError::IntegrityViolation(format!(
                "chain from sector {head} claims {expected} sectors, store holds {}",
                self.sector_count
            )));
        }
        let mut out = Vec::with_capacity(expected);
        let mut current = head;
        while out.len() < expected {
            if current == END_OF_CHAIN {
                return Err(StoreError::IntegrityViolation(format!(
                    "chain from sector {head} ends after {} of {expected} sectors",
                    out.len()
                )));
            }
            if current == FREE_SECTOR {
                return Err(StoreError::IntegrityViolation(format!(
                    "chain from sector {head} links into the free set"
                )));
            }
            self.check_number(current)?;
            let next = self.read_next(current)?;
            if next == FREE_SECTOR {
                return Err(StoreError::IntegrityViolation(format!(
                    "sector {current} in chain from {head} is marked free"
                )));
            }
            out.push(current);
            current = next;
        }
        if current != END_OF_CHAIN {
            return Err(StoreError::IntegrityViolation(format!(
                "chain from sector {head} continues past {expected} sectors"
            )));
        }
        Ok(out)
    }

    /// Sector numbers of the chain holding `len` bytes from `head`.
    pub fn chain(&mut self, head: i32, len: u64) -> StoreResult<Vec<i32>> {
        let expected = self.sectors_for(len);
        self.follow(head, expected)
    }

    /// Store `payload` in a new chain and return its head
    /// ([`END_OF_CHAIN`] for an empty payload).
    pub fn write_chain(&mut self, payload: &[u8]) -> StoreResult<i32> {
        let sectors = self.allocate(self.sectors_for(payload.len() as u64))?;
        self.fill_chain(&sectors, payload)
    }

    /// Replace the content of a chain, reusing its sectors, growing it from
    /// the allocator or freeing its surplus tail. Returns the (possibly new)
    /// head.
    pub fn rewrite_chain(&mut self, head: i32, old_len: u64, payload: &[u8]) -> StoreResult<i32> {
        let old = self.chain(head, old_len)?;
        let needed = self.sectors_for(payload.len() as u64);
        let mut sectors: Vec<i32> = old.iter().copied().take(needed).collect();
        if needed > old.len() {
            sectors.extend(self.allocate(needed - old.len())?);
        } else {
            self.release_all(&old[needed..])?;
        }
        self.fill_chain(&sectors, payload)
    }

    /// Read the `len` bytes stored in the chain from `head`.
    pub fn read_chain(&mut self, head: i32, len: u64) -> StoreResult<Vec<u8>> {
        let sectors = self.chain(head, len)?;
        let mut out = vec![0u8; len as usize];
        for (i, n) in sectors.iter().enumerate() {
            let start = i * self.sector_size;
            let end = (start + self.sector_size).min(out.len());
            self.read_data(*n, 0, &mut out[start..end])?;
        }
        Ok(out)
    }

    /// Free every sector of the chain holding `len` bytes from `head`.
    pub fn free_chain(&mut self, head: i32, len: u64) -> StoreResult<()> {
        let sectors = self.chain(head, len)?;
        self.release_all(&sectors)
    }

    fn fill_chain(&mut self, sectors: &[i32], payload: &[u8]) -> StoreResult<i32> {
        for (i, n) in sectors.iter().enumerate() {
            let start = i * self.sector_size;
            let end = (start + self.sector_size).min(payload.len());
            let mut data = payload[start..end].to_vec();
            data.resize(self.sector_size, 0);
            let next = sectors.get(i + 1).copied().unwrap_or(END_OF_CHAIN);
            self.write_sector(&Sector {
                number: *n,
                data,
                next,
            })?;
        }
        Ok(sectors.first().copied().unwrap_or(END_OF_CHAIN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(sector_size: usize) -> SectorStore<Vec<u8>> {
        SectorStore::open(Vec::new(), sector_size).unwrap()
    }

    #[test]
    fn wire_format() {
        let sector = Sector {
            number: 3,
            data: vec![0xaa, 0xbb],
            next: END_OF_CHAIN,
        };
        let bytes = sector.encode();
        assert_eq!(bytes, [3, 0, 0, 0, 0xaa, 0xbb, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Sector::decode(&bytes, 2).unwrap(), sector);
        assert!(Sector::decode(&bytes, 3).is_err());
    }

    #[test]
    fn chain_length_matches_payload() {
        let mut s = store(16);
        let head = s.write_chain(&[1u8; 40]).unwrap();
        assert_eq!(s.chain(head, 40).unwrap().len(), 3);
        assert_eq!(s.read_chain(head, 40).unwrap(), vec![1u8; 40]);

        let head = s.write_chain(&[2u8; 16]).unwrap();
        assert_eq!(s.chain(head, 16).unwrap().len(), 1);

        assert_eq!(s.write_chain(&[]).unwrap(), END_OF_CHAIN);
        assert!(s.chain(END_OF_CHAIN, 0).unwrap().is_empty());
    }

    #[test]
    fn freed_sectors_are_reused_lowest_first() {
        let mut s = store(8);
        let heads: Vec<i32> = (0..8).map(|_| s.write_chain(&[9u8; 8]).unwrap()).collect();
        assert_eq!(heads, (0..8).collect::<Vec<_>>());

        for n in [7, 5, 6] {
            s.free_chain(n, 8).unwrap();
        }
        assert_eq!(s.free_count(), 3);
        let head = s.write_chain(&[1u8; 16]).unwrap();
        assert_eq!(s.chain(head, 16).unwrap(), vec![5, 6]);
        assert_eq!(s.free_count(), 1);
    }

    #[test]
    fn free_set_is_rebuilt_at_open() {
        let mut s = store(8);
        let a = s.write_chain(&[1u8; 24]).unwrap();
        let _b = s.write_chain(&[2u8; 8]).unwrap();
        s.free_chain(a, 24).unwrap();

        let buffer = s.into_inner();
        let mut s = SectorStore::open(buffer, 8).unwrap();
        assert_eq!(s.sector_count(), 4);
        assert_eq!(s.free_count(), 3);
        assert_eq!(s.allocate(1).unwrap(), vec![0]);
    }

    #[test]
    fn rewrite_grows_and_shrinks() {
        let mut s = store(4);
        let head = s.write_chain(b"abcdefgh").unwrap();
        let head = s.rewrite_chain(head, 8, b"0123456789").unwrap();
        assert_eq!(s.read_chain(head, 10).unwrap(), b"0123456789");
        assert_eq!(s.sector_count(), 3);

        let head = s.rewrite_chain(head, 10, b"xy").unwrap();
        assert_eq!(s.read_chain(head, 2).unwrap(), b"xy");
        assert_eq!(s.free_count(), 2);

        let head = s.rewrite_chain(head, 2, b"").unwrap();
        assert_eq!(head, END_OF_CHAIN);
        assert_eq!(s.free_count(), 3);
    }

    #[test]
    fn oversized_chain_claim_is_integrity_violation() {
        let mut s = store(8);
        let head = s.write_chain(&[3u8; 16]).unwrap();
        let err = s.follow(head, u32::MAX as usize).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityViolation(_)));
        assert_eq!(s.follow(head, 2).unwrap().len(), 2);
    }

    #[test]
    fn cycle_is_integrity_violation() {
        let mut s = store(4);
        let head = s.write_chain(&[0u8; 12]).unwrap();
        let chain = s.chain(head, 12).unwrap();
        s.set_next(chain[2], chain[0]).unwrap();
        let err = s.chain(head, 12).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityViolation(_)));
        // Asking for more than the chain holds also fails.
        s.set_next(chain[2], END_OF_CHAIN).unwrap();
        assert!(s.chain(head, 16).is_err());
    }

    #[test]
    fn dangling_and_free_links_are_integrity_violations() {
        let mut s = store(4);
        let a = s.write_chain(&[0u8; 8]).unwrap();
        let b = s.write_chain(&[0u8; 4]).unwrap();
        s.set_next(a + 1, 99).unwrap();
        assert!(matches!(s.chain(a, 12), Err(StoreError::IntegrityViolation(_))));

        s.free_chain(b, 4).unwrap();
        s.set_next(a + 1, b).unwrap();
        assert!(matches!(s.chain(a, 12), Err(StoreError::IntegrityViolation(_))));
    }

    #[test]
    fn wrong_sector_size_is_format_violation() {
        let s = store(8);
        let buffer = s.into_inner();
        assert!(matches!(
            SectorStore::open(buffer, 16).err().unwrap(),
            StoreError::FormatViolation(_)
        ));
    }

    #[test]
    fn mislabelled_sector_detected() {
        let mut s = store(4);
        s.write_chain(&[1u8; 8]).unwrap();
        let mut buffer = s.into_inner();
        buffer.write_at(SECTOR_HEADER_SIZE + 12, &7i32.to_le_bytes()).unwrap();
        assert!(matches!(
            SectorStore::open(buffer, 4).err().unwrap(),
            StoreError::IntegrityViolation(_)
        ));
    }
}
