use lru::LruCache;
use objspace_types::Digest;
use tracing::{debug, trace, warn};

use crate::buffer::{check_range, check_write, CheckpointBuffer, ReadableBuffer, WritableBuffer};
use crate::error::{StoreError, StoreResult};
use crate::header::{FileHeader, HEADER_REGION};
use crate::stream::Stream;

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Pages read from the stream.
    pub loads: u64,
    /// Pages dropped to stay within budget.
    pub evictions: u64,
    /// Dirty pages written back.
    pub writebacks: u64,
}

struct CachedPage {
    /// Valid bytes of the page; shorter than a page only at the end.
    data: Vec<u8>,
    dirty: bool,
}

/// Page cache over the content region of a stream.
///
/// Content byte `o` lives at stream offset `HEADER_REGION + o`. Pages are
/// loaded on first touch and evicted least-recently-used once the page
/// budget is reached; dirty pages are written back before they leave the
/// cache. The header is only rewritten by [`CheckpointBuffer::checkpoint`],
/// after all content is flushed.
pub struct PagedBuffer<S> {
    stream: S,
    header: FileHeader,
    page_size: usize,
    len: u64,
    /// Content bytes physically present in the stream.
    stored_len: u64,
    /// The stream holds bytes past `stored_len` left by an interrupted
    /// commit; they are cut off before the first write.
    stale_tail: bool,
    cache: LruCache<u64, CachedPage>,
    max_pages: usize,
    stats: CacheStats,
    sync_on_checkpoint: bool,
}

impl<S: Stream> PagedBuffer<S> {
    /// Initialise an empty stream with fresh headers.
    pub fn create(
        mut stream: S,
        page_size: usize,
        digest_size: usize,
        max_pages: usize,
    ) -> StoreResult<Self> {
        let page_size_u32 = u32::try_from(page_size)
            .map_err(|_| StoreError::InvalidConfig(format!("page size {page_size}")))?;
        let digest_size_u16 = u16::try_from(digest_size)
            .map_err(|_| StoreError::InvalidConfig(format!("digest size {digest_size}")))?;
        let header = FileHeader::new(page_size_u32, digest_size_u16);
        stream.set_length(HEADER_REGION)?;
        header.write_to(&mut stream)?;
        stream.sync()?;
        debug!(page_size, digest_size, "created storage file");
        Ok(Self::with_header(stream, header, max_pages, 0))
    }

    /// Open a stream with existing headers, checking they match the
    /// expected page and digest sizes.
    pub fn open(
        mut stream: S,
        page_size: usize,
        digest_size: usize,
        max_pages: usize,
    ) -> StoreResult<Self> {
        let header = FileHeader::read_from(&mut stream)?;
        if header.page_size as usize != page_size {
            return Err(StoreError::FormatViolation(format!(
                "file page size {} does not match configured {page_size}",
                header.page_size
            )));
        }
        if header.digest_size as usize != digest_size {
            return Err(StoreError::FormatViolation(format!(
                "file digest size {} does not match hasher output {digest_size}",
                header.digest_size
            )));
        }
        let physical = stream.length()?.saturating_sub(HEADER_REGION);
        if physical < header.content_length {
            // An interrupted commit can shrink the file before the header
            // catches up. Missing bytes read as zeros; the journal or the
            // root check decides whether that is acceptable.
            warn!(
                content_length = header.content_length,
                physical,
                "content region shorter than header length"
            );
        }
        debug!(
            content_length = header.content_length,
            commits = header.commit_count,
            "opened storage file"
        );
        Ok(Self::with_header(stream, header, max_pages, physical))
    }

    fn with_header(stream: S, header: FileHeader, max_pages: usize, physical: u64) -> Self {
        let len = header.content_length;
        Self {
            page_size: header.page_size as usize,
            stream,
            header,
            len,
            stored_len: physical.min(len),
            stale_tail: physical > len,
            cache: LruCache::unbounded(),
            max_pages: max_pages.max(1),
            stats: CacheStats::default(),
            sync_on_checkpoint: true,
        }
    }

    /// Skip fsync on checkpoint (tests and scratch data).
    pub fn set_sync_on_checkpoint(&mut self, sync: bool) {
        self.sync_on_checkpoint = sync;
    }

    /// The header as of the last checkpoint (or open).
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of pages currently resident.
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Give back the underlying stream, discarding unflushed pages.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn page_bounds(&self, page: u64) -> (u64, u64) {
        let start = page * self.page_size as u64;
        (start, (start + self.page_size as u64).min(self.len))
    }

    fn load(&mut self, page: u64) -> StoreResult<CachedPage> {
        let (start, end) = self.page_bounds(page);
        let mut data = vec![0u8; end.saturating_sub(start) as usize];
        let stored_end = end.min(self.stored_len);
        if stored_end > start {
            let n = (stored_end - start) as usize;
            self.stream
                .read_exact_at(HEADER_REGION + start, &mut data[..n])?;
        }
        self.stats.loads += 1;
        trace!(page, "loaded page");
        Ok(CachedPage { data, dirty: false })
    }

    fn drop_stale_tail(&mut self) -> StoreResult<()> {
        if self.stale_tail {
            self.stream.set_length(HEADER_REGION + self.stored_len)?;
            self.stale_tail = false;
            debug!(length = self.stored_len, "cut stale bytes past content length");
        }
        Ok(())
    }

    fn write_back(&mut self, page: u64, cached: &CachedPage) -> StoreResult<()> {
        self.drop_stale_tail()?;
        let start = page * self.page_size as u64;
        self.stream.write_all_at(HEADER_REGION + start, &cached.data)?;
        self.stored_len = self.stored_len.max(start + cached.data.len() as u64);
        self.stats.writebacks += 1;
        Ok(())
    }

    fn make_room(&mut self) -> StoreResult<()> {
        while self.cache.len() >= self.max_pages {
            let Some((page, cached)) = self.cache.pop_lru() else {
                break;
            };
            if cached.dirty {
                self.write_back(page, &cached)?;
            }
            self.stats.evictions += 1;
            trace!(page, dirty = cached.dirty, "evicted page");
        }
        Ok(())
    }

    fn page_mut(&mut self, page: u64) -> StoreResult<&mut CachedPage> {
        if !self.cache.contains(&page) {
            let loaded = self.load(page)?;
            self.make_room()?;
            self.cache.put(page, loaded);
        }
        self.cache
            .get_mut(&page)
            .ok_or_else(|| StoreError::IntegrityViolation(format!("page {page} left the cache")))
    }

    fn flush_pages(&mut self) -> StoreResult<()> {
        let mut dirty: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(page, _)| *page)
            .collect();
        dirty.sort_unstable();
        if !dirty.is_empty() {
            self.drop_stale_tail()?;
        }
        for page in dirty {
            if let Some(cached) = self.cache.peek_mut(&page) {
                cached.dirty = false;
                let start = page * self.page_size as u64;
                self.stream.write_all_at(HEADER_REGION + start, &cached.data)?;
                self.stored_len = self.stored_len.max(start + cached.data.len() as u64);
                self.stats.writebacks += 1;
            }
        }
        if self.stored_len != self.len {
            self.stream.set_length(HEADER_REGION + self.len)?;
            self.stored_len = self.len;
        }
        Ok(())
    }
}

impl<S: Stream> ReadableBuffer for PagedBuffer<S> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        check_range(offset, buf.len(), self.len)?;
        let page_size = self.page_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = pos / page_size;
            let in_page = (pos % page_size) as usize;
            let cached = self.page_mut(page)?;
            let n = (cached.data.len() - in_page).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&cached.data[in_page..in_page + n]);
            done += n;
        }
        Ok(())
    }
}

impl<S: Stream> WritableBuffer for PagedBuffer<S> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        check_write(offset, self.len)?;
        let page_size = self.page_size as u64;
        let end = offset + data.len() as u64;
        if end > self.len {
            // Grow the resident tail page before touching it so its
            // loaded length covers the new bytes.
            self.len = end;
        }
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let page = pos / page_size;
            let in_page = (pos % page_size) as usize;
            let page_end = ((page + 1) * page_size).min(self.len);
            let valid = (page_end - page * page_size) as usize;
            let cached = self.page_mut(page)?;
            if cached.data.len() < valid {
                cached.data.resize(valid, 0);
            }
            let n = (page_size as usize - in_page).min(data.len() - done);
            cached.data[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            cached.dirty = true;
            done += n;
        }
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> StoreResult<()> {
        if len < self.len {
            let page_size = self.page_size as u64;
            let first_dropped = len.div_ceil(page_size);
            let dropped: Vec<u64> = self
                .cache
                .iter()
                .map(|(page, _)| *page)
                .filter(|page| *page >= first_dropped)
                .collect();
            for page in dropped {
                self.cache.pop(&page);
            }
            if len % page_size != 0 {
                if let Some(cached) = self.cache.peek_mut(&(len / page_size)) {
                    cached.data.truncate((len % page_size) as usize);
                }
            }
            if self.stored_len > len {
                self.stream.set_length(HEADER_REGION + len)?;
                self.stored_len = len;
            }
        } else if len > self.len {
            // Extend the resident tail page so its zeros become visible.
            let page_size = self.page_size as u64;
            if self.len % page_size != 0 {
                let page = self.len / page_size;
                let valid = (((page + 1) * page_size).min(len) - page * page_size) as usize;
                if let Some(cached) = self.cache.peek_mut(&page) {
                    cached.data.resize(valid, 0);
                    cached.dirty = true;
                }
            }
        }
        self.len = len;
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.flush_pages()
    }
}

impl<S: Stream> CheckpointBuffer for PagedBuffer<S> {
    fn checkpoint(&mut self, root: Option<&Digest>) -> StoreResult<()> {
        self.flush_pages()?;
        if self.sync_on_checkpoint {
            self.stream.sync()?;
        }
        let mut header = self.header.clone();
        header.content_length = self.len;
        header.commit_count += 1;
        if let Some(root) = root {
            header.root = root.clone();
        }
        header.write_to(&mut self.stream)?;
        if self.sync_on_checkpoint {
            self.stream.sync()?;
        }
        debug!(
            content_length = header.content_length,
            commits = header.commit_count,
            root = %header.root.short_hex(),
            "checkpoint written"
        );
        self.header = header;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn memory(page_size: usize, max_pages: usize) -> PagedBuffer<Cursor<Vec<u8>>> {
        PagedBuffer::create(Cursor::new(Vec::new()), page_size, 32, max_pages).unwrap()
    }

    #[test]
    fn write_read_across_pages() {
        let mut buf = memory(64, 4);
        let data: Vec<u8> = (0..200u8).collect();
        buf.write_at(0, &data).unwrap();
        assert_eq!(buf.len(), 200);
        assert_eq!(buf.read_vec(60, 10).unwrap(), data[60..70].to_vec());
        assert_eq!(buf.read_vec(0, 200).unwrap(), data);
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let mut buf = memory(64, 2);
        for page in 0..5u8 {
            buf.write_at(page as u64 * 64, &[page; 64]).unwrap();
        }
        assert!(buf.cached_pages() <= 2);
        assert!(buf.stats().evictions >= 3);
        // Page 0 was evicted and comes back from the stream.
        let loads_before = buf.stats().loads;
        assert_eq!(buf.read_vec(0, 64).unwrap(), vec![0u8; 64]);
        assert_eq!(buf.read_vec(64 * 4, 64).unwrap(), vec![4u8; 64]);
        assert!(buf.stats().loads > loads_before);
    }

    #[test]
    fn checkpoint_persists_length_and_root() {
        let mut buf = memory(64, 2);
        buf.write_at(0, &[7u8; 150]).unwrap();
        let root = Digest::from([3u8; 32]);
        buf.checkpoint(Some(&root)).unwrap();
        assert_eq!(buf.header().commit_count, 1);

        let stream = buf.into_inner();
        let mut reopened = PagedBuffer::open(stream, 64, 32, 2).unwrap();
        assert_eq!(reopened.len(), 150);
        assert_eq!(reopened.header().root, root);
        assert_eq!(reopened.read_vec(100, 50).unwrap(), vec![7u8; 50]);
    }

    #[test]
    fn truncate_then_extend_reads_zeros() {
        let mut buf = memory(64, 8);
        buf.write_at(0, &[9u8; 130]).unwrap();
        buf.flush().unwrap();
        buf.set_len(10).unwrap();
        buf.set_len(130).unwrap();
        let back = buf.read_vec(0, 130).unwrap();
        assert_eq!(&back[..10], &[9u8; 10]);
        assert!(back[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn extension_after_eviction_reads_zeros() {
        let mut buf = memory(64, 1);
        buf.write_at(0, &[1u8; 64]).unwrap();
        buf.write_at(64, &[2u8; 10]).unwrap();
        buf.set_len(100).unwrap();
        // Force the tail page out and back in.
        buf.read_vec(0, 1).unwrap();
        assert_eq!(buf.read_vec(64, 36).unwrap()[10..], [0u8; 26]);
    }

    #[test]
    fn bytes_past_content_length_never_resurface() {
        let mut buf = memory(64, 1);
        buf.write_at(0, &[1u8; 200]).unwrap();
        buf.checkpoint(None).unwrap();
        let mut stream = buf.into_inner();
        stream.get_mut().extend_from_slice(&[0xaa; 100]);

        let mut buf = PagedBuffer::open(stream, 64, 32, 1).unwrap();
        assert_eq!(buf.len(), 200);
        buf.set_len(300).unwrap();
        buf.write_at(256, &[5u8; 44]).unwrap();
        // Evict the tail page so its write-back moves past the old length.
        buf.read_vec(0, 1).unwrap();
        let gap = buf.read_vec(200, 56).unwrap();
        assert!(gap.iter().all(|b| *b == 0));
        assert_eq!(buf.read_vec(256, 44).unwrap(), vec![5u8; 44]);
    }

    #[test]
    fn mismatched_page_size_rejected() {
        let buf = memory(64, 2);
        let stream = buf.into_inner();
        let err = PagedBuffer::open(stream, 128, 32, 2).err().unwrap();
        assert!(matches!(err, StoreError::FormatViolation(_)));
    }

    #[test]
    fn gap_write_rejected() {
        let mut buf = memory(64, 2);
        assert!(matches!(
            buf.write_at(5, b"x"),
            Err(StoreError::RangeViolation { .. })
        ));
    }
}
