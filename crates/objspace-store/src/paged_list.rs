use std::marker::PhantomData;
use std::ops::Range;

use lru::LruCache;
use tracing::trace;

use crate::buffer::WritableBuffer;
use crate::error::{StoreError, StoreResult};
use crate::serializer::ItemSerializer;

/// Bytes of the `u32` length prefix before each variable-size item.
pub const LENGTH_PREFIX: u64 = 4;

/// Largest block moved at once when the buffer tail shifts.
const SHIFT_CHUNK: u64 = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    Fixed { item_size: usize, per_page: usize },
    Variable,
}

/// Byte window of the buffer holding one page of items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PageSpan {
    first: usize,
    count: usize,
    start: u64,
    size: u64,
}

struct Page<T> {
    items: Vec<T>,
    dirty: bool,
    /// Bytes this page occupies in the buffer right now.
    persisted: u64,
}

/// Page cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListStats {
    pub page_loads: u64,
    pub evictions: u64,
}

/// A list of typed items stored back to back in a byte buffer.
///
/// Items are grouped into pages that are decoded on first access and kept
/// in an LRU cache bounded by a byte budget. Fixed-size items are packed;
/// variable-size items carry a little-endian `u32` length prefix and the
/// page table is rebuilt at open by walking the prefixes.
///
/// Only the last page may hold a size change that has not reached the
/// buffer yet. Any other page whose byte size changes is written through
/// at once and the rest of the buffer shifts by the difference.
pub struct StreamPagedList<T, S, B> {
    buffer: B,
    serializer: S,
    layout: Layout,
    page_size: usize,
    pages: Vec<PageSpan>,
    cache: LruCache<usize, Page<T>>,
    max_pages: usize,
    stats: ListStats,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S, B> StreamPagedList<T, S, B>
where
    T: Clone,
    S: ItemSerializer<T>,
    B: WritableBuffer,
{
    /// Open a list over `buffer`. `page_size` bounds the bytes per page and
    /// `max_memory` the bytes of decoded pages kept (at least one page).
    pub fn open(buffer: B, serializer: S, page_size: usize, max_memory: usize) -> StoreResult<Self> {
        let page_size = page_size.max(1);
        let layout = match serializer.fixed_size() {
            Some(0) => {
                return Err(StoreError::InvalidConfig(
                    "fixed-size items must have a non-zero size".into(),
                ))
            }
            Some(item_size) => Layout::Fixed {
                item_size,
                per_page: (page_size / item_size).max(1),
            },
            None => Layout::Variable,
        };
        let mut list = Self {
            buffer,
            serializer,
            layout,
            page_size,
            pages: Vec::new(),
            cache: LruCache::unbounded(),
            max_pages: (max_memory / page_size).max(1),
            stats: ListStats::default(),
            _marker: PhantomData,
        };
        list.rebuild_page_table()?;
        Ok(list)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.pages.last().map_or(0, |p| p.first + p.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pages in the page table.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Number of decoded pages held in memory.
    pub fn loaded_pages(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> ListStats {
        self.stats
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Direct access to the buffer. Call [`discard_cache`](Self::discard_cache)
    /// after changing its bytes behind the list.
    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    /// Flush pending pages and give back the buffer.
    pub fn into_inner(mut self) -> StoreResult<B> {
        self.flush()?;
        Ok(self.buffer)
    }

    /// Item at `index`.
    pub fn read(&mut self, index: usize) -> StoreResult<T> {
        let len = self.len();
        if index >= len {
            return Err(StoreError::range("item", index as u64, len as u64));
        }
        let k = self.page_of(index);
        let first = self.pages[k].first;
        let page = self.load(k)?;
        Ok(page.items[index - first].clone())
    }

    /// `count` items starting at `index`.
    pub fn read_range(&mut self, index: usize, count: usize) -> StoreResult<Vec<T>> {
        let len = self.len();
        let end = index.saturating_add(count);
        if end > len {
            return Err(StoreError::range("item", end as u64, len as u64));
        }
        let mut out = Vec::with_capacity(count);
        let mut i = index;
        while i < end {
            let k = self.page_of(i);
            let span = self.pages[k];
            let take = (span.first + span.count).min(end) - i;
            let page = self.load(k)?;
            let from = i - span.first;
            out.extend_from_slice(&page.items[from..from + take]);
            i += take;
        }
        Ok(out)
    }

    /// Append items, returning the index range they occupy.
    pub fn append(&mut self, items: impl IntoIterator<Item = T>) -> StoreResult<Range<usize>> {
        let start = self.len();
        for item in items {
            let size = Self::record_len(&self.serializer, self.layout, &item)?;
            let needs_page = match self.pages.last() {
                Some(span) => !self.fits(span, size),
                None => true,
            };
            if needs_page {
                self.open_page()?;
            }
            let k = self.pages.len() - 1;
            let page = self.load(k)?;
            page.items.push(item);
            page.dirty = true;
            let span = &mut self.pages[k];
            span.count += 1;
            span.size += size;
        }
        Ok(start..self.len())
    }

    /// Overwrite the items starting at `index`.
    pub fn update(&mut self, index: usize, items: impl IntoIterator<Item = T>) -> StoreResult<()> {
        let items: Vec<T> = items.into_iter().collect();
        let len = self.len();
        let end = index.saturating_add(items.len());
        if end > len {
            return Err(StoreError::range("item", end as u64, len as u64));
        }
        for (offset, item) in items.into_iter().enumerate() {
            let i = index + offset;
            let new_size = Self::record_len(&self.serializer, self.layout, &item)?;
            let k = self.page_of(i);
            let span = self.pages[k];
            self.load(k)?;
            let Some(page) = self.cache.get_mut(&k) else {
                return Err(lost_page(k));
            };
            let slot = &mut page.items[i - span.first];
            let old_size = Self::record_len(&self.serializer, self.layout, slot)?;
            *slot = item;
            page.dirty = true;
            if new_size == old_size {
                continue;
            }
            let delta = new_size as i64 - old_size as i64;
            self.pages[k].size = span.size.wrapping_add_signed(delta);
            if k + 1 < self.pages.len() {
                Self::persist(&mut self.buffer, &self.serializer, self.layout, self.pages[k], page)?;
                for later in &mut self.pages[k + 1..] {
                    later.start = later.start.wrapping_add_signed(delta);
                }
                trace!(page = k, delta, "shifted list tail");
            }
        }
        Ok(())
    }

    /// Remove the last `count` items.
    pub fn erase_from_end(&mut self, count: usize) -> StoreResult<()> {
        let len = self.len();
        if count > len {
            return Err(StoreError::range("erase count", count as u64, len as u64));
        }
        if count == 0 {
            return Ok(());
        }
        let new_len = len - count;
        if new_len == 0 {
            self.cache.clear();
            self.pages.clear();
            return self.buffer.set_len(0);
        }
        let k = self.page_of(new_len - 1);
        for dropped in k + 1..self.pages.len() {
            self.cache.pop(&dropped);
        }
        self.pages.truncate(k + 1);
        let span = self.pages[k];
        let keep = new_len - span.first;

        self.load(k)?;
        let Some(page) = self.cache.get_mut(&k) else {
            return Err(lost_page(k));
        };
        page.items.truncate(keep);
        let mut size = 0;
        for item in &page.items {
            size += Self::record_len(&self.serializer, self.layout, item)?;
        }
        self.pages[k].count = keep;
        self.pages[k].size = size;
        self.buffer.set_len(span.start)?;
        page.persisted = 0;
        Self::persist(&mut self.buffer, &self.serializer, self.layout, self.pages[k], page)
    }

    /// Write every dirty page to the buffer and flush it.
    pub fn flush(&mut self) -> StoreResult<()> {
        let mut dirty: Vec<usize> = self
            .cache
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(k, _)| *k)
            .collect();
        dirty.sort_unstable();
        for k in dirty {
            if let Some(page) = self.cache.peek_mut(&k) {
                Self::persist(&mut self.buffer, &self.serializer, self.layout, self.pages[k], page)?;
            }
        }
        self.buffer.flush()
    }

    /// Drop every cached page without writing it and re-read the page
    /// table from the buffer. Used after the buffer was rolled back.
    pub fn discard_cache(&mut self) -> StoreResult<()> {
        self.rebuild_page_table()
    }

    fn fits(&self, span: &PageSpan, size: u64) -> bool {
        match self.layout {
            Layout::Fixed { per_page, .. } => span.count < per_page,
            Layout::Variable => span.count == 0 || span.size + size <= self.page_size as u64,
        }
    }

    fn page_of(&self, index: usize) -> usize {
        self.pages.partition_point(|p| p.first <= index) - 1
    }

    /// Start a new, empty last page. The previous last page is written out
    /// first so only the new page can be out of step with the buffer.
    fn open_page(&mut self) -> StoreResult<()> {
        let (first, start) = match self.pages.last() {
            Some(span) => (span.first + span.count, span.start + span.size),
            None => (0, 0),
        };
        if let Some(last) = self.pages.len().checked_sub(1) {
            let span = self.pages[last];
            if let Some(page) = self.cache.peek_mut(&last) {
                if page.dirty || page.persisted != span.size {
                    Self::persist(&mut self.buffer, &self.serializer, self.layout, span, page)?;
                }
            }
        }
        self.pages.push(PageSpan {
            first,
            count: 0,
            start,
            size: 0,
        });
        self.make_room()?;
        self.cache.put(
            self.pages.len() - 1,
            Page {
                items: Vec::new(),
                dirty: true,
                persisted: 0,
            },
        );
        Ok(())
    }

    fn load(&mut self, k: usize) -> StoreResult<&mut Page<T>> {
        if !self.cache.contains(&k) {
            let span = self.pages[k];
            let bytes = self.buffer.read_vec(span.start, span.size as usize)?;
            let items = self.decode(&bytes, span.count)?;
            self.make_room()?;
            self.cache.put(
                k,
                Page {
                    items,
                    dirty: false,
                    persisted: span.size,
                },
            );
            self.stats.page_loads += 1;
            trace!(page = k, items = span.count, "loaded list page");
        }
        self.cache.get_mut(&k).ok_or_else(|| lost_page(k))
    }

    fn make_room(&mut self) -> StoreResult<()> {
        while self.cache.len() >= self.max_pages {
            let Some((k, mut page)) = self.cache.pop_lru() else {
                break;
            };
            if page.dirty {
                Self::persist(&mut self.buffer, &self.serializer, self.layout, self.pages[k], &mut page)?;
            }
            self.stats.evictions += 1;
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8], count: usize) -> StoreResult<Vec<T>> {
        let mut items = Vec::with_capacity(count);
        match self.layout {
            Layout::Fixed { item_size, .. } => {
                for chunk in bytes.chunks_exact(item_size) {
                    items.push(self.serializer.deserialize(chunk)?);
                }
            }
            Layout::Variable => {
                let mut pos = 0usize;
                while pos < bytes.len() {
                    let prefix = bytes
                        .get(pos..pos + LENGTH_PREFIX as usize)
                        .ok_or_else(|| StoreError::FormatViolation("truncated length prefix".into()))?;
                    let n = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
                    pos += LENGTH_PREFIX as usize;
                    let body = bytes
                        .get(pos..pos + n)
                        .ok_or_else(|| StoreError::FormatViolation("item overruns its page".into()))?;
                    items.push(self.serializer.deserialize(body)?);
                    pos += n;
                }
            }
        }
        if items.len() != count {
            return Err(StoreError::IntegrityViolation(format!(
                "page decoded to {} items, expected {count}",
                items.len()
            )));
        }
        Ok(items)
    }

    fn rebuild_page_table(&mut self) -> StoreResult<()> {
        self.cache.clear();
        self.pages.clear();
        let len = self.buffer.len();
        match self.layout {
            Layout::Fixed { item_size, per_page } => {
                if len % item_size as u64 != 0 {
                    return Err(StoreError::FormatViolation(format!(
                        "{len} bytes is not a whole number of {item_size}-byte items"
                    )));
                }
                let count = (len / item_size as u64) as usize;
                for first in (0..count).step_by(per_page) {
                    let n = per_page.min(count - first);
                    self.pages.push(PageSpan {
                        first,
                        count: n,
                        start: (first * item_size) as u64,
                        size: (n * item_size) as u64,
                    });
                }
            }
            Layout::Variable => {
                let mut pos = 0u64;
                let mut index = 0usize;
                while pos < len {
                    if pos + LENGTH_PREFIX > len {
                        return Err(StoreError::FormatViolation(format!(
                            "truncated length prefix at byte {pos}"
                        )));
                    }
                    let mut raw = [0u8; LENGTH_PREFIX as usize];
                    self.buffer.read_at(pos, &mut raw)?;
                    let size = LENGTH_PREFIX + u32::from_le_bytes(raw) as u64;
                    if pos + size > len {
                        return Err(StoreError::FormatViolation(format!(
                            "item {index} at byte {pos} overruns the stream ({len} bytes)"
                        )));
                    }
                    match self.pages.last_mut() {
                        Some(span) if span.size + size <= self.page_size as u64 => {
                            span.count += 1;
                            span.size += size;
                        }
                        _ => self.pages.push(PageSpan {
                            first: index,
                            count: 1,
                            start: pos,
                            size,
                        }),
                    }
                    pos += size;
                    index += 1;
                }
            }
        }
        Ok(())
    }

    fn record_len(serializer: &S, layout: Layout, item: &T) -> StoreResult<u64> {
        let size = serializer.calculate_size(item)?;
        match layout {
            Layout::Fixed { item_size, .. } => {
                if size != item_size {
                    return Err(StoreError::SchemaViolation(format!(
                        "item is {size} bytes, list holds {item_size}-byte items"
                    )));
                }
                Ok(size as u64)
            }
            Layout::Variable => {
                if u32::try_from(size).is_err() {
                    return Err(StoreError::SchemaViolation(format!(
                        "item of {size} bytes exceeds the length prefix"
                    )));
                }
                Ok(LENGTH_PREFIX + size as u64)
            }
        }
    }

    /// Encode `page` into its span, shifting the buffer tail if the page's
    /// size on disk changes.
    fn persist(
        buffer: &mut B,
        serializer: &S,
        layout: Layout,
        span: PageSpan,
        page: &mut Page<T>,
    ) -> StoreResult<()> {
        let mut bytes = Vec::with_capacity(span.size as usize);
        for item in &page.items {
            match layout {
                Layout::Fixed { .. } => serializer.serialize(item, &mut bytes)?,
                Layout::Variable => {
                    let at = bytes.len();
                    bytes.extend_from_slice(&[0; LENGTH_PREFIX as usize]);
                    serializer.serialize(item, &mut bytes)?;
                    let n = (bytes.len() - at) as u64 - LENGTH_PREFIX;
                    bytes[at..at + LENGTH_PREFIX as usize].copy_from_slice(&(n as u32).to_le_bytes());
                }
            }
        }
        if bytes.len() as u64 != span.size {
            return Err(StoreError::IntegrityViolation(format!(
                "page encodes to {} bytes, span holds {}",
                bytes.len(),
                span.size
            )));
        }
        shift_tail(buffer, span.start + page.persisted, span.start + span.size)?;
        buffer.write_at(span.start, &bytes)?;
        page.persisted = span.size;
        page.dirty = false;
        Ok(())
    }
}

fn lost_page(k: usize) -> StoreError {
    StoreError::IntegrityViolation(format!("list page {k} left the cache"))
}

/// Move the bytes `[old_end, len)` so they start at `new_end`, resizing the
/// buffer accordingly.
pub(crate) fn shift_tail<B: WritableBuffer>(buffer: &mut B, old_end: u64, new_end: u64) -> StoreResult<()> {
    if old_end == new_end {
        return Ok(());
    }
    let len = buffer.len();
    let tail = len.saturating_sub(old_end);
    if new_end > old_end {
        buffer.set_len(new_end + tail)?;
        let mut remaining = tail;
        while remaining > 0 {
            let n = remaining.min(SHIFT_CHUNK);
            let src = old_end + remaining - n;
            let chunk = buffer.read_vec(src, n as usize)?;
            buffer.write_at(src + (new_end - old_end), &chunk)?;
            remaining -= n;
        }
    } else {
        let mut moved = 0;
        while moved < tail {
            let n = (tail - moved).min(SHIFT_CHUNK);
            let chunk = buffer.read_vec(old_end + moved, n as usize)?;
            buffer.write_at(new_end + moved, &chunk)?;
            moved += n;
        }
        buffer.set_len(new_end + tail)?;
    }
    Ok(())
}
