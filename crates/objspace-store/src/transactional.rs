use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use objspace_types::Digest;
use tracing::{debug, info, trace};

use crate::buffer::{check_range, check_write, CheckpointBuffer, ReadableBuffer, WritableBuffer};
use crate::error::{StoreError, StoreResult};
use crate::header::FileHeader;
use crate::journal::{Journal, JournalRecord};
use crate::merkle_buffer::MerkleBuffer;
use crate::paged_buffer::PagedBuffer;
use crate::stream::Stream;

enum StagedPage {
    /// Full page image held in memory.
    Resident(Vec<u8>),
    /// Full page image parked in the scratch file at this slot.
    Spilled(u64),
}

/// Anonymous scratch file for staged pages beyond the memory budget.
struct SpillFile {
    file: File,
    page_size: usize,
    next_slot: u64,
}

impl SpillFile {
    fn create(dir: &Path, page_size: usize) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            file: tempfile::tempfile_in(dir)?,
            page_size,
            next_slot: 0,
        })
    }

    fn offset(&self, slot: u64) -> u64 {
        slot * self.page_size as u64
    }

    fn store(&mut self, bytes: &[u8]) -> StoreResult<u64> {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.overwrite(slot, bytes)?;
        Ok(slot)
    }

    fn overwrite(&mut self, slot: u64, bytes: &[u8]) -> StoreResult<()> {
        let offset = self.offset(slot);
        self.file.write_all_at(offset, bytes)?;
        Ok(())
    }

    fn load(&mut self, slot: u64) -> StoreResult<Vec<u8>> {
        let mut bytes = vec![0u8; self.page_size];
        let offset = self.offset(slot);
        self.file.read_exact_at(offset, &mut bytes)?;
        Ok(bytes)
    }

    fn read_part(&mut self, slot: u64, in_page: usize, buf: &mut [u8]) -> StoreResult<()> {
        let offset = self.offset(slot) + in_page as u64;
        self.file.read_exact_at(offset, buf)?;
        Ok(())
    }
}

/// Staging layer giving atomic commit and rollback over a checkpointable
/// buffer.
///
/// Writes copy the affected pages into an overlay and never reach `inner`
/// until [`commit`](Self::commit). Content that was cut off by `set_len`
/// during the transaction stays invisible even if the file is extended
/// again before commit.
pub struct TransactionalBuffer<B> {
    inner: B,
    page_size: usize,
    overlay: BTreeMap<u64, StagedPage>,
    /// Resident pages in the order they were staged, oldest first. May
    /// hold pages since dropped or spilled.
    spill_queue: VecDeque<u64>,
    staged_len: u64,
    /// Prefix of `inner` still visible through the overlay.
    visible_len: u64,
    journal: Option<Journal>,
    spill_dir: Option<PathBuf>,
    spill: Option<SpillFile>,
    max_resident: usize,
    resident: usize,
    read_only: bool,
    sync: bool,
}

impl<B: CheckpointBuffer> TransactionalBuffer<B> {
    /// Stage over `inner` in `page_size` pages, keeping at most
    /// `max_memory` bytes of staged pages resident.
    pub fn new(inner: B, page_size: usize, max_memory: usize) -> Self {
        let len = inner.len();
        Self {
            inner,
            page_size: page_size.max(1),
            overlay: BTreeMap::new(),
            spill_queue: VecDeque::new(),
            staged_len: len,
            visible_len: len,
            journal: None,
            spill_dir: None,
            spill: None,
            max_resident: (max_memory / page_size.max(1)).max(1),
            resident: 0,
            read_only: false,
            sync: true,
        }
    }

    /// Journal commits to `journal` before touching `inner`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Spill staged pages beyond the budget to scratch files in `dir`.
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns `true` if anything is staged.
    pub fn has_changes(&self) -> bool {
        let committed = self.inner.len();
        !self.overlay.is_empty() || self.staged_len != committed || self.visible_len != committed
    }

    /// Number of staged pages.
    pub fn staged_pages(&self) -> usize {
        self.overlay.len()
    }

    /// Staged pages currently parked in the scratch file.
    pub fn spilled_pages(&self) -> usize {
        self.overlay.len() - self.resident
    }

    /// The committed layer. Reads through it bypass the overlay.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    /// Journal, write and checkpoint all staged pages, then start a fresh
    /// transaction. Committing nothing is a no-op.
    pub fn commit(&mut self) -> StoreResult<()> {
        if !self.has_changes() {
            trace!("commit with no staged changes");
            return Ok(());
        }
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let record = self.build_record()?;
        if let Some(journal) = &self.journal {
            journal.write(&record, self.sync)?;
        }
        apply_record(&mut self.inner, &record)?;
        self.inner.checkpoint(None)?;
        if let Some(journal) = &self.journal {
            journal.remove()?;
        }
        info!(
            pages = record.pages.len(),
            length = record.staged_len,
            "transaction committed"
        );
        self.reset();
        Ok(())
    }

    /// Discard every staged change. Idempotent.
    pub fn rollback(&mut self) {
        if !self.has_changes() {
            return;
        }
        debug!(pages = self.overlay.len(), "transaction rolled back");
        self.reset();
    }

    fn reset(&mut self) {
        self.overlay.clear();
        self.spill_queue.clear();
        self.spill = None;
        self.resident = 0;
        self.staged_len = self.inner.len();
        self.visible_len = self.staged_len;
    }

    fn build_record(&mut self) -> StoreResult<JournalRecord> {
        let page_size = self.page_size as u64;
        let mut pages = Vec::with_capacity(self.overlay.len());
        for (&page, staged) in &self.overlay {
            let start = page * page_size;
            let valid = (self.staged_len - start).min(page_size) as usize;
            let mut bytes = match staged {
                StagedPage::Resident(bytes) => bytes.clone(),
                StagedPage::Spilled(slot) => self
                    .spill
                    .as_mut()
                    .ok_or_else(|| missing_spill(page))?
                    .load(*slot)?,
            };
            bytes.truncate(valid);
            pages.push((page, bytes));
        }
        Ok(JournalRecord {
            page_size: self.page_size as u32,
            visible_len: self.visible_len,
            staged_len: self.staged_len,
            pages,
        })
    }

    /// Page image as the transaction currently sees it when nothing is
    /// staged for it.
    fn base_page(&mut self, page: u64) -> StoreResult<Vec<u8>> {
        let mut bytes = vec![0u8; self.page_size];
        let start = page * self.page_size as u64;
        let end = (start + self.page_size as u64).min(self.visible_len);
        if end > start {
            self.inner
                .read_at(start, &mut bytes[..(end - start) as usize])?;
        }
        Ok(bytes)
    }

    fn modify_page(&mut self, page: u64, edit: impl FnOnce(&mut [u8])) -> StoreResult<()> {
        match self.overlay.get_mut(&page) {
            Some(StagedPage::Resident(bytes)) => {
                edit(bytes);
                Ok(())
            }
            Some(StagedPage::Spilled(slot)) => {
                let slot = *slot;
                let spill = self.spill.as_mut().ok_or_else(|| missing_spill(page))?;
                let mut bytes = spill.load(slot)?;
                edit(&mut bytes);
                spill.overwrite(slot, &bytes)
            }
            None => {
                let mut bytes = self.base_page(page)?;
                edit(&mut bytes);
                self.overlay.insert(page, StagedPage::Resident(bytes));
                self.spill_queue.push_back(page);
                self.resident += 1;
                self.spill_excess(page)
            }
        }
    }

    /// Park the oldest resident pages in the scratch file until the budget
    /// holds. `keep` is the page just touched and stays resident.
    fn spill_excess(&mut self, keep: u64) -> StoreResult<()> {
        let Some(dir) = self.spill_dir.clone() else {
            return Ok(());
        };
        while self.resident > self.max_resident {
            let Some(victim) = self.spill_queue.pop_front() else {
                break;
            };
            if victim == keep {
                self.spill_queue.push_back(victim);
                continue;
            }
            if !matches!(self.overlay.get(&victim), Some(StagedPage::Resident(_))) {
                continue;
            }
            if self.spill.is_none() {
                self.spill = Some(SpillFile::create(&dir, self.page_size)?);
                debug!(dir = %dir.display(), "spilling staged pages");
            }
            let Some(StagedPage::Resident(bytes)) = self.overlay.remove(&victim) else {
                break;
            };
            let spill = self.spill.as_mut().ok_or_else(|| missing_spill(victim))?;
            let slot = spill.store(&bytes)?;
            self.overlay.insert(victim, StagedPage::Spilled(slot));
            self.resident -= 1;
            trace!(page = victim, slot, "spilled staged page");
        }
        Ok(())
    }
}

fn missing_spill(page: u64) -> StoreError {
    StoreError::IntegrityViolation(format!("staged page {page} lost its scratch file"))
}

/// Redo a commit described by `record` against `inner`. Safe to repeat.
pub(crate) fn apply_record<B: WritableBuffer>(
    inner: &mut B,
    record: &JournalRecord,
) -> StoreResult<()> {
    let page_size = record.page_size as u64;
    let visible = record.visible_len.min(inner.len());
    inner.set_len(visible)?;
    inner.set_len(record.staged_len)?;
    for (page, bytes) in &record.pages {
        inner.write_at(page * page_size, bytes)?;
    }
    Ok(())
}

impl<B: CheckpointBuffer> ReadableBuffer for TransactionalBuffer<B> {
    fn len(&self) -> u64 {
        self.staged_len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        check_range(offset, buf.len(), self.staged_len)?;
        let page_size = self.page_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = pos / page_size;
            let in_page = (pos % page_size) as usize;
            let n = (self.page_size - in_page).min(buf.len() - done);
            let dest = &mut buf[done..done + n];
            match self.overlay.get(&page) {
                Some(StagedPage::Resident(bytes)) => {
                    dest.copy_from_slice(&bytes[in_page..in_page + n]);
                }
                Some(StagedPage::Spilled(slot)) => {
                    self.spill
                        .as_mut()
                        .ok_or_else(|| missing_spill(page))?
                        .read_part(*slot, in_page, dest)?;
                }
                None => {
                    let from_inner = self.visible_len.saturating_sub(pos).min(n as u64) as usize;
                    if from_inner > 0 {
                        self.inner.read_at(pos, &mut dest[..from_inner])?;
                    }
                    dest[from_inner..].fill(0);
                }
            }
            done += n;
        }
        Ok(())
    }
}

impl<B: CheckpointBuffer> WritableBuffer for TransactionalBuffer<B> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        check_write(offset, self.staged_len)?;
        let page_size = self.page_size as u64;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let page = pos / page_size;
            let in_page = (pos % page_size) as usize;
            let n = (self.page_size - in_page).min(data.len() - done);
            let chunk = &data[done..done + n];
            self.modify_page(page, |bytes| {
                bytes[in_page..in_page + n].copy_from_slice(chunk);
            })?;
            done += n;
        }
        self.staged_len = self.staged_len.max(offset + data.len() as u64);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if len < self.staged_len {
            let page_size = self.page_size as u64;
            let dropped: Vec<u64> = self
                .overlay
                .range(len.div_ceil(page_size)..)
                .map(|(page, _)| *page)
                .collect();
            for page in dropped {
                if let Some(StagedPage::Resident(_)) = self.overlay.remove(&page) {
                    self.resident -= 1;
                }
            }
            let tail = (len % page_size) as usize;
            if tail != 0 && self.overlay.contains_key(&(len / page_size)) {
                self.modify_page(len / page_size, |bytes| bytes[tail..].fill(0))?;
            }
            self.visible_len = self.visible_len.min(len);
        }
        self.staged_len = len;
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

impl<S: Stream> TransactionalBuffer<MerkleBuffer<PagedBuffer<S>>> {
    /// Header as of the last commit.
    pub fn header(&self) -> &FileHeader {
        self.inner.inner().header()
    }

    /// Merkle root of the committed content.
    pub fn root(&self) -> Digest {
        self.inner.root()
    }

    /// Rebuild the Merkle tree from the committed content and compare it
    /// with the root persisted in the header.
    pub fn verify(&mut self) -> StoreResult<bool> {
        let expected = self.header().root.clone();
        self.inner.verify_root(&expected)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use objspace_crypto::ContentHasher;

    use super::*;

    fn memory(page_size: usize) -> TransactionalBuffer<Vec<u8>> {
        TransactionalBuffer::new(Vec::new(), page_size, 1 << 20)
    }

    #[test]
    fn staged_writes_are_invisible_below_until_commit() {
        let mut tx = memory(16);
        tx.write_at(0, b"hello world, staged").unwrap();
        assert_eq!(tx.len(), 19);
        assert!(tx.inner().is_empty());
        assert_eq!(tx.read_vec(6, 5).unwrap(), b"world");

        tx.commit().unwrap();
        assert_eq!(tx.inner().as_slice(), b"hello world, staged");
        assert!(!tx.has_changes());
    }

    #[test]
    fn rollback_restores_committed_state() {
        let mut tx = memory(16);
        tx.write_at(0, &[1u8; 40]).unwrap();
        tx.commit().unwrap();

        tx.write_at(10, &[2u8; 50]).unwrap();
        tx.set_len(30).unwrap();
        tx.rollback();
        assert_eq!(tx.len(), 40);
        assert_eq!(tx.read_vec(0, 40).unwrap(), vec![1u8; 40]);

        // A second rollback, and one on a clean transaction, are no-ops.
        tx.rollback();
        tx.rollback();
        assert_eq!(tx.read_vec(0, 40).unwrap(), vec![1u8; 40]);
    }

    #[test]
    fn shrink_then_grow_hides_old_bytes() {
        let mut tx = memory(16);
        tx.write_at(0, &[7u8; 64]).unwrap();
        tx.commit().unwrap();

        tx.set_len(20).unwrap();
        tx.set_len(64).unwrap();
        let back = tx.read_vec(0, 64).unwrap();
        assert_eq!(&back[..20], &[7u8; 20]);
        assert!(back[20..].iter().all(|b| *b == 0));

        tx.commit().unwrap();
        assert_eq!(tx.inner().as_slice(), back.as_slice());
    }

    #[test]
    fn shrink_inside_staged_page_zeroes_tail() {
        let mut tx = memory(16);
        tx.write_at(0, &[3u8; 16]).unwrap();
        tx.set_len(5).unwrap();
        tx.set_len(16).unwrap();
        assert_eq!(tx.read_vec(0, 16).unwrap(), [&[3u8; 5][..], &[0u8; 11][..]].concat());
    }

    #[test]
    fn gap_write_rejected() {
        let mut tx = memory(16);
        assert!(matches!(
            tx.write_at(1, b"x"),
            Err(StoreError::RangeViolation { .. })
        ));
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut tx = memory(16).with_read_only(true);
        assert!(matches!(tx.write_at(0, b"x"), Err(StoreError::ReadOnly)));
        assert!(matches!(tx.set_len(3), Err(StoreError::ReadOnly)));
        tx.commit().unwrap();
    }

    #[test]
    fn spill_keeps_content_beyond_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = TransactionalBuffer::new(Vec::new(), 16, 32).with_spill_dir(dir.path());
        let data: Vec<u8> = (0..160u8).collect();
        tx.write_at(0, &data).unwrap();
        assert_eq!(tx.staged_pages(), 10);
        assert!(tx.spilled_pages() >= 8);
        assert_eq!(tx.read_vec(0, 160).unwrap(), data);

        // Modify a spilled page in place.
        tx.write_at(1, &[0xee; 2]).unwrap();
        tx.commit().unwrap();
        let mut expect = data.clone();
        expect[1] = 0xee;
        expect[2] = 0xee;
        assert_eq!(tx.inner().as_slice(), expect.as_slice());
    }

    #[test]
    fn oldest_staged_pages_spill_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = TransactionalBuffer::new(Vec::new(), 16, 48).with_spill_dir(dir.path());
        for page in 0..6u8 {
            tx.write_at(page as u64 * 16, &[page; 16]).unwrap();
        }
        assert_eq!(tx.spilled_pages(), 3);
        for page in 0..3 {
            assert!(matches!(tx.overlay.get(&page), Some(StagedPage::Spilled(_))));
        }
        // Pages dropped by a shrink leave stale queue entries behind.
        tx.set_len(64).unwrap();
        tx.write_at(64, &[9; 48]).unwrap();
        assert_eq!(tx.resident, 3);
        assert_eq!(tx.staged_pages(), 7);
        let mut expect: Vec<u8> = (0..4u8).flat_map(|p| [p; 16]).collect();
        expect.extend_from_slice(&[9; 48]);
        assert_eq!(tx.read_vec(0, 112).unwrap(), expect);
    }

    #[test]
    fn journal_is_removed_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("t.journal"));
        let mut tx = memory(16).with_journal(journal.clone());
        tx.write_at(0, b"abc").unwrap();
        tx.commit().unwrap();
        assert!(!journal.exists());
    }

    #[test]
    fn apply_record_is_idempotent() {
        let record = JournalRecord {
            page_size: 4,
            visible_len: 6,
            staged_len: 10,
            pages: vec![(2, vec![9, 9])],
        };
        let mut target: Vec<u8> = (1..=8).collect();
        apply_record(&mut target, &record).unwrap();
        let once = target.clone();
        apply_record(&mut target, &record).unwrap();
        assert_eq!(target, once);
        assert_eq!(once, vec![1, 2, 3, 4, 5, 6, 0, 0, 9, 9]);
    }

    #[test]
    fn committed_root_tracks_content() {
        let hasher: Arc<dyn objspace_crypto::HashFunction> = Arc::new(ContentHasher::MERKLE);
        let paged = PagedBuffer::create(Cursor::new(Vec::new()), 64, 32, 4).unwrap();
        let merkle = MerkleBuffer::open(paged, hasher, 64).unwrap();
        let mut tx = TransactionalBuffer::new(merkle, 64, 1 << 16);
        assert!(tx.root().is_zero());

        tx.write_at(0, &[5u8; 100]).unwrap();
        assert!(tx.root().is_zero(), "staged writes do not move the root");
        tx.commit().unwrap();
        assert!(!tx.root().is_zero());
        assert_eq!(tx.header().root, tx.root());
        assert!(tx.verify().unwrap());
    }
}
