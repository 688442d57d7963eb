//! Commit journal.
//!
//! Before a commit touches the storage file, the complete set of staged
//! pages is written to a journal file next to it and fsync'd. A journal
//! that is present and intact at open means a commit may have been cut
//! short, so it is replayed. A torn journal means the crash happened before
//! the storage file was touched, so it is simply removed.
//!
//! On-disk format (little-endian):
//! ```text
//! [8 bytes: magic "OSJOURNL"]
//! [2 bytes: version]
//! [4 bytes: page size]
//! [8 bytes: visible length]  lowest length reached while staging
//! [8 bytes: staged length]   length after the commit
//! [4 bytes: page count]
//! page count x { [8 bytes: page index] [4 bytes: byte count] [bytes] }
//! [4 bytes: CRC32 of everything above]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::StoreResult;

const JOURNAL_MAGIC: &[u8; 8] = b"OSJOURNL";
const JOURNAL_VERSION: u16 = 1;
const FIXED_PART: usize = 8 + 2 + 4 + 8 + 8 + 4;

/// Everything needed to redo a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalRecord {
    pub page_size: u32,
    /// Content beyond this length was discarded during the transaction.
    pub visible_len: u64,
    /// Content length once the commit completes.
    pub staged_len: u64,
    /// Staged pages in ascending index order.
    pub pages: Vec<(u64, Vec<u8>)>,
}

impl JournalRecord {
    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self.pages.iter().map(|(_, b)| 12 + b.len()).sum();
        let mut out = Vec::with_capacity(FIXED_PART + payload + 4);
        out.extend_from_slice(JOURNAL_MAGIC);
        out.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        out.extend_from_slice(&self.page_size.to_le_bytes());
        out.extend_from_slice(&self.visible_len.to_le_bytes());
        out.extend_from_slice(&self.staged_len.to_le_bytes());
        out.extend_from_slice(&(self.pages.len() as u32).to_le_bytes());
        for (index, bytes) in &self.pages {
            out.extend_from_slice(&index.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode a journal image. Returns `None` for anything incomplete or
    /// corrupt.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FIXED_PART + 4 || &bytes[0..8] != JOURNAL_MAGIC {
            return None;
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes(trailer.try_into().ok()?);
        if crc32fast::hash(body) != stored {
            return None;
        }
        let mut cursor = Reader { bytes: body, pos: 8 };
        if cursor.u16()? != JOURNAL_VERSION {
            return None;
        }
        let page_size = cursor.u32()?;
        let visible_len = cursor.u64()?;
        let staged_len = cursor.u64()?;
        let count = cursor.u32()? as usize;
        let mut pages = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let index = cursor.u64()?;
            let len = cursor.u32()? as usize;
            pages.push((index, cursor.take(len)?.to_vec()));
        }
        if cursor.pos != body.len() {
            return None;
        }
        Some(Self {
            page_size,
            visible_len,
            staged_len,
            pages,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }
}

/// State of the journal file found at open.
#[derive(Debug)]
pub enum JournalState {
    Absent,
    /// Fully written: the commit must be redone.
    Complete(JournalRecord),
    /// Partially written: the commit never started on the data file.
    Torn,
}

/// Handle to the journal file of one storage file.
#[derive(Clone, Debug)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write `record` and make it durable.
    pub fn write(&self, record: &JournalRecord, sync: bool) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&record.encode())?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        if sync {
            file.sync_all()?;
        }
        debug!(
            path = %self.path.display(),
            pages = record.pages.len(),
            staged_len = record.staged_len,
            "journal written"
        );
        Ok(())
    }

    /// Inspect the journal file.
    pub fn read(&self) -> StoreResult<JournalState> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(JournalState::Absent),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        match JournalRecord::decode(&bytes) {
            Some(record) => Ok(JournalState::Complete(record)),
            None => {
                warn!(path = %self.path.display(), size = bytes.len(), "torn journal");
                Ok(JournalState::Torn)
            }
        }
    }

    /// Delete the journal. A missing file is not an error.
    pub fn remove(&self) -> StoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
