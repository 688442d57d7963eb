//! Self-describing file header.
//!
//! On-disk layout of one header slot (little-endian):
//! ```text
//! [0..8)    magic "OBJSPACE"
//! [8..10)   format version (u16)
//! [10..14)  page size (u32)
//! [14..16)  digest size (u16)
//! [16..24)  content length (u64)
//! [24..32)  commit counter (u64)
//! [32..96)  Merkle root, zero padded to 64 bytes
//! [96..100) CRC32 of bytes [0..96)
//! [100..128) reserved, zero
//! ```
//! The file starts with two slots. Checkpoints alternate between them by
//! commit counter, so a torn header write always leaves the previous header
//! intact in the other slot.

use objspace_types::{Digest, MAX_DIGEST_SIZE};

use crate::error::{StoreError, StoreResult};
use crate::stream::Stream;

/// Magic bytes identifying an ObjectSpace storage file.
pub const FILE_MAGIC: &[u8; 8] = b"OBJSPACE";

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Size of one header slot.
pub const HEADER_SIZE: usize = 128;

/// Bytes reserved for headers before the content region.
pub const HEADER_REGION: u64 = 2 * HEADER_SIZE as u64;

const CRC_OFFSET: usize = 96;

/// Decoded file header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub page_size: u32,
    pub digest_size: u16,
    /// Logical length of the content region.
    pub content_length: u64,
    /// Number of completed checkpoints.
    pub commit_count: u64,
    /// Merkle root of the content as of the last checkpoint.
    pub root: Digest,
}

impl FileHeader {
    /// Header of a freshly created, empty file.
    pub fn new(page_size: u32, digest_size: u16) -> Self {
        Self {
            version: FORMAT_VERSION,
            page_size,
            digest_size,
            content_length: 0,
            commit_count: 0,
            root: Digest::zero(digest_size as usize),
        }
    }

    /// Encode into one 128-byte slot.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(FILE_MAGIC);
        out[8..10].copy_from_slice(&self.version.to_le_bytes());
        out[10..14].copy_from_slice(&self.page_size.to_le_bytes());
        out[14..16].copy_from_slice(&self.digest_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.content_length.to_le_bytes());
        out[24..32].copy_from_slice(&self.commit_count.to_le_bytes());
        let root = self.root.as_bytes();
        let n = root.len().min(MAX_DIGEST_SIZE);
        out[32..32 + n].copy_from_slice(&root[..n]);
        let crc = crc32fast::hash(&out[..CRC_OFFSET]);
        out[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode and validate one slot.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> StoreResult<Self> {
        if &bytes[0..8] != FILE_MAGIC {
            return Err(StoreError::FormatViolation(
                "missing OBJSPACE magic".into(),
            ));
        }
        let stored_crc = u32::from_le_bytes(le4(&bytes[CRC_OFFSET..]));
        let crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        if stored_crc != crc {
            return Err(StoreError::FormatViolation(format!(
                "header checksum mismatch: stored {stored_crc:08x}, computed {crc:08x}"
            )));
        }
        let version = u16::from_le_bytes([bytes[8], bytes[9]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::FormatViolation(format!(
                "unsupported format version {version}"
            )));
        }
        let digest_size = u16::from_le_bytes([bytes[14], bytes[15]]);
        if digest_size == 0 || digest_size as usize > MAX_DIGEST_SIZE {
            return Err(StoreError::FormatViolation(format!(
                "invalid digest size {digest_size}"
            )));
        }
        Ok(Self {
            version,
            page_size: u32::from_le_bytes(le4(&bytes[10..])),
            digest_size,
            content_length: u64::from_le_bytes(le8(&bytes[16..])),
            commit_count: u64::from_le_bytes(le8(&bytes[24..])),
            root: Digest::from_vec(bytes[32..32 + digest_size as usize].to_vec()),
        })
    }

    /// Slot this header is written to.
    pub fn slot(&self) -> u64 {
        self.commit_count % 2
    }

    /// Write this header into its slot.
    pub fn write_to<S: Stream + ?Sized>(&self, stream: &mut S) -> StoreResult<()> {
        stream.write_all_at(self.slot() * HEADER_SIZE as u64, &self.encode())?;
        Ok(())
    }

    /// Read both slots and return the valid header with the highest commit
    /// counter.
    pub fn read_from<S: Stream + ?Sized>(stream: &mut S) -> StoreResult<Self> {
        let len = stream.length()?;
        if len < HEADER_REGION {
            return Err(StoreError::FormatViolation(format!(
                "file too short for a header: {len} bytes"
            )));
        }
        let mut best: Option<Self> = None;
        let mut last_err = None;
        for slot in 0..2u64 {
            let mut raw = [0u8; HEADER_SIZE];
            stream.read_exact_at(slot * HEADER_SIZE as u64, &mut raw)?;
            match Self::decode(&raw) {
                Ok(header) => {
                    if best
                        .as_ref()
                        .is_none_or(|b| header.commit_count > b.commit_count)
                    {
                        best = Some(header);
                    }
                }
                Err(err) => last_err = Some(err),
            }
        }
        match (best, last_err) {
            (Some(header), _) => Ok(header),
            (None, Some(err)) => Err(err),
            (None, None) => Err(StoreError::FormatViolation("no valid header".into())),
        }
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}
