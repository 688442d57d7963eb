//! Byte-buffer traits shared by every storage layer.
//!
//! Each layer (page cache, Merkle buffer, transactional buffer, clustered
//! stream) exposes the same random-access interface so lists and boxes can
//! sit on any of them.

use objspace_types::Digest;

use crate::error::{StoreError, StoreResult};

/// Random-access reads over a logical byte range `[0, len)`.
///
/// Reads take `&mut self` because most implementations fill a cache.
pub trait ReadableBuffer {
    /// Logical length in bytes.
    fn len(&self) -> u64;

    /// Returns `true` when the buffer holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` with the bytes at `offset`. The whole range must lie
    /// within the buffer.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()>;

    /// Read `len` bytes at `offset` into a fresh vector.
    fn read_vec(&mut self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// Writes and resizing. Writes may extend the buffer but never leave a gap:
/// `offset` must not exceed the current length.
pub trait WritableBuffer: ReadableBuffer {
    /// Overwrite or extend the bytes at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()>;

    /// Truncate, or zero-extend, to `len` bytes.
    fn set_len(&mut self, len: u64) -> StoreResult<()>;

    /// Push cached state down one layer.
    fn flush(&mut self) -> StoreResult<()>;
}

/// A buffer that can durably record a consistent state.
pub trait CheckpointBuffer: WritableBuffer {
    /// Flush everything and persist `root` as the integrity root of the
    /// current content. Layers that maintain their own root replace the
    /// argument with it.
    fn checkpoint(&mut self, root: Option<&Digest>) -> StoreResult<()>;
}

/// Check that `[offset, offset + len)` lies within `total`.
pub(crate) fn check_range(offset: u64, len: usize, total: u64) -> StoreResult<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= total => Ok(()),
        _ => Err(StoreError::range("byte offset", offset.saturating_add(len as u64), total)),
    }
}

/// Check that a write at `offset` does not leave a gap.
pub(crate) fn check_write(offset: u64, total: u64) -> StoreResult<()> {
    if offset > total {
        return Err(StoreError::range("write offset", offset, total));
    }
    Ok(())
}

/// An in-memory buffer: handy as the base of transient stores and tests.
impl ReadableBuffer for Vec<u8> {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        check_range(offset, buf.len(), ReadableBuffer::len(self))?;
        let start = offset as usize;
        buf.copy_from_slice(&self[start..start + buf.len()]);
        Ok(())
    }
}

impl WritableBuffer for Vec<u8> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        check_write(offset, ReadableBuffer::len(self))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > <[u8]>::len(self) {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> StoreResult<()> {
        let len = usize::try_from(len)
            .map_err(|_| StoreError::range("length", len, usize::MAX as u64))?;
        self.resize(len, 0);
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

impl CheckpointBuffer for Vec<u8> {
    fn checkpoint(&mut self, _root: Option<&Digest>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_buffer_reads_and_writes() {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_at(0, b"abc").unwrap();
        buf.write_at(3, b"def").unwrap();
        buf.write_at(1, b"X").unwrap();
        assert_eq!(buf.read_vec(0, 6).unwrap(), b"aXcdef");
        assert_eq!(ReadableBuffer::len(&buf), 6);
    }

    #[test]
    fn gap_write_is_range_violation() {
        let mut buf: Vec<u8> = vec![0; 4];
        let err = buf.write_at(5, b"x").unwrap_err();
        assert!(matches!(err, StoreError::RangeViolation { index: 5, len: 4, .. }));
    }

    #[test]
    fn read_past_end_is_range_violation() {
        let mut buf: Vec<u8> = vec![0; 4];
        let mut out = [0u8; 2];
        assert!(buf.read_at(3, &mut out).is_err());
        assert!(buf.read_at(2, &mut out).is_ok());
    }

    #[test]
    fn set_len_zero_extends() {
        let mut buf: Vec<u8> = b"xyz".to_vec();
        WritableBuffer::set_len(&mut buf, 1).unwrap();
        WritableBuffer::set_len(&mut buf, 3).unwrap();
        assert_eq!(buf.read_vec(0, 3).unwrap(), b"x\0\0");
    }
}
