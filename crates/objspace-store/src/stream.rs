//! Byte streams under the page cache: files and in-memory cursors.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// A seekable byte stream with a settable length.
///
/// The page cache reads and writes whole pages through this trait. Files
/// and in-memory cursors both implement it.
pub trait Stream: Read + Write + Seek + Send {
    /// Current length in bytes.
    fn length(&mut self) -> io::Result<u64>;

    /// Truncate or zero-extend to `len` bytes.
    fn set_length(&mut self, len: u64) -> io::Result<()>;

    /// Make previously written bytes durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    /// Write all of `data` at `offset`, extending the stream if needed.
    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }
}

impl Stream for File {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl Stream for Cursor<Vec<u8>> {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(io::Error::other)?;
        self.get_mut().resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(stream: &mut dyn Stream) {
        stream.write_all_at(0, b"hello").unwrap();
        stream.write_all_at(8, b"world").unwrap();
        assert_eq!(stream.length().unwrap(), 13);

        let mut buf = [0xffu8; 13];
        stream.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello\0\0\0world");

        stream.set_length(4).unwrap();
        assert_eq!(stream.length().unwrap(), 4);
        stream.set_length(6).unwrap();
        let mut tail = [0xffu8; 2];
        stream.read_exact_at(4, &mut tail).unwrap();
        assert_eq!(tail, [0, 0]);
        stream.sync().unwrap();
    }

    #[test]
    fn cursor_stream() {
        exercise(&mut Cursor::new(Vec::new()));
    }

    #[test]
    fn file_stream() {
        let mut file = tempfile::tempfile().unwrap();
        exercise(&mut file);
    }

    #[test]
    fn short_read_is_an_error() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buf = [0u8; 4];
        let err = cursor.read_exact_at(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
