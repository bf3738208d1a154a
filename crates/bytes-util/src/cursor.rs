use std::io;

use bytes::Bytes;

/// Zero-copy extraction helpers for `io::Cursor<Bytes>`.
///
/// Combine with `byteorder::ReadBytesExt` for the fixed-width integer reads.
pub trait BytesCursorExt {
    /// Takes the next `size` bytes as a slice of the underlying buffer.
    fn extract_bytes(&mut self, size: usize) -> io::Result<Bytes>;

    /// Takes everything up to the end of the buffer.
    fn extract_remaining(&mut self) -> Bytes;

    /// Number of unread bytes.
    fn remaining(&self) -> usize;

    /// Advances by `size` bytes without copying.
    fn skip_bytes(&mut self, size: usize) -> io::Result<()>;
}

impl BytesCursorExt for io::Cursor<Bytes> {
    fn extract_bytes(&mut self, size: usize) -> io::Result<Bytes> {
        let position = self.position() as usize;
        if size > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "requested {size} bytes at offset {position}, {} available",
                    self.remaining()
                ),
            ));
        }
        let slice = self.get_ref().slice(position..position + size);
        self.set_position((position + size) as u64);
        Ok(slice)
    }

    fn extract_remaining(&mut self) -> Bytes {
        let position = (self.position() as usize).min(self.get_ref().len());
        let slice = self.get_ref().slice(position..);
        self.set_position(self.get_ref().len() as u64);
        slice
    }

    fn remaining(&self) -> usize {
        self.get_ref().len().saturating_sub(self.position() as usize)
    }

    fn skip_bytes(&mut self, size: usize) -> io::Result<()> {
        if size > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cannot skip {size} bytes, {} available", self.remaining()),
            ));
        }
        self.set_position(self.position() + size as u64);
        Ok(())
    }
}
