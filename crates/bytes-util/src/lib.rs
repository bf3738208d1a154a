//! Small helpers for reading binary media structures out of `bytes::Bytes`.

mod bit_read;
mod cursor;

pub use bit_read::BitReader;
pub use cursor::BytesCursorExt;
