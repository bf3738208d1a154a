use std::io;

/// MSB-first bit reader over any byte source.
pub struct BitReader<T> {
    inner: T,
    current: u8,
    bits_left: u8,
}

impl<T: io::Read> BitReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            current: 0,
            bits_left: 0,
        }
    }

    pub fn read_bit(&mut self) -> io::Result<bool> {
        if self.bits_left == 0 {
            let mut byte = [0u8; 1];
            self.inner.read_exact(&mut byte)?;
            self.current = byte[0];
            self.bits_left = 8;
        }
        self.bits_left -= 1;
        Ok((self.current >> self.bits_left) & 1 == 1)
    }

    /// Reads up to 64 bits as an unsigned big-endian value.
    pub fn read_bits(&mut self, count: u8) -> io::Result<u64> {
        if count > 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read more than 64 bits at once",
            ));
        }
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    pub fn skip_bits(&mut self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            self.read_bit()?;
        }
        Ok(())
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        self.bits_left == 0
    }

    /// Drops the rest of the current byte.
    pub fn align(&mut self) {
        self.bits_left = 0;
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bits_across_bytes() {
        let data = [0b1010_1100u8, 0b0101_0000];
        let mut reader = BitReader::new(&data[..]);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_bits(3).unwrap(), 0b010);
        assert_eq!(reader.read_bits(8).unwrap(), 0b1100_0101);
        assert!(!reader.is_aligned());
        reader.align();
        assert!(reader.is_aligned());
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn test_adts_style_header_fields() {
        // syncword 0xFFF, then id=0, layer=00, protection_absent=1
        let data = [0xFF, 0xF1];
        let mut reader = BitReader::new(&data[..]);
        assert_eq!(reader.read_bits(12).unwrap(), 0xFFF);
        assert!(!reader.read_bit().unwrap());
        assert_eq!(reader.read_bits(2).unwrap(), 0);
        assert!(reader.read_bit().unwrap());
    }
}
