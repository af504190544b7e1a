//! Byte cursor over a compressed payload.
//!
//! The range decoder pulls whole bytes, so unlike a bit reader this only
//! tracks a byte position. Reads past the end return zero and are counted,
//! letting the session decide whether truncation is an error.

/// Byte reader over a borrowed slice.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Number of reads that ran past the end.
    overrun: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader starting at `offset`.
    pub fn new(data: &'a [u8], offset: usize) -> Self {
        Self {
            data,
            pos: offset.min(data.len()),
            overrun: 0,
        }
    }

    /// Read the next byte, or `None` at the end of the data.
    #[inline]
    pub fn read_byte(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    /// Read the next byte, substituting zero past the end.
    #[inline]
    pub fn read_byte_or_zero(&mut self) -> u8 {
        match self.read_byte() {
            Some(byte) => byte,
            None => {
                self.overrun += 1;
                0
            }
        }
    }

    /// Current byte position.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left before the end.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Number of zero bytes substituted so far.
    #[inline]
    pub fn overrun(&self) -> usize {
        self.overrun
    }

    /// Whether all bytes have been consumed.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }
}
