//! Carryless range decoder for PPMd.
//!
//! Based on Dmitry Subbotin's implementation.

use super::byte_reader::ByteReader;
use crate::error::{PpmError, Result};

/// Range coder constants.
pub const TOP: u32 = 1 << 24;
pub const BOT: u32 = 1 << 15;

/// Range coder state.
pub struct RangeCoder {
    low: u32,
    code: u32,
    range: u32,
}

/// Subrange for decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubRange {
    pub low_count: u32,
    pub high_count: u32,
    pub scale: u32,
}

impl RangeCoder {
    /// Initialize the range coder from the payload (4 priming bytes).
    pub fn new(reader: &mut ByteReader) -> Self {
        let mut code = 0u32;
        for _ in 0..4 {
            code = (code << 8) | reader.read_byte_or_zero() as u32;
        }
        Self {
            low: 0,
            code,
            range: 0xFFFF_FFFF,
        }
    }

    /// Get current count within the scale.
    ///
    /// Narrows `range` by `scale` as a side effect.
    #[inline]
    pub fn get_current_count(&mut self, scale: u32) -> Result<u32> {
        if scale == 0 {
            return Err(PpmError::RangeUnderflow);
        }
        self.range /= scale;
        if self.range == 0 {
            return Err(PpmError::RangeUnderflow);
        }
        Ok(self.code.wrapping_sub(self.low) / self.range)
    }

    /// Get current count for a power-of-two scale.
    #[inline]
    pub fn get_current_shift_count(&mut self, shift: u32) -> Result<u32> {
        self.range >>= shift;
        if self.range == 0 {
            return Err(PpmError::RangeUnderflow);
        }
        Ok(self.code.wrapping_sub(self.low) / self.range)
    }

    /// Decode with the given subrange (without normalizing).
    #[inline]
    pub fn decode(&mut self, sub: &SubRange) {
        self.low = self
            .low
            .wrapping_add(sub.low_count.wrapping_mul(self.range));
        self.range = self
            .range
            .wrapping_mul(sub.high_count.wrapping_sub(sub.low_count));
    }

    /// Normalize the range coder state.
    #[inline]
    pub fn normalize(&mut self, reader: &mut ByteReader) {
        while (self.low ^ self.low.wrapping_add(self.range)) < TOP
            || self.range < BOT && {
                self.range = self.low.wrapping_neg() & (BOT - 1);
                true
            }
        {
            if self.range == 0 && self.low == 0 {
                // Degenerate state from a zero-width subrange; shifting
                // would never terminate.
                break;
            }
            self.code = (self.code << 8) | reader.read_byte_or_zero() as u32;
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    /// Current `(low, code, range)` registers.
    pub fn state(&self) -> (u32, u32, u32) {
        (self.low, self.code, self.range)
    }
}

/// Carryless range encoder mirroring [`RangeCoder`], used to build fixtures.
#[cfg(test)]
pub(crate) struct RangeEncoder {
    low: u32,
    range: u32,
    out: Vec<u8>,
}

#[cfg(test)]
impl RangeEncoder {
    pub(crate) fn new() -> Self {
        Self {
            low: 0,
            range: 0xFFFF_FFFF,
            out: Vec::new(),
        }
    }

    pub(crate) fn encode(&mut self, sub: &SubRange) {
        self.range /= sub.scale;
        self.narrow(sub);
    }

    pub(crate) fn encode_shift(&mut self, sub: &SubRange, shift: u32) {
        self.range >>= shift;
        self.narrow(sub);
    }

    fn narrow(&mut self, sub: &SubRange) {
        self.low = self
            .low
            .wrapping_add(sub.low_count.wrapping_mul(self.range));
        self.range = self
            .range
            .wrapping_mul(sub.high_count - sub.low_count);
    }

    pub(crate) fn normalize(&mut self) {
        while (self.low ^ self.low.wrapping_add(self.range)) < TOP
            || self.range < BOT && {
                self.range = self.low.wrapping_neg() & (BOT - 1);
                true
            }
        {
            self.out.push((self.low >> 24) as u8);
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        for _ in 0..4 {
            self.out.push((self.low >> 24) as u8);
            self.low <<= 8;
        }
        self.out
    }
}
