//! RAR text-block escape protocol on top of a PPMd session.
//!
//! Inside a PPMd block the escape character introduces a control code:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | End of the PPMd block, Huffman tables follow |
//! | 1 | Literal escape character |
//! | 2 | End of data |
//! | 3 | Filter code (recorded, not executed) |
//! | 4 | LZ match: 3-byte distance, 1-byte length |
//! | 5 | RLE run: 1-byte length, distance 1 |
//!
//! Any other code is written as a literal escape character.

use crate::decoder::PpmDecoder;
use crate::error::{PpmError, Result};

/// Why a block decode returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    /// The output reached the requested limit.
    LimitReached,
    /// The stream switches back to LZ; the container reads new tables.
    TablesFollow,
    /// The stream ended.
    EndOfData,
}

/// Filter program carried in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCode {
    /// Flags byte preceding the code.
    pub first_byte: u8,
    /// Program bytes.
    pub code: Vec<u8>,
    /// Output position at which the code appeared.
    pub position: usize,
}

/// Escape-protocol decoder.
pub struct PpmBlockDecoder {
    session: PpmDecoder,
    filters: Vec<FilterCode>,
}

impl PpmBlockDecoder {
    /// Wrap a decode session.
    pub fn new(session: PpmDecoder) -> Self {
        Self {
            session,
            filters: Vec::new(),
        }
    }

    /// Start a payload, see [`PpmDecoder::init`].
    pub fn init(&mut self, data: &[u8], offset: usize) -> Result<usize> {
        self.session.init(data, offset)
    }

    /// The underlying session.
    pub fn session(&self) -> &PpmDecoder {
        &self.session
    }

    /// The underlying session, mutably.
    pub fn session_mut(&mut self) -> &mut PpmDecoder {
        &mut self.session
    }

    /// Release the session.
    pub fn into_inner(self) -> PpmDecoder {
        self.session
    }

    /// Filter codes seen so far.
    pub fn filters(&self) -> &[FilterCode] {
        &self.filters
    }

    /// Take the recorded filter codes.
    pub fn take_filters(&mut self) -> Vec<FilterCode> {
        std::mem::take(&mut self.filters)
    }

    /// Decode into `out` until `limit` bytes exist or the block ends.
    ///
    /// `out` is also the history back references copy from, so it must hold
    /// everything produced for this stream so far.
    pub fn decode(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<BlockEnd> {
        let limit = match self.session.options().max_output {
            Some(max) => limit.min(max),
            None => limit,
        };

        while out.len() < limit {
            let ch = self.session.decode_byte()?;
            let esc_char = self.session.esc_char();
            if ch != esc_char {
                out.push(ch);
                continue;
            }

            match self.session.decode_byte()? {
                0 => return Ok(BlockEnd::TablesFollow),
                2 => return Ok(BlockEnd::EndOfData),
                3 => self.read_filter(out.len())?,
                4 => {
                    let mut distance = 0u32;
                    for _ in 0..3 {
                        distance = (distance << 8) | u32::from(self.session.decode_byte()?);
                    }
                    let length = usize::from(self.session.decode_byte()?) + 32;
                    copy_match(out, distance + 2, length, limit)?;
                }
                5 => {
                    let length = usize::from(self.session.decode_byte()?) + 4;
                    copy_match(out, 1, length, limit)?;
                }
                _ => out.push(esc_char),
            }
        }

        Ok(BlockEnd::LimitReached)
    }

    fn read_filter(&mut self, position: usize) -> Result<()> {
        let first_byte = self.session.decode_byte()?;
        let mut length = usize::from(first_byte & 7) + 1;
        if length == 7 {
            length = usize::from(self.session.decode_byte()?) + 7;
        } else if length == 8 {
            let hi = usize::from(self.session.decode_byte()?);
            let lo = usize::from(self.session.decode_byte()?);
            length = hi * 256 + lo;
        }
        if length == 0 {
            return Ok(());
        }

        let code = self.session.decode_to(length)?;
        ltrace!("filter code of {} bytes at output {}", code.len(), position);
        self.filters.push(FilterCode {
            first_byte,
            code,
            position,
        });
        Ok(())
    }
}

/// Copy `length` bytes from `distance` back, stopping at `limit`.
fn copy_match(out: &mut Vec<u8>, distance: u32, length: usize, limit: usize) -> Result<()> {
    let dist = distance as usize;
    if dist == 0 || dist > out.len() {
        return Err(PpmError::InvalidBackReference {
            distance,
            position: out.len(),
        });
    }
    let length = length.min(limit.saturating_sub(out.len()));
    for _ in 0..length {
        let byte = out[out.len() - dist];
        out.push(byte);
    }
    Ok(())
}

/// Decode a whole text block from `data` into at most `limit` bytes.
///
/// Decoding stops at the end-of-data marker, at a switch back to LZ
/// tables, or when `limit` is reached.
pub fn decode_text_block(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut block = PpmBlockDecoder::new(PpmDecoder::new());
    block.init(data, 0)?;
    let mut out = Vec::new();
    block.decode(&mut out, limit)?;
    Ok(out)
}
