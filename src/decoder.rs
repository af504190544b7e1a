//! Byte-at-a-time PPMd decode session.
//!
//! A [`PpmDecoder`] owns one [`PpmModel`] for its whole lifetime. Every call
//! to [`PpmDecoder::init`] parses a model header and primes a fresh range
//! decoder over the new payload; the statistics survive unless the header
//! asks for a reset.
//!
//! ## Example
//!
//! ```rust
//! use rar_ppm::{DecoderOptions, PpmDecoder};
//!
//! let mut decoder = PpmDecoder::with_options(DecoderOptions {
//!     strict_eof: false,
//!     ..DecoderOptions::default()
//! });
//! // Reset, order 2, 1 MiB, then four priming bytes.
//! let start = decoder.init(&[0x21, 0x00, 0, 0, 0, 0], 0).unwrap();
//! assert_eq!(start, 2);
//! assert_eq!(decoder.esc_char(), 2);
//! ```

use crate::error::{PpmError, Result};
use crate::ppm::{ByteReader, PpmModel, RangeCoder};

/// Default escape character when a header does not carry one.
pub const DEFAULT_ESC_CHAR: u8 = 2;

/// Options for a decode session.
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// Report reads past the end of the payload as
    /// [`PpmError::TruncatedInput`]. When `false` missing bytes read as zero.
    pub strict_eof: bool,
    /// Escape character used until a header sets one.
    pub default_esc_char: u8,
    /// Upper bound on the bytes a block decode produces.
    pub max_output: Option<usize>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            strict_eof: true,
            default_esc_char: DEFAULT_ESC_CHAR,
            max_output: None,
        }
    }
}

/// PPMd decode session.
pub struct PpmDecoder {
    model: PpmModel,
    /// Range decoder of the active payload, `None` when no session is live.
    coder: Option<RangeCoder>,
    /// Payload of the active session.
    data: Vec<u8>,
    /// Read position in `data`.
    pos: usize,
    /// Zero bytes substituted past the end of `data`.
    overrun: usize,
    esc_char: u8,
    options: DecoderOptions,
}

impl PpmDecoder {
    /// Create a decoder with default options.
    pub fn new() -> Self {
        Self::with_options(DecoderOptions::default())
    }

    /// Create a decoder with the given options.
    pub fn with_options(options: DecoderOptions) -> Self {
        Self {
            model: PpmModel::new(),
            coder: None,
            data: Vec::new(),
            pos: 0,
            overrun: 0,
            esc_char: options.default_esc_char,
            options,
        }
    }

    /// Options of this session.
    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    /// Start decoding the payload whose model header sits at `offset`.
    ///
    /// Returns the offset of the first range-coder byte in `data`.
    pub fn init(&mut self, data: &[u8], offset: usize) -> Result<usize> {
        self.coder = None;
        self.data = data.to_vec();
        self.overrun = 0;

        let mut reader = ByteReader::new(&self.data, offset);
        let coder = self.model.decode_init(&mut reader, &mut self.esc_char)?;
        self.pos = reader.position();
        self.overrun = reader.overrun();
        let coder_start = self.pos - (4 - self.overrun);

        if self.overrun > 0 {
            if self.options.strict_eof {
                return Err(PpmError::TruncatedInput {
                    needed: self.overrun,
                });
            }
            lwarn!("PPMd payload shorter than the range coder priming bytes");
        }

        ldebug!(
            "PPMd session: header at {}, coder data at {}, {} payload bytes",
            offset,
            coder_start,
            self.data.len() - coder_start
        );
        self.coder = Some(coder);
        Ok(coder_start)
    }

    /// Decode one byte.
    pub fn decode_byte(&mut self) -> Result<u8> {
        let coder = self.coder.as_mut().ok_or(PpmError::ModelNotInitialized)?;
        let mut reader = ByteReader::new(&self.data, self.pos);
        let decoded = self.model.decode_char(coder, &mut reader);

        self.pos = reader.position();
        let overrun_before = self.overrun;
        self.overrun += reader.overrun();

        if self.overrun > 0 && self.options.strict_eof {
            self.fail();
            return Err(PpmError::TruncatedInput {
                needed: self.overrun,
            });
        }
        if overrun_before == 0 && self.overrun > 0 {
            lwarn!(
                "PPMd payload exhausted after {} bytes, padding with zeros",
                self.data.len()
            );
        }

        match decoded {
            Ok(byte) => Ok(byte),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Decode `len` bytes.
    pub fn decode_to(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.decode_byte()?);
        }
        Ok(out)
    }

    /// End the session after an error.
    ///
    /// The model is reduced to its minimal form so a later continuation
    /// header still finds an arena.
    fn fail(&mut self) {
        self.coder = None;
        self.model.clean_up();
    }

    /// Escape character of the current payload.
    pub fn esc_char(&self) -> u8 {
        self.esc_char
    }

    /// Reinitialize the model with minimal order and memory.
    pub fn reset(&mut self) {
        self.coder = None;
        self.model.clean_up();
    }

    /// Offset just past the last payload byte consumed.
    pub fn bytes_consumed(&self) -> usize {
        self.pos
    }

    /// Whether a payload is being decoded.
    pub fn is_active(&self) -> bool {
        self.coder.is_some()
    }

    /// Model order in effect.
    pub fn max_order(&self) -> i32 {
        self.model.max_order()
    }

    /// Model restarts caused by arena exhaustion since the decoder was created.
    pub fn restarts(&self) -> usize {
        self.model.restarts()
    }
}

impl Default for PpmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppm::ReferenceEncoder;

    const TEXT: &[u8] = b"It was the best of times, it was the worst of times, \
it was the age of wisdom, it was the age of foolishness, it was the epoch of belief, \
it was the epoch of incredulity, it was the season of Light, it was the season of Darkness.";

    #[test]
    fn test_init_reports_coder_start() {
        let payload = ReferenceEncoder::new().payload(Some((4, 0)), Some(0x99), TEXT);
        let mut framed = vec![0xEE; 7];
        framed.extend(&payload);

        let mut decoder = PpmDecoder::new();
        assert_eq!(decoder.init(&framed, 7).unwrap(), 7 + 3);
        assert_eq!(decoder.esc_char(), 0x99);
        assert_eq!(decoder.decode_to(TEXT.len()).unwrap(), TEXT);
        assert_eq!(decoder.bytes_consumed(), framed.len());
    }

    #[test]
    fn test_escape_char_persists() {
        let mut encoder = ReferenceEncoder::new();
        let first = encoder.payload(Some((3, 0)), Some(7), b"abc");
        let second = encoder.payload(None, None, b"abc");

        let mut decoder = PpmDecoder::new();
        assert_eq!(decoder.esc_char(), DEFAULT_ESC_CHAR);
        decoder.init(&first, 0).unwrap();
        assert_eq!(decoder.decode_to(3).unwrap(), b"abc");
        decoder.init(&second, 0).unwrap();
        assert_eq!(decoder.esc_char(), 7);
        assert_eq!(decoder.decode_to(3).unwrap(), b"abc");
    }

    #[test]
    fn test_custom_default_escape() {
        let decoder = PpmDecoder::with_options(DecoderOptions {
            default_esc_char: 0,
            ..DecoderOptions::default()
        });
        assert_eq!(decoder.esc_char(), 0);
    }

    #[test]
    fn test_strict_truncation() {
        let payload = ReferenceEncoder::new().payload(Some((6, 0)), None, TEXT);
        let cut = &payload[..payload.len() - 8];

        let mut decoder = PpmDecoder::new();
        decoder.init(cut, 0).unwrap();
        assert!(matches!(
            decoder.decode_to(TEXT.len()),
            Err(PpmError::TruncatedInput { .. })
        ));
        assert!(!decoder.is_active());
    }

    #[test]
    fn test_lenient_truncation_pads() {
        let payload = ReferenceEncoder::new().payload(Some((6, 0)), None, TEXT);
        let cut = &payload[..payload.len() - 8];

        let mut decoder = PpmDecoder::with_options(DecoderOptions {
            strict_eof: false,
            ..DecoderOptions::default()
        });
        decoder.init(cut, 0).unwrap();
        match decoder.decode_to(TEXT.len()) {
            Ok(bytes) => assert_eq!(bytes.len(), TEXT.len()),
            Err(e) => assert!(e.is_structural(), "{e}"),
        }
    }

    #[test]
    fn test_strict_priming_needs_four_bytes() {
        let mut decoder = PpmDecoder::new();
        assert!(matches!(
            decoder.init(&[0x21, 0x00, 0xAA], 0),
            Err(PpmError::TruncatedInput { needed: 3 })
        ));
        assert!(decoder.decode_byte().is_err());
    }

    #[test]
    fn test_header_errors() {
        let mut decoder = PpmDecoder::new();
        assert!(matches!(decoder.init(&[], 0), Err(PpmError::UnexpectedEof)));
        assert!(matches!(
            decoder.init(&[0x01, 0, 0, 0, 0], 0),
            Err(PpmError::ModelNotInitialized)
        ));
        assert!(matches!(
            decoder.init(&[0x20, 0x00, 0, 0, 0, 0], 0),
            Err(PpmError::InvalidOrder)
        ));
    }

    #[test]
    fn test_decode_without_session() {
        let mut decoder = PpmDecoder::new();
        assert!(matches!(
            decoder.decode_byte(),
            Err(PpmError::ModelNotInitialized)
        ));
    }

    #[test]
    fn test_reset_allows_continuation() {
        let mut encoder = ReferenceEncoder::new();
        encoder.payload(Some((1, 0)), None, b"");
        let payload = encoder.payload(None, None, TEXT);

        let mut decoder = PpmDecoder::new();
        decoder.reset();
        assert_eq!(decoder.max_order(), 2);
        decoder.init(&payload, 0).unwrap();
        assert_eq!(decoder.decode_to(TEXT.len()).unwrap(), TEXT);
    }

    #[test]
    fn test_failure_keeps_arena_for_continuation() {
        let mut decoder = PpmDecoder::new();
        decoder.init(&[0x21, 0x00, 0xFF, 0xFF, 0xFF, 0xFF], 0).unwrap();
        // Drain until the garbage trips an error or the payload runs out.
        let _ = decoder.decode_to(64);
        assert!(!decoder.is_active());

        let mut encoder = ReferenceEncoder::new();
        encoder.payload(Some((1, 0)), None, b"");
        let payload = encoder.payload(None, None, b"after");
        decoder.init(&payload, 0).unwrap();
        assert_eq!(decoder.decode_to(5).unwrap(), b"after");
    }
}
