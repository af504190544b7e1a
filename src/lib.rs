//! PPMd text-mode decoding for RAR 2.9-4.x.
//!
//! RAR compresses small text payloads such as archive comments with PPMd
//! variant H and a carryless range coder. This crate decodes such payloads.
//!
//! ## Layers
//!
//! | Type | Role |
//! |------|------|
//! | [`PpmModel`] | Context model with its arena sub-allocator |
//! | [`PpmDecoder`] | Session: header parsing, range decoder, one byte per call |
//! | [`PpmBlockDecoder`] | RAR escape protocol (literal escape, LZ, RLE, end markers) |
//!
//! ## Features
//! - Core library has **zero dependencies**
//! - `async` - Async payload loading with tokio
//! - `wasm` - Browser WASM bindings
//! - `logging` - Diagnostics through the `log` crate
//!
//! ## Example
//!
//! ```rust
//! use rar_ppm::{BlockEnd, PpmBlockDecoder, PpmDecoder};
//!
//! let mut block = PpmBlockDecoder::new(PpmDecoder::new());
//! // Reset, order 2, 1 MiB, four priming bytes.
//! block.init(&[0x21, 0x00, 0x00, 0x00, 0x00, 0x00], 0).unwrap();
//! let mut out = Vec::new();
//! let end = block.decode(&mut out, 0).unwrap();
//! assert_eq!(end, BlockEnd::LimitReached);
//! ```

#[macro_use]
mod log;

mod block;
mod decoder;
pub mod error;
mod file_media;
pub mod ppm;

#[cfg(feature = "wasm")]
mod wasm_bindings;

pub use block::{decode_text_block, BlockEnd, FilterCode, PpmBlockDecoder};
pub use decoder::{DecoderOptions, PpmDecoder, DEFAULT_ESC_CHAR};
pub use error::{PpmError, Result};
pub use file_media::{decode_media_range, LocalFileMedia, ReadInterval};
pub use ppm::PpmModel;

#[cfg(feature = "async")]
pub use file_media::{decode_media_range_async, FileMedia};

// Re-export WASM bindings when feature is enabled
#[cfg(feature = "wasm")]
pub use wasm_bindings::*;
