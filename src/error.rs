//! Error types for PPMd decoding.
//!
//! This module provides the [`PpmError`] type which covers every failure a
//! decode session can report.
//!
//! ## Error Categories
//!
//! | Category | Errors | Description |
//! |----------|--------|-------------|
//! | Header | [`UnexpectedEof`], [`InvalidOrder`], [`ModelNotInitialized`] | The model header cannot be used |
//! | Memory | [`AllocationFailed`] | The arena is too small for a model reset |
//! | Structure | [`InvalidContext`], [`EscapeExhausted`], [`CountOutOfRange`], [`RangeUnderflow`] | Corrupt stream, the session is dead |
//! | Input | [`TruncatedInput`] | The range decoder ran out of payload bytes |
//! | Block | [`InvalidBackReference`] | An LZ/RLE command points before the output start |
//! | I/O | [`Io`] | Loading the payload failed |
//!
//! Only the structural errors and [`TruncatedInput`] occur while decoding
//! bytes. Memory exhaustion during a model update is not an error: the model
//! restarts and decoding continues.
//!
//! [`UnexpectedEof`]: PpmError::UnexpectedEof
//! [`InvalidOrder`]: PpmError::InvalidOrder
//! [`ModelNotInitialized`]: PpmError::ModelNotInitialized
//! [`AllocationFailed`]: PpmError::AllocationFailed
//! [`InvalidContext`]: PpmError::InvalidContext
//! [`EscapeExhausted`]: PpmError::EscapeExhausted
//! [`CountOutOfRange`]: PpmError::CountOutOfRange
//! [`RangeUnderflow`]: PpmError::RangeUnderflow
//! [`TruncatedInput`]: PpmError::TruncatedInput
//! [`InvalidBackReference`]: PpmError::InvalidBackReference
//! [`Io`]: PpmError::Io

use std::fmt;
use std::io;

/// Error type for PPMd operations.
///
/// # Example
///
/// ```rust
/// use rar_ppm::{PpmDecoder, PpmError};
///
/// let mut decoder = PpmDecoder::new();
/// // Reset flag with raw order 0 (effective order 1) is rejected.
/// match decoder.init(&[0x20, 0x00, 0, 0, 0, 0], 0) {
///     Err(PpmError::InvalidOrder) => {}
///     other => panic!("unexpected: {:?}", other),
/// }
/// ```
#[derive(Debug)]
pub enum PpmError {
    /// The model header ended before all its fields were read.
    UnexpectedEof,

    /// The header requested an effective model order of 1.
    ///
    /// PPMd needs at least an order-2 model; the allocator is released.
    InvalidOrder,

    /// A header without the reset flag arrived before any model existed.
    ModelNotInitialized,

    /// The arena could not hold the root context of a fresh model.
    AllocationFailed,

    /// A context or stats reference lies outside the live arena.
    InvalidContext {
        /// Offending arena offset.
        offset: u32,
    },

    /// Every context on the suffix chain escaped.
    EscapeExhausted,

    /// The coder produced a count outside the current frequency total.
    CountOutOfRange {
        /// Decoded count.
        count: u32,
        /// Total frequency of the context.
        scale: u32,
    },

    /// The coder range collapsed to zero.
    RangeUnderflow,

    /// The range decoder needed bytes past the end of the payload.
    TruncatedInput {
        /// Number of missing bytes substituted with zero.
        needed: usize,
    },

    /// A match copy reaches before the first produced byte.
    InvalidBackReference {
        /// Requested distance.
        distance: u32,
        /// Number of bytes produced so far.
        position: usize,
    },

    /// An I/O error occurred while loading a payload.
    Io(io::Error),
}

impl PpmError {
    /// Whether the error stems from corrupt coded data.
    ///
    /// The session ends and the model falls back to its minimal form; the
    /// next payload needs a new [`init`](crate::PpmDecoder::init).
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidContext { .. }
                | Self::EscapeExhausted
                | Self::CountOutOfRange { .. }
                | Self::RangeUnderflow
        )
    }
}

impl fmt::Display for PpmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "Unexpected end of PPMd header"),
            Self::InvalidOrder => write!(f, "Invalid PPMd model order"),
            Self::ModelNotInitialized => {
                write!(f, "PPMd continuation block without an initialized model")
            }
            Self::AllocationFailed => write!(f, "PPMd model memory allocation failed"),
            Self::InvalidContext { offset } => {
                write!(f, "Invalid PPMd context reference: {:#x}", offset)
            }
            Self::EscapeExhausted => write!(f, "PPMd escape past the root context"),
            Self::CountOutOfRange { count, scale } => {
                write!(f, "Range decoder count {} exceeds scale {}", count, scale)
            }
            Self::RangeUnderflow => write!(f, "Range decoder range underflow"),
            Self::TruncatedInput { needed } => {
                write!(f, "Compressed data truncated: {} byte(s) missing", needed)
            }
            Self::InvalidBackReference { distance, position } => {
                write!(
                    f,
                    "Invalid back reference: distance {} exceeds output position {}",
                    distance, position
                )
            }
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for PpmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PpmError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, PpmError>;
