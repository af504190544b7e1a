//! PPMd (Prediction by Partial Matching, variant H) decoding.
//!
//! This implements the PPMd algorithm used by the RAR 2.9-4.x text mode.
//! Based on Dmitry Shkarin's PPMd implementation.

mod byte_reader;
mod model;
mod range_coder;
mod sub_alloc;


pub use byte_reader::ByteReader;
pub use model::{PpmModel, MAX_O};
pub use range_coder::{RangeCoder, SubRange, BOT, TOP};
pub use sub_alloc::{SubAllocator, MAX_UNITS, UNIT_SIZE};

#[cfg(test)]
pub(crate) use model::ReferenceEncoder;
