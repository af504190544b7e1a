//! WASM bindings for rar-ppm.
//!
//! Provides a browser-compatible API for decoding PPMd text blocks.

use wasm_bindgen::prelude::*;

use crate::block::{BlockEnd, PpmBlockDecoder};
use crate::decoder::PpmDecoder;

/// WASM-compatible PPMd text block decoder.
#[wasm_bindgen]
pub struct WasmPpmDecoder {
    block: PpmBlockDecoder,
    finished: bool,
}

#[wasm_bindgen]
impl WasmPpmDecoder {
    /// Create a new decoder.
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        Self {
            block: PpmBlockDecoder::new(PpmDecoder::new()),
            finished: false,
        }
    }

    /// Decode a text block, producing at most `max_len` bytes.
    #[wasm_bindgen]
    pub fn decode(&mut self, data: &[u8], max_len: usize) -> Result<Vec<u8>, JsError> {
        self.block
            .init(data, 0)
            .map_err(|e| JsError::new(&e.to_string()))?;
        let mut out = Vec::new();
        let end = self
            .block
            .decode(&mut out, max_len)
            .map_err(|e| JsError::new(&e.to_string()))?;
        self.finished = end != BlockEnd::LimitReached;
        Ok(out)
    }

    /// Escape character of the last block.
    #[wasm_bindgen(js_name = escChar)]
    pub fn esc_char(&self) -> u8 {
        self.block.session().esc_char()
    }

    /// Check if the last block ended before the length limit.
    #[wasm_bindgen(js_name = isComplete)]
    pub fn is_complete(&self) -> bool {
        self.finished
    }

    /// Reset the model for a new stream.
    #[wasm_bindgen]
    pub fn reset(&mut self) {
        self.block.session_mut().reset();
        self.finished = false;
    }
}

impl Default for WasmPpmDecoder {
    fn default() -> Self {
        Self::new()
    }
}
