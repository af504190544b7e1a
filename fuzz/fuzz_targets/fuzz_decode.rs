#![no_main]
use libfuzzer_sys::fuzz_target;
use rar_ppm::{DecoderOptions, PpmDecoder};

// Fuzz the model header and symbol decoding with arbitrary bytes.
fuzz_target!(|data: &[u8]| {
    // Keep the arena small: clear the capacity byte after a reset header.
    let mut payload = data.to_vec();
    if payload.len() > 1 && payload[0] & 0x20 != 0 {
        payload[1] = 0;
    }

    let mut decoder = PpmDecoder::with_options(DecoderOptions {
        strict_eof: false,
        ..DecoderOptions::default()
    });
    if decoder.init(&payload, 0).is_err() {
        return;
    }

    // Cap output to prevent timeouts
    for _ in 0..(payload.len() * 8).min(1 << 16) {
        if decoder.decode_byte().is_err() {
            break;
        }
    }
});
