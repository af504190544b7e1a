#![no_main]
use libfuzzer_sys::fuzz_target;
use rar_ppm::decode_text_block;

// Fuzz the escape protocol (LZ/RLE copies, filter codes, end markers).
fuzz_target!(|data: &[u8]| {
    let mut payload = data.to_vec();
    if payload.len() > 1 && payload[0] & 0x20 != 0 {
        payload[1] = 0;
    }
    let _ = decode_text_block(&payload, 1 << 16);
});
