//! Benchmarks for PPMd decoding performance.
//!
//! Run with: `cargo bench`
//! Compare with baseline: `cargo bench -- --save-baseline main`
//! Compare against baseline: `cargo bench -- --baseline main`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rar_ppm::ppm::SubAllocator;
use rar_ppm::{DecoderOptions, PpmDecoder};

const OUTPUT_LEN: usize = 64 * 1024;

/// Reset header for `raw_order` on a 1 MiB arena followed by xorshift noise.
fn noise_payload(raw_order: u8, len: usize) -> Vec<u8> {
    let mut payload = vec![0x20 | raw_order, 0x00];
    let mut seed = 0x2545_F491u32;
    payload.extend((0..len).map(|_| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        (seed >> 24) as u8
    }));
    payload
}

/// Decode until `OUTPUT_LEN` bytes or the first error.
fn drain(payload: &[u8]) -> usize {
    let mut decoder = PpmDecoder::with_options(DecoderOptions {
        strict_eof: false,
        ..DecoderOptions::default()
    });
    if decoder.init(payload, 0).is_err() {
        return 0;
    }
    let mut produced = 0;
    while produced < OUTPUT_LEN && decoder.decode_byte().is_ok() {
        produced += 1;
    }
    produced
}

/// Benchmark the decode loop at several model orders.
///
/// Arbitrary bytes are a valid (if meaningless) PPMd stream, so this drives
/// symbol decoding, escapes and model growth without an encoder.
fn bench_decode_orders(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(OUTPUT_LEN as u64));

    for raw_order in [1u8, 5, 15, 31] {
        let payload = noise_payload(raw_order, OUTPUT_LEN);
        group.bench_with_input(BenchmarkId::new("noise", raw_order + 1), &payload, |b, payload| {
            b.iter(|| black_box(drain(black_box(payload))));
        });
    }

    group.finish();
}

/// Benchmark model setup (arena allocation and root context).
fn bench_init(c: &mut Criterion) {
    let payload = noise_payload(5, 4);
    c.bench_function("init_1mib", |b| {
        b.iter(|| {
            let mut decoder = PpmDecoder::new();
            black_box(decoder.init(black_box(&payload), 0))
        });
    });
}

/// Benchmark sub-allocator churn.
fn bench_sub_alloc(c: &mut Criterion) {
    let mut alloc = SubAllocator::new();
    alloc.start(1);

    c.bench_function("sub_alloc_churn", |b| {
        b.iter(|| {
            alloc.init();
            let mut live = Vec::with_capacity(1024);
            for i in 0..4096usize {
                let ptr = alloc.alloc_units(1 + i % 12);
                if ptr != 0 {
                    live.push((ptr, 1 + i % 12));
                }
                if i % 3 == 0 {
                    if let Some((ptr, nu)) = live.pop() {
                        alloc.free_units(ptr, nu);
                    }
                }
            }
            black_box(live.len())
        });
    });
}

criterion_group!(benches, bench_decode_orders, bench_init, bench_sub_alloc);
criterion_main!(benches);
