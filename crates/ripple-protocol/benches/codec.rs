//! Codec benchmarks for ripple-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ripple_protocol::{codec, Event};

fn bench_encode_text(c: &mut Criterion) {
    let event = Event::text_message("conv:bench", "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("text_64B", |b| b.iter(|| codec::encode(black_box(&event))));
    group.finish();
}

fn bench_decode_text(c: &mut Criterion) {
    let event = Event::text_message("conv:bench", "x".repeat(64));
    let encoded = codec::encode(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("text_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let event = Event::text_message("conv:bench:room", "x".repeat(256));

    c.bench_function("roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_text,
    bench_decode_text,
    bench_roundtrip
);
criterion_main!(benches);
