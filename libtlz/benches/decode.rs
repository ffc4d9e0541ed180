use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use libtlz::stream::{compress_stream, decompress_stream};

fn decode_benchmark(c: &mut Criterion) {
    // moderately compressible data: repeated structure with noise
    let mut data = Vec::with_capacity(4 << 20);
    let mut state = 0x2545F491u32;
    while data.len() < 4 << 20 {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        data.extend_from_slice(b"some structured text ");
        data.push((state >> 24) as u8);
    }
    let mut compressed = Vec::new();
    compress_stream(&data[..], &mut compressed, 6).unwrap();

    let mut group = c.benchmark_group("member");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(data.len());
            decompress_stream(&compressed[..], &mut out, false).unwrap();
            out
        })
    });
    group.finish();
}

criterion_group!(benches, decode_benchmark);
criterion_main!(benches);
