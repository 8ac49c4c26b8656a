//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! These cover the per-byte work of an upload: segmenting buffers into
//! aligned chunks, hashing them, and combining CRC32C values.

use bidi_storage::checksum::{ChunkSegmenter, Crc32cLengthKnown, Hasher, StreamingSegmenter};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

/// Benchmark ChunkSegmenter::segment_buffers over differently shaped input
fn bench_segment_buffers(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_buffers");

    for (label, buffers) in [
        ("one_1mib", vec![Bytes::from(vec![7u8; 1 << 20])]),
        ("64x16kib", (0..64).map(|_| Bytes::from(vec![7u8; 16 << 10])).collect()),
        ("1000x1kib", (0..1000).map(|_| Bytes::from(vec![7u8; 1024])).collect()),
    ] {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        group.throughput(Throughput::Bytes(total as u64));

        for enabled in [true, false] {
            let segmenter = match ChunkSegmenter::new(Hasher::new(enabled), 256 << 10, 256 << 10) {
                Ok(s) => s,
                Err(e) => panic!("invalid segmenter: {}", e),
            };
            let name = format!("{}_crc_{}", label, if enabled { "on" } else { "off" });
            group.bench_function(name, |b| {
                b.iter(|| segmenter.segment_buffers(black_box(&buffers)))
            });
        }
    }

    group.finish();
}

/// Benchmark the streaming segmenter with small writes, the common pattern
/// for appendable uploads
fn bench_streaming_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("streaming_push");

    for write_len in [100usize, 4096, 65536] {
        let data = Bytes::from(vec![3u8; write_len]);
        group.throughput(Throughput::Bytes(write_len as u64 * 256));

        group.bench_function(format!("write_len_{}", write_len), |b| {
            b.iter(|| {
                let segmenter = match ChunkSegmenter::new(Hasher::new(true), 64 << 10, 16 << 10) {
                    Ok(s) => s,
                    Err(e) => panic!("invalid segmenter: {}", e),
                };
                let mut streaming = StreamingSegmenter::new(segmenter, 16 << 10);
                let mut emitted = 0;
                for _ in 0..256 {
                    emitted += streaming.push(black_box(data.clone())).len();
                }
                emitted + streaming.finish().len()
            })
        });
    }

    group.finish();
}

/// Benchmark CRC32C combination, done once per acknowledged segment
fn bench_crc_concat(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc_concat");
    group.throughput(Throughput::Elements(1));

    let left = Crc32cLengthKnown::of_bytes(&[1u8; 4096]);
    for right_len in [64usize, 256 << 10, 16 << 20] {
        let right = Crc32cLengthKnown::new(0xdead_beef, right_len as u64);
        group.bench_function(format!("right_len_{}", right_len), |b| {
            b.iter(|| black_box(left).concat(black_box(right)))
        });
    }

    group.bench_function("fold_1000", |b| {
        let parts: Vec<Crc32cLengthKnown> = (0..1000u32)
            .map(|i| Crc32cLengthKnown::new(i.wrapping_mul(2_654_435_761), 256 << 10))
            .collect();
        b.iter(|| {
            parts
                .iter()
                .fold(Crc32cLengthKnown::new(0, 0), |acc, p| acc.concat(*p))
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_segment_buffers,
    bench_streaming_push,
    bench_crc_concat,
);
criterion_main!(benches);
