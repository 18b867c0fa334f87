//! Performance benchmarks for bulkxfer
//!
//! Run with: cargo bench

use bulkxfer::config::{HashAlgorithm, TransferConfig};
use bulkxfer::core::{TransferRequest, TransferSession};
use bulkxfer::sync::TransferCache;
use bulkxfer::transport::{LocalObjectStore, TransportSelector};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

/// Create a test file of the specified size
fn create_test_file(dir: &std::path::Path, name: &str, size: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();

    let chunk_size = 64 * 1024;
    let chunk: Vec<u8> = (0..chunk_size).map(|i| (i % 251) as u8).collect();
    let mut remaining = size;

    while remaining > 0 {
        let to_write = remaining.min(chunk_size);
        file.write_all(&chunk[..to_write]).unwrap();
        remaining -= to_write;
    }

    path
}

fn bench_plan_parts(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_parts");
    let config = TransferConfig::default();

    for size in [64u64 << 20, 10u64 << 30, 1u64 << 40] {
        group.bench_with_input(
            BenchmarkId::new("for_transfer", humansize::format_size(size, humansize::BINARY)),
            &size,
            |b, &size| {
                b.iter(|| black_box(bulkxfer::chunk::PartPlan::for_transfer(size, 8, &config).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_part_digests(c: &mut Criterion) {
    let mut group = c.benchmark_group("part_digest");

    let part_size = 8 * 1024 * 1024; // one default-sized part
    let data: Vec<u8> = (0..part_size).map(|i| (i % 256) as u8).collect();

    group.throughput(Throughput::Bytes(part_size as u64));

    for algo in [
        HashAlgorithm::XXHash3,
        HashAlgorithm::XXHash64,
        HashAlgorithm::Blake3,
        HashAlgorithm::Sha256,
    ] {
        group.bench_with_input(BenchmarkId::new("hash", algo.name()), &data, |b, data| {
            b.iter(|| black_box(bulkxfer::hash::hash_bytes(data, algo)));
        });
    }

    group.finish();
}

fn bench_local_upload(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_upload");
    group.sample_size(10);

    for size in [4 * 1024 * 1024, 64 * 1024 * 1024] {
        let dir = TempDir::new().unwrap();
        let file = create_test_file(dir.path(), "payload.bin", size);
        let store = Arc::new(LocalObjectStore::open(dir.path().join("store")).unwrap());

        let config = TransferConfig {
            min_part_size: 1024 * 1024,
            multipart_threshold: 2 * 1024 * 1024,
            hash_algorithm: HashAlgorithm::XXHash3,
            ..Default::default()
        };

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("multipart", humansize::format_size(size as u64, humansize::BINARY)),
            &size,
            |b, _| {
                b.iter(|| {
                    // Fresh in-memory cache so every iteration really transfers
                    let selector = TransportSelector::new(&config).with_managed(store.clone());
                    let session = TransferSession::new(
                        config.clone(),
                        Arc::new(TransferCache::in_memory()),
                        selector,
                    )
                    .unwrap();
                    black_box(
                        session
                            .transfer(&TransferRequest::upload(&file, "bench/payload.bin"))
                            .unwrap(),
                    )
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_plan_parts, bench_part_digests, bench_local_upload);

criterion_main!(benches);
