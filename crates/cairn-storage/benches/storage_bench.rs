//! Storage engine benchmarks
//!
//! Benchmarks in-memory frame operations (chunk append, index page split)
//! and engine-level row persistence and index inserts.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use cairn_common::testing::{fixtures, TestContext};
use cairn_common::types::{ChunkLocator, ChunkState, FileId, FrameId, ObjectId};
use cairn_storage::{encode_id, DataFrame, IndexFrame, StorageEngine, TableOptions};

fn frame_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_operations");

    for row_size in [16, 64, 256, 1024] {
        let data: Vec<u8> = (0..row_size).map(|i| (i % 256) as u8).collect();

        group.bench_with_input(BenchmarkId::new("append", row_size), &row_size, |b, _| {
            b.iter(|| {
                let mut frame = DataFrame::new(4096 - 64);
                let mut count = 0;
                while frame.append(ChunkState::Normal, ObjectId(1), &data).is_some() {
                    count += 1;
                }
                count
            })
        });

        group.bench_with_input(BenchmarkId::new("get", row_size), &row_size, |b, _| {
            let mut frame = DataFrame::new(4096 - 64);
            let mut pointers = Vec::new();
            while let Some(pointer) = frame.append(ChunkState::Normal, ObjectId(1), &data) {
                pointers.push(pointer);
            }
            b.iter(|| {
                for &pointer in &pointers {
                    criterion::black_box(frame.get(pointer).unwrap());
                }
            })
        });
    }

    group.bench_function("index_page_split", |b| {
        let target = ChunkLocator::new(FrameId::new(FileId(1), 64), 0);
        b.iter(|| {
            let mut page = IndexFrame::new(true);
            for k in 0..128u64 {
                page.insert_sorted(encode_id(k), target);
            }
            criterion::black_box(page.split().unwrap())
        })
    });

    group.finish();
}

fn engine_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_operations");
    group.sample_size(20);

    group.bench_function("persist_1000_rows", |b| {
        let rows = fixtures::rows(1000, 48);
        b.iter(|| {
            let ctx = TestContext::new();
            let engine = StorageEngine::open(ctx.engine_config(4096, 1 << 20, 1)).unwrap();
            let table = engine
                .create_table(TableOptions::data(ObjectId(10), "rows").non_transactional())
                .unwrap();
            for row in &rows {
                table.persist(&engine, row, None).unwrap();
            }
            table.frame_count()
        })
    });

    group.bench_function("index_insert_1000_keys", |b| {
        let target = ChunkLocator::new(FrameId::new(FileId(1), 64), 0);
        b.iter(|| {
            let ctx = TestContext::new();
            let engine = StorageEngine::open(ctx.engine_config(1024, 1 << 20, 1)).unwrap();
            let index = engine
                .create_table(TableOptions::index(ObjectId(11), "keys", true))
                .unwrap();
            for k in 0..1000u64 {
                index
                    .insert_key(&engine, encode_id(k.wrapping_mul(0x9E37_79B9)), target, None)
                    .unwrap();
            }
            Arc::strong_count(&index)
        })
    });

    group.finish();
}

criterion_group!(benches, frame_operations, engine_operations);
criterion_main!(benches);
