//! Transaction manager benchmarks
//!
//! Benchmarks the transaction lifecycle: begin, tracked writes, commit and
//! rollback, plus versioned reads against an open writer.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use cairn_common::testing::{fixtures, TestContext};
use cairn_common::types::{ObjectId, TransactionType};
use cairn_storage::{StorageEngine, TableOptions, WriteTracker};
use cairn_txn::TransactionManager;

fn setup(ctx: &TestContext) -> (TransactionManager, Arc<cairn_storage::Table>) {
    let engine = Arc::new(StorageEngine::open(ctx.engine_config(4096, 1 << 20, 2)).unwrap());
    let table = engine.create_table(TableOptions::data(ObjectId(10), "rows")).unwrap();
    (TransactionManager::new(engine), table)
}

fn transaction_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction_lifecycle");
    group.sample_size(20);

    for (label, kind) in [
        ("read_committed", TransactionType::ReadCommitted),
        ("serializable", TransactionType::Serializable),
    ] {
        let ctx = TestContext::new();
        let (mgr, _) = setup(&ctx);
        group.bench_with_input(BenchmarkId::new("begin_commit", label), &label, |b, _| {
            b.iter(|| {
                let txn = mgr.begin(kind).unwrap();
                mgr.commit(&txn).unwrap();
            })
        });
    }

    for rows in [10usize, 100] {
        let ctx = TestContext::new();
        let (mgr, table) = setup(&ctx);
        let payloads = fixtures::rows(rows, 64);

        group.bench_with_input(BenchmarkId::new("persist_commit", rows), &rows, |b, _| {
            b.iter(|| {
                let txn = mgr.begin(TransactionType::ReadCommitted).unwrap();
                for row in &payloads {
                    table
                        .persist(mgr.engine(), row, Some(txn.as_ref() as &dyn WriteTracker))
                        .unwrap();
                }
                mgr.commit(&txn).unwrap();
            })
        });

        group.bench_with_input(BenchmarkId::new("persist_rollback", rows), &rows, |b, _| {
            b.iter(|| {
                let txn = mgr.begin(TransactionType::ReadCommitted).unwrap();
                for row in &payloads {
                    table
                        .persist(mgr.engine(), row, Some(txn.as_ref() as &dyn WriteTracker))
                        .unwrap();
                }
                mgr.rollback(&txn).unwrap();
            })
        });
    }

    group.finish();
}

fn versioned_reads(c: &mut Criterion) {
    let ctx = TestContext::new();
    let (mgr, table) = setup(&ctx);
    let locators: Vec<_> = fixtures::rows(200, 64)
        .iter()
        .map(|row| table.persist(mgr.engine(), row, None).unwrap())
        .collect();

    let writer = mgr.begin(TransactionType::ReadCommitted).unwrap();
    for (i, locator) in locators.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
        table
            .update(
                mgr.engine(),
                *locator,
                &fixtures::row(i as u64 + 1000, 64),
                Some(writer.as_ref() as &dyn WriteTracker),
            )
            .unwrap();
    }

    c.bench_function("scan_visible_half_locked", |b| {
        b.iter(|| {
            let reader = mgr.begin(TransactionType::Fixed).unwrap();
            let seen = mgr.scan_visible(&reader, &table).unwrap().len();
            mgr.commit(&reader).unwrap();
            seen
        })
    });

    mgr.rollback(&writer).unwrap();
}

criterion_group!(benches, transaction_lifecycle, versioned_reads);
criterion_main!(benches);
