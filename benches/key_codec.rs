//! Hot-path benchmarks: key encoding and B-tree cursor traversal.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rook_core::{doc, OperationContext, RecordId, Value};
use rook_index::{encode_keys, BtreeCursor, BucketTree, IndexDescriptor, KeyPattern};
use rook_storage::{Direction, UnitOfWork};
use std::sync::Arc;

fn bench_encode(c: &mut Criterion) {
    let descriptor = IndexDescriptor::new(
        "a_1_b_1",
        KeyPattern::parse(&doc! { "a": 1, "b": (-1i32) }).unwrap(),
    );
    let document = doc! { "a": 12345, "b": "some string value" };
    c.bench_function("encode_compound_key", |b| {
        b.iter(|| encode_keys(black_box(&descriptor), black_box(&document)).unwrap())
    });
}

fn bench_cursor_scan(c: &mut Criterion) {
    let descriptor = Arc::new(IndexDescriptor::new(
        "a_1",
        KeyPattern::parse(&doc! { "a": 1 }).unwrap(),
    ));
    let tree = BucketTree::new("a_1");
    let mut uow = UnitOfWork::new();
    for i in 0..10_000 {
        let ks = encode_keys(&descriptor, &doc! { "a": i }).unwrap();
        tree.insert(
            &mut uow,
            &ks.keys[0].bytes,
            &ks.keys[0].type_bits,
            RecordId(i as i64 + 1),
            false,
        )
        .unwrap();
    }
    uow.commit();

    c.bench_function("cursor_full_scan_10k", |b| {
        b.iter(|| {
            let opctx = OperationContext::new();
            let mut cursor = BtreeCursor::open_range(
                tree.clone(),
                descriptor.clone(),
                &[],
                &[],
                true,
                Direction::Forward,
                &opctx,
            )
            .unwrap();
            let mut n = 0u32;
            while !cursor.is_eof() {
                n += 1;
                cursor.advance(&opctx).unwrap();
            }
            black_box(n)
        })
    });

    c.bench_function("cursor_point_seek", |b| {
        b.iter(|| {
            let opctx = OperationContext::new();
            let cursor = BtreeCursor::open_range(
                tree.clone(),
                descriptor.clone(),
                &[Value::Int32(5000)],
                &[Value::Int32(5000)],
                true,
                Direction::Forward,
                &opctx,
            )
            .unwrap();
            black_box(cursor.is_eof())
        })
    });
}

criterion_group!(benches, bench_encode, bench_cursor_scan);
criterion_main!(benches);
