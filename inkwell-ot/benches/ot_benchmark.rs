use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use inkwell_ot::{apply_operation, compose_operations, transform_operation, Operation};

fn bench_transform_insert_insert(c: &mut Criterion) {
    let a = Operation::insert(500, "hello");
    let b = Operation::insert(120, "world");

    c.bench_function("transform_insert_insert", |bench| {
        bench.iter(|| black_box(transform_operation(black_box(&a), black_box(&b)).unwrap()))
    });
}

fn bench_transform_delete_delete(c: &mut Criterion) {
    let a = Operation::delete(300, 40).unwrap();
    let b = Operation::delete(280, 50).unwrap();

    c.bench_function("transform_delete_delete", |bench| {
        bench.iter(|| black_box(transform_operation(black_box(&a), black_box(&b)).unwrap()))
    });
}

fn bench_apply_insert_10k(c: &mut Criterion) {
    let content = "lorem ipsum ".repeat(1_000);
    let op = Operation::insert(6_000, "dolor");

    c.bench_function("apply_insert_10k_chars", |bench| {
        bench.iter(|| black_box(apply_operation(black_box(&content), black_box(&op)).unwrap()))
    });
}

fn bench_rebase_through_log(c: &mut Criterion) {
    // A late operation rebased past 100 concurrent edits.
    let log: Vec<Operation> = (0..100)
        .map(|i| Operation::insert(i * 3, "ab"))
        .collect();
    let incoming = Operation::insert(150, "x");

    c.bench_function("rebase_through_100_ops", |bench| {
        bench.iter(|| {
            let mut op = incoming.clone();
            for applied in &log {
                op = transform_operation(&op, applied).unwrap();
            }
            black_box(op)
        })
    });
}

fn bench_compose_typing(c: &mut Criterion) {
    let a = Operation::insert(10, "hel");
    let b = Operation::insert(13, "lo");

    c.bench_function("compose_adjacent_inserts", |bench| {
        bench.iter(|| black_box(compose_operations(black_box(&a), black_box(&b)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_transform_insert_insert,
    bench_transform_delete_delete,
    bench_apply_insert_10k,
    bench_rebase_through_log,
    bench_compose_typing,
);
criterion_main!(benches);
