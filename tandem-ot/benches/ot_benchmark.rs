use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tandem_ot::{apply, transform, DocumentSession, Operation};
use uuid::Uuid;

fn bench_apply_insert(c: &mut Criterion) {
    let buffer = "x".repeat(64 * 1024);
    let author = Uuid::new_v4();

    c.bench_function("apply_insert_64KB", |b| {
        b.iter(|| {
            let op = Operation::insert(32 * 1024, "hello", author, 0);
            black_box(apply(black_box(&buffer), &op));
        })
    });
}

fn bench_apply_delete(c: &mut Criterion) {
    let buffer = "x".repeat(64 * 1024);
    let author = Uuid::new_v4();

    c.bench_function("apply_delete_64KB", |b| {
        b.iter(|| {
            let op = Operation::delete(32 * 1024, 128, author, 0);
            black_box(apply(black_box(&buffer), &op));
        })
    });
}

fn bench_transform_pair(c: &mut Criterion) {
    let a = Operation::insert(100, "concurrent edit", Uuid::new_v4(), 7);
    let b = Operation::delete(40, 25, Uuid::new_v4(), 7);

    c.bench_function("transform_pair", |bench| {
        bench.iter(|| {
            black_box(transform(black_box(&a), black_box(&b)));
        })
    });
}

fn bench_receive_with_pending(c: &mut Criterion) {
    let mut base =
        DocumentSession::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "doc text", 0);
    for i in 0..10 {
        base.submit_insert(i, "a");
    }
    let remote_author = Uuid::new_v4();

    c.bench_function("receive_remote_10_pending", |b| {
        b.iter(|| {
            let mut session = base.clone();
            let op = Operation::insert(4, "!", remote_author, 0);
            black_box(session.receive_remote(black_box(op)));
        })
    });
}

fn bench_submit_ack_cycle(c: &mut Criterion) {
    c.bench_function("submit_ack_cycle", |b| {
        b.iter(|| {
            let mut session =
                DocumentSession::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "doc", 0);
            let op = session.submit_insert(3, "!");
            black_box(session.acknowledge(op.id));
        })
    });
}

fn bench_checksum(c: &mut Criterion) {
    let session = DocumentSession::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        "x".repeat(64 * 1024),
        0,
    );

    c.bench_function("checksum_64KB", |b| {
        b.iter(|| {
            black_box(session.checksum());
        })
    });
}

criterion_group!(
    benches,
    bench_apply_insert,
    bench_apply_delete,
    bench_transform_pair,
    bench_receive_with_pending,
    bench_submit_ack_cycle,
    bench_checksum
);
criterion_main!(benches);
