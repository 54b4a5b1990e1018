use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use forma_core::{AuthoritativeDocument, Document, Engine, OpKind, Operation};
use uuid::Uuid;

fn bench_transform_pair(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let a = Operation::new(OpKind::Insert { position: 40, text: "label".into() }, doc, "alice", 1);
    let b = Operation::new(OpKind::Delete { position: 10, length: 50 }, doc, "bob", 1);

    c.bench_function("transform_insert_vs_delete", |bench| {
        bench.iter(|| black_box(forma_core::transform(black_box(&a), black_box(&b))))
    });
}

fn bench_remote_against_pending(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let base = Document::from_text(doc, &"x".repeat(1_000));

    c.bench_function("apply_remote_50_pending", |bench| {
        bench.iter_batched(
            || {
                let mut engine = Engine::new("alice", base.clone());
                for i in 0..50 {
                    engine
                        .apply_local(OpKind::Insert { position: i * 10, text: "ab".into() })
                        .unwrap();
                }
                let remote = Operation::new(
                    OpKind::Delete { position: 200, length: 100 },
                    doc,
                    "bob",
                    1,
                );
                (engine, remote)
            },
            |(mut engine, remote)| black_box(engine.apply_remote(remote).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_sequence_1000(c: &mut Criterion) {
    let doc = Uuid::new_v4();

    c.bench_function("authority_sequence_1000_ops", |bench| {
        bench.iter(|| {
            let mut room = AuthoritativeDocument::new(Document::new(doc), 1000);
            for v in 0..1000u64 {
                let op = Operation::new(
                    OpKind::Insert { position: 0, text: "q".into() },
                    doc,
                    if v % 2 == 0 { "alice" } else { "bob" },
                    v + 1,
                )
                .rebased(v.saturating_sub(3));
                black_box(room.apply_sequenced(op).unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_transform_pair, bench_remote_against_pending, bench_sequence_1000);
criterion_main!(benches);
