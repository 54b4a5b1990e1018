use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use forma_collab::broadcast::BroadcastGroup;
use forma_collab::presence::{PresenceState, PresenceTracker};
use forma_collab::protocol::{decode_snapshot, encode_snapshot, Message};
use forma_core::{Document, OpKind, Operation};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

fn insert_message() -> Message {
    let op = Operation::new(
        OpKind::Insert {
            position: 12,
            text: "Email address".into(),
        },
        Uuid::new_v4(),
        "alice",
        42,
    );
    Message::operation(Uuid::new_v4(), op, 41)
}

fn bench_message_encode(c: &mut Criterion) {
    let msg = insert_message();
    c.bench_function("operation_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let encoded = insert_message().encode().unwrap();
    c.bench_function("operation_decode", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_compress(c: &mut Criterion) {
    let text = "field: name, type: text, required: true\n".repeat(256);
    let snapshot = Document::from_text(Uuid::new_v4(), &text).snapshot();

    c.bench_function("snapshot_encode_10KB", |b| {
        b.iter(|| black_box(encode_snapshot(black_box(&snapshot)).unwrap()))
    });

    let encoded = encode_snapshot(&snapshot).unwrap();
    c.bench_function("snapshot_decode_10KB", |b| {
        b.iter(|| black_box(decode_snapshot(black_box(&encoded)).unwrap()))
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = BroadcastGroup::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(1024);
        group.add_peer(&format!("peer{i}"), i, tx);
        receivers.push(rx);
    }
    let frame = Arc::new(vec![0u8; 64]);

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast(frame.clone(), Some("peer0")));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_cursor_transform(c: &mut Criterion) {
    let room = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let mut tracker = PresenceTracker::new(room);
    for i in 0..50 {
        let user = format!("user{i}");
        tracker.update_presence(&user, PresenceState::Online);
        tracker.update_cursor(&user, doc, i * 10);
    }
    let op = Operation::new(OpKind::Insert { position: 0, text: "x".into() }, doc, "author", 1);

    c.bench_function("transform_50_cursors", |b| {
        b.iter(|| tracker.transform_cursors(black_box(&op)))
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_snapshot_compress,
    bench_broadcast,
    bench_cursor_transform,
);
criterion_main!(benches);
