use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tandem_collab::broadcast::BroadcastGroup;
use tandem_collab::document::ReplicatedDocument;
use tandem_collab::offline::{ChangeAction, MemoryStorage, OfflineQueue, QueueConfig};
use tandem_collab::presence::{AwarenessMessage, PresenceConfig, UserInfo};
use tandem_collab::protocol::{PeerInfo, SyncMessage};
use tandem_core::{Point, Shape, ShapePatch};
use uuid::Uuid;

fn new_document() -> ReplicatedDocument {
    ReplicatedDocument::new(Uuid::new_v4(), &UserInfo::new("bench", "Bench"), PresenceConfig::default())
}

// ─── Protocol benchmarks ───────────────────────────────────────

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let delta = vec![0u8; 64];

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(peer), "board", black_box(1), black_box(delta.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let msg = SyncMessage::delta(Uuid::new_v4(), "board", 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let cursor = AwarenessMessage::Cursor {
        position: Point::new(100.0, 200.0),
        timestamp: 42,
    };

    c.bench_function("cursor_awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(black_box(peer), "board", 1, black_box(&cursor)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

// ─── Document benchmarks ───────────────────────────────────────

fn bench_add_shape_tracked(c: &mut Criterion) {
    c.bench_function("add_shape_with_undo", |b| {
        let mut doc = new_document();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let shape = Shape::rectangle(format!("s{i}"), 0.0, 0.0, 100.0, 50.0);
            black_box(doc.add_shape_with_undo(shape).unwrap());
        })
    });
}

fn bench_update_and_apply_remote(c: &mut Criterion) {
    let mut local = new_document();
    let mut remote = new_document();
    for i in 0..100 {
        let update = local
            .add_shape(Shape::rectangle(format!("s{i}"), i as f64, 0.0, 10.0, 10.0))
            .unwrap();
        remote.apply_remote_update(&update).unwrap();
    }

    c.bench_function("update_shape_apply_remote_100", |b| {
        let mut x = 0.0;
        b.iter(|| {
            x += 1.0;
            let update = local.update_shape("s50", ShapePatch::position(x, x)).unwrap();
            remote.apply_remote_update(black_box(&update)).unwrap();
        })
    });
}

fn bench_handshake_diff(c: &mut Criterion) {
    let mut doc = new_document();
    for i in 0..1_000 {
        doc.add_shape(Shape::rectangle(format!("s{i}"), i as f64, 0.0, 10.0, 10.0))
            .unwrap();
    }
    let empty = new_document().state_vector();

    c.bench_function("diff_since_empty_1k_shapes", |b| {
        b.iter(|| {
            black_box(doc.diff_since(black_box(&empty)).unwrap());
        })
    });
}

// ─── Relay benchmarks ──────────────────────────────────────────

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(format!("u{i}"), format!("Peer{i}"));
                    receivers.push(group.add_peer(peer).await);
                }

                let data = Arc::new(vec![0u8; 64]);
                black_box(group.broadcast_raw(black_box(data)));
            });
        })
    });
}

// ─── Offline queue benchmarks ──────────────────────────────────

fn bench_offline_record(c: &mut Criterion) {
    let queue = OfflineQueue::open(MemoryStorage::new(), QueueConfig { capacity: 100 });
    queue.set_offline_mode(true);
    let action = ChangeAction::AddShape(Shape::rectangle("s1", 0.0, 0.0, 100.0, 50.0));

    c.bench_function("offline_record_full_queue_100", |b| {
        b.iter(|| {
            black_box(queue.record(black_box(&action), "bench").unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_cursor_encode,
    bench_add_shape_tracked,
    bench_update_and_apply_remote,
    bench_handshake_diff,
    bench_broadcast_raw,
    bench_offline_record,
);
criterion_main!(benches);
