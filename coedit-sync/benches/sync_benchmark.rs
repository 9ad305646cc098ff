use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use coedit_sync::applier::{RemoteApplyFlag, RemoteChangeApplier};
use coedit_sync::broadcast::ChangeBroadcaster;
use coedit_sync::document::DocumentBuffer;
use coedit_sync::presence::PresenceTracker;
use coedit_sync::protocol::{change_args, ChangeEvent, CursorUpdate, EditSpan, PresenceUser};
use coedit_sync::transport::wamp::message::WampMessage;
use serde_json::json;

fn large_text() -> String {
    "fn main() {\n    println!(\"hello\");\n}\n".repeat(2_000)
}

fn bench_change_decode(c: &mut Criterion) {
    let change = ChangeEvent::RangeEdits {
        edits: vec![EditSpan::insert(10, "x"), EditSpan::delete(20, 25)],
    };
    let value = change.to_value();

    c.bench_function("change_decode_range_edits", |b| {
        b.iter(|| black_box(ChangeEvent::from_value(black_box(&value)).unwrap()))
    });
}

fn bench_buffer_apply(c: &mut Criterion) {
    let text = large_text();
    let spans = vec![EditSpan::insert(1_000, "let x = 1;"), EditSpan::delete(50_000, 50_010)];

    c.bench_function("buffer_apply_2_spans_70k_chars", |b| {
        let mut buffer = DocumentBuffer::new(&text);
        b.iter(|| {
            buffer.apply(black_box(&spans)).unwrap();
            buffer.apply(&[EditSpan::delete(1_000, 1_010), EditSpan::insert(50_000, "0123456789")]).unwrap();
        })
    });
}

fn bench_buffer_snapshot(c: &mut Criterion) {
    let buffer = DocumentBuffer::new(&large_text());

    c.bench_function("buffer_text_70k_chars", |b| b.iter(|| black_box(buffer.text())));
}

fn bench_local_edit_publication(c: &mut Criterion) {
    let broadcaster = ChangeBroadcaster::new("7", PresenceUser::new("1", "alice"));
    let spans = vec![EditSpan::insert(42, "a")];

    c.bench_function("local_edit_publication", |b| {
        b.iter(|| black_box(broadcaster.local_edit(black_box(&spans), false, true).unwrap()))
    });
}

fn bench_remote_apply(c: &mut Criterion) {
    let applier = RemoteChangeApplier::new("7", "1");
    let flag = RemoteApplyFlag::new();
    let insert = change_args(
        "7",
        &ChangeEvent::RangeEdits {
            edits: vec![EditSpan::insert(0, "ab")],
        },
        "2",
    );
    let delete = change_args(
        "7",
        &ChangeEvent::RangeEdits {
            edits: vec![EditSpan::delete(0, 2)],
        },
        "2",
    );

    c.bench_function("remote_apply_insert_delete", |b| {
        let mut buffer = DocumentBuffer::new(&large_text());
        b.iter(|| {
            black_box(applier.apply(&insert, &mut buffer, &flag, |_, _| {}));
            black_box(applier.apply(&delete, &mut buffer, &flag, |_, _| {}));
        })
    });
}

fn bench_cursor_decode(c: &mut Criterion) {
    let args = CursorUpdate {
        document_id: "7".into(),
        position: 1234,
        user_id: "2".into(),
        username: "bob".into(),
    }
    .to_args();

    c.bench_function("cursor_decode", |b| {
        b.iter(|| black_box(CursorUpdate::from_args(black_box(&args)).unwrap()))
    });
}

fn bench_presence_100_peers(c: &mut Criterion) {
    let users: Vec<PresenceUser> = (0..100)
        .map(|i| PresenceUser::new(format!("u{i}"), format!("user{i}")))
        .collect();

    c.bench_function("presence_join_leave_100", |b| {
        b.iter(|| {
            let mut tracker = PresenceTracker::new("me");
            for user in &users {
                black_box(tracker.user_joined(user));
            }
            for user in &users {
                black_box(tracker.user_left(user));
            }
        })
    });
}

fn bench_wamp_event_roundtrip(c: &mut Criterion) {
    let message = WampMessage::Event {
        subscription: 1,
        publication: 2,
        details: json!({}),
        args: change_args(
            "7",
            &ChangeEvent::RangeEdits {
                edits: vec![EditSpan::insert(10, "hello")],
            },
            "2",
        ),
    };

    c.bench_function("wamp_event_encode_decode", |b| {
        b.iter(|| {
            let text = message.encode();
            black_box(WampMessage::decode(black_box(&text)).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_change_decode,
    bench_buffer_apply,
    bench_buffer_snapshot,
    bench_local_edit_publication,
    bench_remote_apply,
    bench_cursor_decode,
    bench_presence_100_peers,
    bench_wamp_event_roundtrip,
);
criterion_main!(benches);
