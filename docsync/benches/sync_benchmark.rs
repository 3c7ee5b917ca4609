use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use docsync::config::CheckpointTrigger;
use docsync::engine::text::{TextEngine, TextStep};
use docsync::engine::TransformEngine;
use docsync::protocol::{ClientId, LogEntry, Metadata, Selection};
use docsync::publish::{ClaimResult, Publisher};
use docsync::replay::replay;
use docsync::store::Fanout;
use std::hint::black_box;
use std::time::Duration;

fn typing_entries(engine: &TextEngine, count: usize) -> Vec<LogEntry> {
    (0..count)
        .map(|i| LogEntry {
            key: i as u64 + 1,
            operations: vec![engine.encode_operation(&TextStep::insert(i, "x")).unwrap()],
            origin: ClientId::new("typist"),
            metadata: Metadata::new(),
            write_timestamp: 0,
        })
        .collect()
}

fn bench_step_codec(c: &mut Criterion) {
    let engine = TextEngine::new(ClientId::new("bench"));
    let step = TextStep::replace(120, 128, "replacement text");

    c.bench_function("step_encode", |b| {
        b.iter(|| black_box(engine.encode_operation(black_box(&step)).unwrap()))
    });

    let encoded = engine.encode_operation(&step).unwrap();
    c.bench_function("step_decode", |b| {
        b.iter(|| black_box(engine.decode_operation(black_box(&encoded)).unwrap()))
    });
}

fn bench_rebase(c: &mut Criterion) {
    let engine = TextEngine::new(ClientId::new("local"));
    let base = engine.restore("lorem ipsum dolor sit amet ".repeat(40).as_bytes()).unwrap();

    // 50 pending local steps rebased over 10 remote ones
    let local: Vec<TextStep> = (0..50).map(|i| TextStep::insert(i * 7, "ab")).collect();
    let pending = engine.apply_local(&base, &local, None).unwrap();
    let remote: Vec<TextStep> = (0..10).map(|i| TextStep::delete(i * 30, i * 30 + 5)).collect();
    let origins = vec![ClientId::new("remote"); remote.len()];

    c.bench_function("rebase_50_over_10", |b| {
        b.iter(|| black_box(engine.apply_remote(&pending, &remote, &origins).unwrap()))
    });

    let mapping = engine.apply_remote(&pending, &remote, &origins).unwrap().mapping;
    c.bench_function("map_selection_through_mapping", |b| {
        b.iter(|| black_box(engine.map_selection(black_box(Selection::new(500, 540)), &mapping)))
    });
}

fn bench_replay(c: &mut Criterion) {
    let engine = TextEngine::new(ClientId::new("reader"));
    let entries = typing_entries(&engine, 1000);

    c.bench_function("replay_1k_entries", |b| {
        b.iter_batched(
            || entries.clone(),
            |entries| black_box(replay(&engine, engine.empty_state(), 0, entries).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_fanout(c: &mut Criterion) {
    let engine = TextEngine::new(ClientId::new("writer"));
    let entry = typing_entries(&engine, 1).remove(0);

    c.bench_function("fanout_1k_entries_x100_subscribers", |b| {
        b.iter(|| {
            let mut fanout = Fanout::new();
            let mut subs: Vec<_> = (0..100).map(|_| fanout.subscribe()).collect();
            for _ in 0..1000 {
                fanout.send(entry.clone());
            }
            for sub in &mut subs {
                while sub.try_recv().is_some() {}
            }
            black_box(fanout.stats());
        })
    });
}

fn bench_publisher(c: &mut Criterion) {
    let now = tokio::time::Instant::now();
    c.bench_function("publisher_claim_ack_cycle", |b| {
        b.iter(|| {
            let mut publisher =
                Publisher::new(Duration::from_secs(5), CheckpointTrigger::default());
            for key in 0..100u64 {
                publisher.decide(Some(vec![key]), key, now);
                publisher.complete(key + 1, ClaimResult::Committed, now);
                black_box(publisher.take_acknowledged(key + 1));
                publisher.note_applied();
            }
        })
    });
}

criterion_group!(
    benches,
    bench_step_codec,
    bench_rebase,
    bench_replay,
    bench_fanout,
    bench_publisher,
);
criterion_main!(benches);
