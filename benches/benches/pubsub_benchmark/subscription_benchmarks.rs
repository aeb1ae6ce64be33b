use std::{hint::black_box, sync::Arc};

use criterion::{criterion_group, criterion_main, Criterion};
use pubsub_bridge::{MemoryTransport, PubSubEngine};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Подписка на уже активный канал: без обращения к транспорту.
fn bench_subscribe_shared_channel(c: &mut Criterion) {
    let rt = runtime();
    let engine = PubSubEngine::new(Arc::new(MemoryTransport::new(64)));
    let _anchor = rt
        .block_on(engine.subscribe_fn("chan", |_| {}, None))
        .unwrap();

    c.bench_function("subscribe_unsubscribe_shared", |b| {
        b.iter(|| {
            let id = rt
                .block_on(engine.subscribe_fn("chan", |_| {}, None))
                .unwrap();
            engine.unsubscribe(black_box(id)).unwrap();
        })
    });
}

/// Полный цикл: подписка транспорта и её освобождение.
fn bench_subscribe_fresh_channel(c: &mut Criterion) {
    let rt = runtime();
    let engine = PubSubEngine::new(Arc::new(MemoryTransport::new(64)));

    c.bench_function("subscribe_unsubscribe_fresh", |b| {
        b.to_async(&rt).iter(|| async {
            let id = engine.subscribe_fn("fresh", |_| {}, None).await.unwrap();
            engine.unsubscribe(black_box(id)).unwrap();
            engine.drain_disposals().await;
        })
    });
}

criterion_group!(
    benches,
    bench_subscribe_shared_channel,
    bench_subscribe_fresh_channel
);
criterion_main!(benches);
