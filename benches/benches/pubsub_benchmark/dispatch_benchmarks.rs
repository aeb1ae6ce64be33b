use std::{
    hint::black_box,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pubsub_bridge::{MemoryTransport, PubSubEngine};
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_publish_no_subscribers(c: &mut Criterion) {
    let rt = runtime();
    let _guard = rt.enter();
    let engine = PubSubEngine::new(Arc::new(MemoryTransport::new(1024)));
    let payload = json!({ "test": { "file": true } });

    c.bench_function("publish_0_subs", |b| {
        b.iter(|| engine.publish("chan", black_box(&payload)).unwrap())
    });
}

/// Публикация и доставка одного сообщения `n` слушателям.
fn bench_fan_out(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fan_out");

    for listeners in [1usize, 8, 64] {
        let engine = PubSubEngine::new(Arc::new(MemoryTransport::new(1024)));
        let delivered = Arc::new(AtomicUsize::new(0));
        rt.block_on(async {
            for _ in 0..listeners {
                let d = delivered.clone();
                engine
                    .subscribe_fn(
                        "fan",
                        move |_| {
                            d.fetch_add(1, Ordering::Relaxed);
                        },
                        None,
                    )
                    .await
                    .unwrap();
            }
        });

        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            &listeners,
            |b, &listeners| {
                b.to_async(&rt).iter(|| async {
                    let target = delivered.load(Ordering::Relaxed) + listeners;
                    engine.publish("fan", &json!({ "n": 1 })).unwrap();
                    while delivered.load(Ordering::Relaxed) < target {
                        tokio::task::yield_now().await;
                    }
                })
            },
        );
    }
    group.finish();
}

/// Публикация и получение значения через pull-адаптер.
fn bench_iterator_roundtrip(c: &mut Criterion) {
    let rt = runtime();
    let engine = PubSubEngine::new(Arc::new(MemoryTransport::new(1024)));
    let mut it = rt.block_on(async {
        let mut it = engine.async_iterator(["pull"]);
        it.subscribed().await.unwrap();
        it
    });

    c.bench_function("iterator_publish_next", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine.publish("pull", &json!(1)).unwrap();
                black_box(it.next().await.unwrap());
            })
        })
    });
}

criterion_group!(
    benches,
    bench_publish_no_subscribers,
    bench_fan_out,
    bench_iterator_roundtrip
);
criterion_main!(benches);
