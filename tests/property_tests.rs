//! Property-based tests для движка Pub/Sub.
//!
//! Проверяют, что каждый слушатель триггера получает все опубликованные
//! значения в порядке публикации, и что идентификаторы подписок не
//! повторяются при любой последовательности подписок и отписок.

use std::{collections::HashSet, sync::Arc, time::Duration};

use parking_lot::Mutex;
use proptest::prelude::*;
use pubsub_bridge::{MemoryTransport, PubSubEngine};
use serde_json::{json, Value};

const PROPTEST_CASES: u32 = 64;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Subscribe(u8),
    Unsubscribe(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Subscribe),
        any::<usize>().prop_map(Op::Unsubscribe),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: PROPTEST_CASES,
        ..ProptestConfig::default()
    })]

    /// Все слушатели получают все значения в порядке публикации.
    #[test]
    fn prop_fan_out_preserves_order(
        listeners in 1usize..6,
        values in prop::collection::vec(any::<i32>(), 0..24),
    ) {
        let received = runtime().block_on(async {
            let engine = PubSubEngine::new(Arc::new(MemoryTransport::new(256)));
            let sinks: Vec<Arc<Mutex<Vec<Value>>>> =
                (0..listeners).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

            for sink in &sinks {
                let sink = sink.clone();
                engine
                    .subscribe_fn("fan", move |v| sink.lock().push(v.clone()), None)
                    .await
                    .unwrap();
            }
            for v in &values {
                engine.publish("fan", &json!(v)).unwrap();
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while sinks.iter().any(|s| s.lock().len() < values.len())
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            sinks.iter().map(|s| s.lock().clone()).collect::<Vec<_>>()
        });

        let expected: Vec<Value> = values.iter().map(|v| json!(v)).collect();
        for got in received {
            prop_assert_eq!(got, expected.clone());
        }
    }

    /// Идентификаторы уникальны, а счётчики реестра соответствуют модели.
    #[test]
    fn prop_ids_unique_and_counts_consistent(
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        runtime().block_on(async {
            let engine = PubSubEngine::new(Arc::new(MemoryTransport::new(16)));
            let mut seen = HashSet::new();
            let mut live = Vec::new();

            for op in ops {
                match op {
                    Op::Subscribe(trigger) => {
                        let name = format!("t{trigger}");
                        let id = engine.subscribe_fn(name.as_str(), |_| {}, None).await.unwrap();
                        assert!(seen.insert(id), "id {id} reused");
                        live.push((id, name));
                    }
                    Op::Unsubscribe(index) if !live.is_empty() => {
                        let (id, _) = live.remove(index % live.len());
                        engine.unsubscribe(id).unwrap();
                        assert!(engine.unsubscribe(id).is_err());
                    }
                    Op::Unsubscribe(_) => {}
                }

                let channels: HashSet<&str> = live.iter().map(|(_, n)| n.as_str()).collect();
                assert_eq!(engine.subscription_count(), live.len());
                assert_eq!(engine.channel_count(), channels.len());
            }
        });
    }
}
