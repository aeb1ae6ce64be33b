use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use pubsub_bridge_error::TransportError;
use tokio::sync::broadcast;

use super::SubscriptionId;

/// Структурированное диагностическое событие движка.
///
/// Ошибки, которые движок не возвращает вызывающему коду (освобождение
/// подписок, рассылка слушателям), публикуются здесь, а не только в лог.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// Создана подписка на уровне транспорта.
    Subscribed { channel: Arc<str> },
    /// Транспорт отказал в подписке.
    SubscribeFailed {
        channel: Arc<str>,
        error: TransportError,
    },
    /// Подписка на уровне транспорта снята.
    Disposed { channel: Arc<str> },
    /// Не удалось снять подписку на уровне транспорта.
    DisposeFailed {
        channel: Arc<str>,
        error: TransportError,
    },
    /// Слушатель запаниковал во время рассылки.
    ListenerPanicked {
        channel: Arc<str>,
        subscription_id: SubscriptionId,
        message: String,
    },
    /// Полезная нагрузка сообщения не является корректным JSON.
    DecodeFailed { channel: Arc<str>, reason: String },
}

/// Рассылка диагностических событий подписчикам.
pub(crate) struct Diagnostics {
    tx: broadcast::Sender<DiagnosticEvent>,
}

impl Diagnostics {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }

    /// Без подписчиков событие просто отбрасывается.
    pub(crate) fn emit(
        &self,
        event: DiagnosticEvent,
    ) {
        let _ = self.tx.send(event);
    }
}

/// Счётчики движка.
#[derive(Debug, Default)]
pub struct EngineStats {
    publishes: AtomicU64,
    dispatched: AtomicU64,
    listener_calls: AtomicU64,
    listener_failures: AtomicU64,
    decode_failures: AtomicU64,
    transport_subscribes: AtomicU64,
    subscribe_failures: AtomicU64,
    disposals: AtomicU64,
    dispose_failures: AtomicU64,
}

/// Снимок [`EngineStats`] на момент вызова.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub publishes: u64,
    pub dispatched: u64,
    pub listener_calls: u64,
    pub listener_failures: u64,
    pub decode_failures: u64,
    pub transport_subscribes: u64,
    pub subscribe_failures: u64,
    pub disposals: u64,
    pub dispose_failures: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub(crate) fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    record_publish => publishes,
    record_dispatch => dispatched,
    record_listener_call => listener_calls,
    record_listener_failure => listener_failures,
    record_decode_failure => decode_failures,
    record_transport_subscribe => transport_subscribes,
    record_subscribe_failure => subscribe_failures,
    record_disposal => disposals,
    record_dispose_failure => dispose_failures,
}
