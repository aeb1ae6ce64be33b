use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use pubsub_bridge_error::TransportError;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{trace, warn};

use super::{Disposer, Message, MessageHandler, Transport};
use crate::config::ConnectionConfig;

type ChannelKey = Arc<str>;
type Channels = DashMap<ChannelKey, broadcast::Sender<Message>>;

/// Внутрипроцессный транспорт на `tokio::sync::broadcast`.
///
/// Поддерживает:
/// - точные подписки по имени канала
/// - доставку сообщений в порядке публикации для каждой подписки
/// - автоматическое удаление пустых каналов
/// - статистику публикаций, отправок без получателей и отставаний
pub struct MemoryTransport {
    /// Точные каналы → `Sender`
    channels: Arc<Channels>,
    /// Ёмкость буфера каждого `broadcast::channel`
    capacity: usize,
    /// Общее количество вызовов `publish`
    pub publish_count: AtomicUsize,
    /// Количество неудачных `send` (нет подписчиков)
    pub send_error_count: AtomicUsize,
    /// Сообщения, потерянные отставшими получателями
    lagged_count: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Создаёт новый `MemoryTransport` с заданной буферной ёмкостью.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            publish_count: AtomicUsize::new(0),
            send_error_count: AtomicUsize::new(0),
            lagged_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Создаёт транспорт по параметрам соединения.
    ///
    /// Сетевой адрес здесь не используется, он только попадает в лог.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        trace!(
            endpoint = %config.endpoint(),
            capacity = config.channel_capacity,
            "creating in-memory transport"
        );
        Self::new(config.channel_capacity)
    }

    /// Есть ли канал с хотя бы одним `Sender`.
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Количество активных получателей канала.
    pub fn receiver_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Сколько сообщений пропустили отставшие получатели.
    pub fn lagged_count(&self) -> u64 {
        self.lagged_count.load(Ordering::Relaxed)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    /// Публикация сообщения в канал.
    ///
    /// Если у канала нет подписчиков, увеличивает `send_error_count`.
    /// Публикация в несуществующий канал не создаёт его.
    fn publish(
        &self,
        channel: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        let Some(entry) = self.channels.get(channel) else {
            return Ok(());
        };
        let tx = entry.value().clone();
        let msg = Message::new(entry.key().clone(), payload);
        drop(entry);

        if tx.send(msg).is_err() {
            self.send_error_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Подписка на канал.
    ///
    /// Каждая подписка получает собственный `Receiver` и задачу, которая
    /// последовательно передаёт сообщения обработчику.
    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Disposer>, TransportError> {
        let key: ChannelKey = Arc::from(channel);
        let mut rx = self
            .channels
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let lagged = Arc::clone(&self.lagged_count);
        let task_channel = key.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => handler(msg),
                    Err(RecvError::Lagged(n)) => {
                        warn!(channel = %task_channel, missed = n, "subscriber lagged behind");
                        lagged.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Box::new(MemoryDisposer {
            channel: key,
            channels: Arc::downgrade(&self.channels),
            task,
        }))
    }
}

/// Снимает подписку `MemoryTransport`: останавливает задачу доставки и
/// удаляет канал, если у него не осталось получателей.
struct MemoryDisposer {
    channel: ChannelKey,
    channels: Weak<Channels>,
    task: JoinHandle<()>,
}

#[async_trait]
impl Disposer for MemoryDisposer {
    async fn dispose(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;

        this.task.abort();
        // Ждём завершения, чтобы `Receiver` был гарантированно освобождён.
        let _ = (&mut this.task).await;

        if let Some(channels) = this.channels.upgrade() {
            channels.remove_if(&this.channel, |_, tx| tx.receiver_count() == 0);
        }
        trace!(channel = %this.channel, "in-memory subscription disposed");
        Ok(())
    }
}

impl Drop for MemoryDisposer {
    /// Сброшенный без `dispose` дескриптор всё равно останавливает доставку.
    fn drop(&mut self) {
        self.task.abort();
    }
}
