//! Транспортный уровень (очередь сообщений).
//!
//! Движок Pub/Sub не знает, как устроена очередь: он видит только две
//! операции, описанные трейтом [`Transport`]:
//!
//! - `publish`: отправить полезную нагрузку в канал (fire-and-forget);
//! - `subscribe`: начать получать сообщения канала, получив взамен
//!   одноразовый [`Disposer`] для снятия подписки.
//!
//! `memory` содержит внутрипроцессную реализацию на `tokio::sync::broadcast`.

pub mod memory;

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use pubsub_bridge_error::TransportError;

pub use memory::MemoryTransport;

/// Сообщение, доставленное транспортом.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Arc<str>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(channel: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Обработчик входящих сообщений канала.
///
/// Транспорт вызывает его последовательно для каждой подписки: два вызова
/// одного обработчика не пересекаются.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Транспорт сообщений, поверх которого работает движок.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Отправить сообщение в канал. Доставку не ожидает.
    fn publish(
        &self,
        channel: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Подписаться на канал. Возвращает одноразовый [`Disposer`].
    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Disposer>, TransportError>;
}

/// Одноразовый дескриптор, снимающий подписку на уровне транспорта.
///
/// `dispose` потребляет `Box<Self>`, поэтому повторный вызов невозможен.
#[async_trait]
pub trait Disposer: Send + 'static {
    async fn dispose(self: Box<Self>) -> Result<(), TransportError>;
}

/// [`Disposer`] поверх замыкания.
pub struct FnDisposer {
    dispose: Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TransportError>> + Send>,
}

impl FnDisposer {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        Self {
            dispose: Box::new(move || Box::pin(f())),
        }
    }

    /// Упаковать замыкание сразу в `Box<dyn Disposer>`.
    pub fn boxed<F, Fut>(f: F) -> Box<dyn Disposer>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        Box::new(Self::new(f))
    }
}

#[async_trait]
impl Disposer for FnDisposer {
    async fn dispose(self: Box<Self>) -> Result<(), TransportError> {
        let this = *self;
        (this.dispose)().await
    }
}
