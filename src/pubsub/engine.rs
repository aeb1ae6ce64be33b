//! Движок Pub/Sub поверх транспорта сообщений.
//!
//! Одна подписка транспорта на канал разделяется всеми подписками
//! приложения на этот канал. Первая подписка создаёт её, последняя отписка
//! освобождает. Пока транспортная подписка создаётся, новые подписки на тот
//! же канал присоединяются к ней и получают тот же результат.

use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use pubsub_bridge_error::{ErrorExt, LogLevel, PubSubError, TransportError};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use super::{
    diagnostics::{DiagnosticEvent, Diagnostics, EngineStats, StatsSnapshot},
    iterator::{IteratorOptions, PubSubIterator},
    registry::{
        Admission, Listener, Removal, SubscribeOutcome, SubscriptionId, SubscriptionRegistry,
    },
    trigger::{identity_transform, SubscribeOptions, Trigger, TriggerTransform},
};
use crate::{
    config::Settings,
    transport::{Disposer, Message, MessageHandler, Transport},
};

const COMPONENT: &str = "PubSubEngine";

/// Логирует ошибку на уровне, который задаёт её статус-код.
macro_rules! log_error {
    ($err:expr, $($field:tt)+) => {{
        let err = &$err;
        let tags = err.metrics_tags();
        let message = err.log_message();
        match err.status_code().log_level() {
            LogLevel::Info => info!(component = COMPONENT, $($field)+, tags = ?tags, "{message}"),
            LogLevel::Warn => warn!(component = COMPONENT, $($field)+, tags = ?tags, "{message}"),
            LogLevel::Error => error!(component = COMPONENT, $($field)+, tags = ?tags, "{message}"),
        }
    }};
}

/// Ёмкость канала диагностических событий по умолчанию.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

/// Параметры движка.
#[derive(Clone)]
pub struct PubSubOptions {
    /// Преобразование триггера в имя канала. По умолчанию [`identity_transform`].
    pub trigger_transform: Option<TriggerTransform>,
    /// Ёмкость буфера диагностических событий.
    pub diagnostics_capacity: usize,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            trigger_transform: None,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl PubSubOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            trigger_transform: None,
            diagnostics_capacity: settings.diagnostics_capacity,
        }
    }

    pub fn with_trigger_transform<F>(
        mut self,
        transform: F,
    ) -> Self
    where
        F: Fn(&Trigger, Option<&SubscribeOptions>) -> String + Send + Sync + 'static,
    {
        self.trigger_transform = Some(Arc::new(transform));
        self
    }
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    registry: Mutex<SubscriptionRegistry>,
    transform: TriggerTransform,
    stats: EngineStats,
    diagnostics: Diagnostics,
    /// Фоновые задачи освобождения транспортных подписок.
    disposals: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Движок Pub/Sub.
///
/// Дёшево клонируется: все клоны разделяют один реестр подписок.
#[derive(Clone)]
pub struct PubSubEngine {
    inner: Arc<EngineInner>,
}

impl PubSubEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, PubSubOptions::default())
    }

    pub fn with_options(
        transport: Arc<dyn Transport>,
        options: PubSubOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                registry: Mutex::new(SubscriptionRegistry::new()),
                transform: options.trigger_transform.unwrap_or_else(identity_transform),
                stats: EngineStats::default(),
                diagnostics: Diagnostics::new(options.diagnostics_capacity),
                disposals: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Публикует `payload` в канал триггера.
    ///
    /// Успех означает, что транспорт принял сообщение; доставка не
    /// ожидается.
    pub fn publish<T>(
        &self,
        trigger: impl Into<Trigger>,
        payload: &T,
    ) -> Result<(), PubSubError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_running()?;
        let trigger = trigger.into();
        let channel = (self.inner.transform)(&trigger, None);

        let bytes = serde_json::to_vec(payload).map_err(|e| PubSubError::Serialization {
            reason: e.to_string(),
        })?;

        self.inner.stats.record_publish();
        trace!(component = COMPONENT, channel = %channel, "publishing message");

        self.inner
            .transport
            .publish(&channel, Bytes::from(bytes))
            .map_err(|source| {
                let err = PubSubError::PublishFailed {
                    channel: channel.clone(),
                    source,
                };
                log_error!(err, channel = %channel);
                err
            })
    }

    /// Подписывает `listener` на триггер.
    ///
    /// Возвращает идентификатор, который затем передаётся в
    /// [`unsubscribe`](Self::unsubscribe). Если транспорт отказал в подписке,
    /// ни одна из ожидавших её подписок не регистрируется.
    pub async fn subscribe(
        &self,
        trigger: impl Into<Trigger>,
        listener: Listener,
        options: Option<&SubscribeOptions>,
    ) -> Result<SubscriptionId, PubSubError> {
        self.ensure_running()?;
        let trigger = trigger.into();
        let channel: Arc<str> = Arc::from((self.inner.transform)(&trigger, options));

        let admission = self.inner.registry.lock().admit(channel.clone(), listener);
        match admission {
            Admission::Registered(id) => {
                trace!(
                    component = COMPONENT,
                    channel = %channel,
                    subscription_id = %id,
                    "subscription added to active channel"
                );
                Ok(id)
            }
            Admission::Joined(id, outcome) => self.join_subscribe(channel, id, outcome).await,
            Admission::Lead(id) => self.lead_subscribe(channel, id).await,
        }
    }

    /// То же, что [`subscribe`](Self::subscribe), но принимает замыкание.
    pub async fn subscribe_fn<F>(
        &self,
        trigger: impl Into<Trigger>,
        listener: F,
        options: Option<&SubscribeOptions>,
    ) -> Result<SubscriptionId, PubSubError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(trigger, Arc::new(listener), options).await
    }

    /// Снимает подписку.
    ///
    /// Если это последняя подписка канала, транспортная подписка
    /// освобождается в фоне; ошибки освобождения не возвращаются, а
    /// логируются и публикуются как [`DiagnosticEvent::DisposeFailed`].
    pub fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> Result<(), PubSubError> {
        let removal = self.inner.registry.lock().remove(id);
        match removal {
            Ok(Removal::Shared { channel, remaining }) => {
                trace!(
                    component = COMPONENT,
                    channel = %channel,
                    subscription_id = %id,
                    remaining,
                    "subscription removed, channel still referenced"
                );
                Ok(())
            }
            Ok(Removal::Last { channel, disposer }) => {
                debug!(
                    component = COMPONENT,
                    channel = %channel,
                    subscription_id = %id,
                    "last subscription removed, disposing channel"
                );
                self.spawn_disposal(channel, disposer);
                Ok(())
            }
            Err(err) => {
                log_error!(err, subscription_id = %id);
                Err(err)
            }
        }
    }

    /// Создаёт итератор по событиям триггеров.
    pub fn async_iterator<I, T>(
        &self,
        triggers: I,
    ) -> PubSubIterator
    where
        I: IntoIterator<Item = T>,
        T: Into<Trigger>,
    {
        self.async_iterator_with(triggers, IteratorOptions::default())
    }

    /// Создаёт итератор с фильтром и параметрами каналов.
    pub fn async_iterator_with<I, T>(
        &self,
        triggers: I,
        options: IteratorOptions,
    ) -> PubSubIterator
    where
        I: IntoIterator<Item = T>,
        T: Into<Trigger>,
    {
        let triggers = triggers.into_iter().map(Into::into).collect();
        PubSubIterator::new(self.clone(), triggers, options)
    }

    /// Количество зарегистрированных подписок.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.lock().subscription_count()
    }

    /// Количество каналов, включая те, подписка на которые ещё создаётся.
    pub fn channel_count(&self) -> usize {
        self.inner.registry.lock().channel_count()
    }

    /// Количество зарегистрированных слушателей триггера.
    pub fn listener_count(
        &self,
        trigger: impl Into<Trigger>,
    ) -> usize {
        let channel = (self.inner.transform)(&trigger.into(), None);
        self.inner.registry.lock().listener_count(&channel)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Подписка на диагностические события движка.
    pub fn diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.inner.diagnostics.subscribe()
    }

    /// Дожидается завершения всех запущенных освобождений подписок.
    pub async fn drain_disposals(&self) {
        loop {
            let handles = std::mem::take(&mut *self.inner.disposals.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!(component = COMPONENT, error = %err, "disposal task failed");
                }
            }
        }
    }

    /// Снимает все активные подписки и дожидается их освобождения.
    ///
    /// Подписки, транспорт которых ещё не ответил, отклоняются: когда
    /// транспорт ответит, его подписка сразу освобождается, а `subscribe`
    /// возвращает [`PubSubError::Shutdown`]. После вызова `subscribe` и
    /// `publish` также возвращают [`PubSubError::Shutdown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            self.drain_disposals().await;
            return;
        }

        let (drained, abandoned) = {
            let mut registry = self.inner.registry.lock();
            let drained = registry.drain();
            let abandoned = registry.reject_all_pending(TransportError::Unavailable {
                reason: "engine is shutting down".to_string(),
            });
            (drained, abandoned)
        };
        info!(
            component = COMPONENT,
            channels = drained.len(),
            pending = abandoned.len(),
            "shutting down pub/sub engine"
        );
        for (channel, disposer) in drained {
            self.spawn_disposal(channel, disposer);
        }
        self.drain_disposals().await;
    }

    fn ensure_running(&self) -> Result<(), PubSubError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(PubSubError::Shutdown);
        }
        Ok(())
    }

    async fn lead_subscribe(
        &self,
        channel: Arc<str>,
        id: SubscriptionId,
    ) -> Result<SubscriptionId, PubSubError> {
        let mut guard = LeadGuard {
            inner: Arc::clone(&self.inner),
            channel: channel.clone(),
            armed: true,
        };
        let result = self
            .inner
            .transport
            .subscribe(&channel, self.handler(channel.clone()))
            .await;
        guard.armed = false;

        match result {
            Ok(disposer) => {
                // Состояние канала перечитывается: за время `.await` оно могло
                // измениться.
                let activated = self.inner.registry.lock().activate(&channel, disposer);
                match activated {
                    Ok(listeners) => {
                        self.inner.stats.record_transport_subscribe();
                        self.inner.diagnostics.emit(DiagnosticEvent::Subscribed {
                            channel: channel.clone(),
                        });
                        debug!(
                            component = COMPONENT,
                            channel = %channel,
                            subscription_id = %id,
                            listeners,
                            "transport subscription established"
                        );
                        Ok(id)
                    }
                    // Канал отклонён остановкой движка, пока транспорт отвечал.
                    Err(disposer) => {
                        self.inner.dispose(channel.clone(), disposer).await;
                        let err = PubSubError::Shutdown;
                        log_error!(err, channel = %channel, subscription_id = %id);
                        Err(err)
                    }
                }
            }
            // Ожидающие подписки канала уже отклонены остановкой движка.
            Err(_) if self.inner.shut_down.load(Ordering::SeqCst) => Err(PubSubError::Shutdown),
            Err(source) => {
                let dropped = self.inner.registry.lock().reject(&channel, source.clone());
                self.inner.stats.record_subscribe_failure();
                self.inner.diagnostics.emit(DiagnosticEvent::SubscribeFailed {
                    channel: channel.clone(),
                    error: source.clone(),
                });

                let err = PubSubError::SubscribeFailed {
                    channel: channel.to_string(),
                    source,
                };
                log_error!(err, channel = %channel, dropped = dropped.len());
                Err(err)
            }
        }
    }

    async fn join_subscribe(
        &self,
        channel: Arc<str>,
        id: SubscriptionId,
        mut outcome: watch::Receiver<SubscribeOutcome>,
    ) -> Result<SubscriptionId, PubSubError> {
        trace!(
            component = COMPONENT,
            channel = %channel,
            subscription_id = %id,
            "joining in-flight transport subscription"
        );
        let mut guard = JoinGuard {
            engine: self,
            channel: channel.clone(),
            id,
            armed: true,
        };
        let settled: SubscribeOutcome = outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.clone());
        guard.armed = false;

        match settled {
            Some(Ok(())) => Ok(id),
            Some(Err(_)) if self.inner.shut_down.load(Ordering::SeqCst) => {
                Err(PubSubError::Shutdown)
            }
            Some(Err(source)) => Err(PubSubError::SubscribeFailed {
                channel: channel.to_string(),
                source,
            }),
            None => Err(PubSubError::SubscribeFailed {
                channel: channel.to_string(),
                source: TransportError::Unavailable {
                    reason: "transport subscription was abandoned".to_string(),
                },
            }),
        }
    }

    fn handler(
        &self,
        channel: Arc<str>,
    ) -> MessageHandler {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |message: Message| {
            if let Some(inner) = inner.upgrade() {
                inner.dispatch(&channel, &message.payload);
            }
        })
    }

    fn spawn_disposal(
        &self,
        channel: Arc<str>,
        disposer: Box<dyn Disposer>,
    ) {
        let inner = Arc::clone(&self.inner);
        let task = async move { inner.dispose(channel, disposer).await };

        match Handle::try_current() {
            Ok(handle) => {
                let join = handle.spawn(task);
                let mut disposals = self.inner.disposals.lock();
                disposals.retain(|h| !h.is_finished());
                disposals.push(join);
            }
            Err(_) => futures::executor::block_on(task),
        }
    }
}

impl fmt::Debug for PubSubEngine {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("PubSubEngine")
            .field("subscriptions", &registry.subscription_count())
            .field("channels", &registry.channel_count())
            .field("shut_down", &self.inner.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl EngineInner {
    /// Рассылает сообщение канала всем его слушателям в порядке регистрации.
    fn dispatch(
        &self,
        channel: &Arc<str>,
        payload: &[u8],
    ) {
        let listeners = self.registry.lock().listeners(channel);
        if listeners.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                self.stats.record_decode_failure();
                warn!(
                    component = COMPONENT,
                    channel = %channel,
                    error = %e,
                    "dropping message with malformed payload"
                );
                self.diagnostics.emit(DiagnosticEvent::DecodeFailed {
                    channel: channel.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };
        self.stats.record_dispatch();

        for (id, listener) in listeners {
            // Слушатель мог быть снят предыдущим слушателем этой же рассылки.
            if !self.registry.lock().is_live(id) {
                continue;
            }
            self.stats.record_listener_call();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&value))) {
                let message = panic_message(panic.as_ref());
                self.stats.record_listener_failure();
                error!(
                    component = COMPONENT,
                    channel = %channel,
                    subscription_id = %id,
                    panic = %message,
                    "listener panicked"
                );
                self.diagnostics.emit(DiagnosticEvent::ListenerPanicked {
                    channel: channel.clone(),
                    subscription_id: id,
                    message,
                });
            }
        }
    }

    async fn dispose(
        &self,
        channel: Arc<str>,
        disposer: Box<dyn Disposer>,
    ) {
        match disposer.dispose().await {
            Ok(()) => {
                self.stats.record_disposal();
                trace!(
                    component = COMPONENT,
                    channel = %channel,
                    "transport subscription disposed"
                );
                self.diagnostics.emit(DiagnosticEvent::Disposed { channel });
            }
            Err(e) => {
                self.stats.record_dispose_failure();
                log_error!(e, channel = %channel);
                self.diagnostics
                    .emit(DiagnosticEvent::DisposeFailed { channel, error: e });
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Отменяет создание транспортной подписки, если future ведущего
/// подписчика был сброшен до её завершения.
struct LeadGuard {
    inner: Arc<EngineInner>,
    channel: Arc<str>,
    armed: bool,
}

impl Drop for LeadGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let dropped = self.inner.registry.lock().reject(
            &self.channel,
            TransportError::Unavailable {
                reason: "subscribe was cancelled".to_string(),
            },
        );
        debug!(
            component = COMPONENT,
            channel = %self.channel,
            dropped = dropped.len(),
            "transport subscribe cancelled"
        );
    }
}

/// Снимает подписку присоединившегося подписчика, если его future был
/// сброшен до получения результата.
struct JoinGuard<'a> {
    engine: &'a PubSubEngine,
    channel: Arc<str>,
    id: SubscriptionId,
    armed: bool,
}

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registered = {
            let mut registry = self.engine.inner.registry.lock();
            !registry.withdraw_pending(&self.channel, self.id) && registry.is_live(self.id)
        };
        // Отклонённая подписка уже удалена из реестра вместе с каналом.
        if registered {
            let _ = self.engine.unsubscribe(self.id);
        }
    }
}
