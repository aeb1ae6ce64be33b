//! Pull-адаптер: превращает доставляемые движком события в
//! последовательность, из которой потребитель забирает значения сам.
//!
//! Значения, пришедшие раньше запроса, буферизуются в порядке поступления.
//! Одновременно ожидать может только один запрос (`next` берёт `&mut self`).

use std::{
    collections::VecDeque,
    fmt,
    future::poll_fn,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
};

use futures::{future::BoxFuture, Stream};
use parking_lot::Mutex;
use pubsub_bridge_error::PubSubError;
use serde_json::Value;
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, trace};

use super::{
    engine::PubSubEngine,
    registry::{Listener, SubscriptionId},
    trigger::{SubscribeOptions, Trigger},
};

/// Предикат, отбирающий значения для итератора.
pub type Filter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Параметры итератора.
#[derive(Clone, Default)]
pub struct IteratorOptions {
    filter: Option<Filter>,
    channel_options: Option<SubscribeOptions>,
}

impl IteratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Пропускать только значения, для которых `filter` вернул `true`.
    pub fn filter<F>(
        mut self,
        filter: F,
    ) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Параметры каналов, передаваемые в преобразование триггеров.
    pub fn channel_options(
        mut self,
        options: SubscribeOptions,
    ) -> Self {
        self.channel_options = Some(options);
        self
    }
}

/// Фаза жизненного цикла итератора.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorPhase {
    /// Подписки ещё не запускались.
    Uninitialized,
    /// Подписки на триггеры создаются.
    Subscribing,
    /// Все подписки созданы.
    Active,
    /// Итератор закрыт; состояние конечное.
    Closed,
}

struct AdapterState {
    phase: IteratorPhase,
    queue: VecDeque<Value>,
    waker: Option<Waker>,
    ids: Vec<SubscriptionId>,
    failure: Option<PubSubError>,
    failure_reported: bool,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            phase: IteratorPhase::Uninitialized,
            queue: VecDeque::new(),
            waker: None,
            ids: Vec::new(),
            failure: None,
            failure_reported: false,
        }
    }
}

struct Shared {
    state: Mutex<AdapterState>,
    filter: Option<Filter>,
    /// `true`, когда установка подписок завершилась (успешно или нет).
    setup_done: watch::Sender<bool>,
}

impl Shared {
    fn phase(&self) -> IteratorPhase {
        self.state.lock().phase
    }

    /// Слушатель для движка. Держит только слабую ссылку, чтобы реестр не
    /// продлевал жизнь итератора.
    fn listener(self: &Arc<Self>) -> Listener {
        let shared: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |value: &Value| {
            if let Some(shared) = shared.upgrade() {
                shared.push(value);
            }
        })
    }

    fn push(
        &self,
        value: &Value,
    ) {
        if let Some(filter) = &self.filter {
            if !filter(value) {
                return;
            }
        }

        let waker = {
            let mut state = self.state.lock();
            if state.phase == IteratorPhase::Closed {
                return;
            }
            state.queue.push_back(value.clone());
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Переводит итератор в `Closed` и возвращает подписки, которые
    /// нужно снять. Повторный вызов возвращает `None`.
    fn close_with(
        &self,
        failure: Option<PubSubError>,
    ) -> Option<Vec<SubscriptionId>> {
        let (ids, waker) = {
            let mut state = self.state.lock();
            if state.phase == IteratorPhase::Closed {
                return None;
            }
            state.phase = IteratorPhase::Closed;
            state.queue.clear();
            if failure.is_some() {
                state.failure = failure;
            }
            (std::mem::take(&mut state.ids), state.waker.take())
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Some(ids)
    }

    fn finish_setup(&self) {
        self.setup_done.send_replace(true);
    }
}

/// Итератор по событиям одного или нескольких триггеров.
///
/// Создаётся через [`PubSubEngine::async_iterator`]. Подписки на триггеры
/// создаются в фоновой задаче; значения, пришедшие за это время,
/// буферизуются. При `Drop` итератор закрывается.
pub struct PubSubIterator {
    engine: PubSubEngine,
    shared: Arc<Shared>,
    /// Задача установки подписок, если её не удалось запустить сразу.
    deferred_setup: Option<BoxFuture<'static, ()>>,
}

impl PubSubIterator {
    pub(crate) fn new(
        engine: PubSubEngine,
        triggers: Vec<Trigger>,
        options: IteratorOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(AdapterState::default()),
            filter: options.filter,
            setup_done: watch::channel(false).0,
        });
        let setup = run_setup(
            engine.clone(),
            Arc::clone(&shared),
            triggers,
            options.channel_options,
        );

        let mut iterator = Self {
            engine,
            shared,
            deferred_setup: Some(Box::pin(setup)),
        };
        iterator.start();
        iterator
    }

    /// Запускает установку подписок, если она ещё не запущена. Без
    /// tokio runtime запуск откладывается.
    fn start(&mut self) {
        let Some(setup) = self.deferred_setup.take() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            self.deferred_setup = Some(setup);
            return;
        };

        {
            let mut state = self.shared.state.lock();
            if state.phase == IteratorPhase::Closed {
                drop(state);
                self.shared.finish_setup();
                return;
            }
            state.phase = IteratorPhase::Subscribing;
        }
        handle.spawn(setup);
    }

    /// Запуск из `poll`: без runtime итератор закрывается с ошибкой.
    fn start_or_fail(&mut self) {
        self.start();
        if self.deferred_setup.take().is_some() {
            self.shared.close_with(Some(PubSubError::Shutdown));
            self.shared.finish_setup();
        }
    }

    fn poll_pull(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Value, PubSubError>>> {
        self.start_or_fail();

        let mut state = self.shared.state.lock();
        if let Some(value) = state.queue.pop_front() {
            return Poll::Ready(Some(Ok(value)));
        }
        if state.phase == IteratorPhase::Closed {
            if !state.failure_reported {
                if let Some(err) = state.failure.clone() {
                    state.failure_reported = true;
                    return Poll::Ready(Some(Err(err)));
                }
            }
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Следующее значение.
    ///
    /// - `Ok(Some(value))`: очередное значение, прошедшее фильтр;
    /// - `Ok(None)`: итератор закрыт;
    /// - `Err(_)`: не удалось подписаться на триггер (возвращается один
    ///   раз, затем `Ok(None)`).
    ///
    /// Отмена future безопасна: значение не теряется и достанется
    /// следующему вызову.
    pub async fn next(&mut self) -> Result<Option<Value>, PubSubError> {
        poll_fn(|cx| self.poll_pull(cx)).await.transpose()
    }

    /// Дожидается завершения установки подписок.
    pub async fn subscribed(&mut self) -> Result<(), PubSubError> {
        self.start_or_fail();

        let mut done = self.shared.setup_done.subscribe();
        // Ошибка означает, что `Sender` сброшен, а он живёт в `self.shared`.
        let _ = done.wait_for(|done| *done).await;

        match self.shared.state.lock().failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Закрывает итератор: снимает все его подписки и будит ожидающий
    /// `next`. Повторный вызов ничего не делает.
    ///
    /// Подписки, которые ещё создаются, будут сняты сразу после создания.
    pub fn close(&self) {
        let Some(ids) = self.shared.close_with(None) else {
            return;
        };
        trace!(subscriptions = ids.len(), "closing pub/sub iterator");
        for id in ids {
            if let Err(err) = self.engine.unsubscribe(id) {
                debug!(subscription_id = %id, error = %err, "iterator subscription already gone");
            }
        }
    }

    pub fn phase(&self) -> IteratorPhase {
        self.shared.phase()
    }

    /// Количество буферизованных значений.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Подписки, принадлежащие итератору.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.shared.state.lock().ids.clone()
    }
}

impl Stream for PubSubIterator {
    type Item = Result<Value, PubSubError>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_pull(cx)
    }
}

impl Drop for PubSubIterator {
    fn drop(&mut self) {
        self.deferred_setup = None;
        self.close();
    }
}

impl fmt::Debug for PubSubIterator {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PubSubIterator")
            .field("phase", &state.phase)
            .field("buffered", &state.queue.len())
            .field("subscriptions", &state.ids)
            .finish()
    }
}

/// Подписывается на триггеры по очереди.
///
/// Если итератор закрыли, пока подписка создавалась, она снимается сразу
/// после создания, а оставшиеся триггеры пропускаются.
async fn run_setup(
    engine: PubSubEngine,
    shared: Arc<Shared>,
    triggers: Vec<Trigger>,
    channel_options: Option<SubscribeOptions>,
) {
    for trigger in triggers {
        if shared.phase() == IteratorPhase::Closed {
            break;
        }

        let listener = shared.listener();
        match engine
            .subscribe(trigger, listener, channel_options.as_ref())
            .await
        {
            Ok(id) => {
                let kept = {
                    let mut state = shared.state.lock();
                    if state.phase == IteratorPhase::Closed {
                        false
                    } else {
                        state.ids.push(id);
                        true
                    }
                };
                if !kept {
                    trace!(subscription_id = %id, "iterator closed during setup, unsubscribing");
                    let _ = engine.unsubscribe(id);
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "iterator setup failed");
                // Если итератор уже закрыт пользователем, ошибка не
                // сохраняется.
                for id in shared.close_with(Some(err)).unwrap_or_default() {
                    let _ = engine.unsubscribe(id);
                }
                shared.finish_setup();
                return;
            }
        }
    }

    {
        let mut state = shared.state.lock();
        if state.phase == IteratorPhase::Subscribing {
            state.phase = IteratorPhase::Active;
        }
    }
    shared.finish_setup();
}
