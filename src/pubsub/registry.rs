//! Реестр подписок.
//!
//! Хранит три связанных отображения:
//! - идентификатор подписки → (канал, слушатель);
//! - канал → упорядоченный список идентификаторов (reference set);
//! - канал → состояние транспортной подписки (создаётся или активна).
//!
//! На каждый канал приходится не более одной подписки транспорта, которую
//! разделяют все подписки приложения. Реестр не выполняет ввод-вывод: все
//! методы синхронные, движок вызывает их под мьютексом и никогда не держит
//! его через `.await`.

use std::{collections::HashMap, fmt, sync::Arc};

use pubsub_bridge_error::{PubSubError, TransportError};
use serde_json::Value;
use tokio::sync::watch;

use crate::transport::Disposer;

/// Слушатель сообщений триггера.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Результат создания транспортной подписки, который ждут присоединившиеся
/// подписчики. `None`, пока он не известен.
pub(crate) type SubscribeOutcome = Option<Result<(), TransportError>>;

/// Идентификатор подписки.
///
/// Выдаётся по возрастанию и не переиспользуется, пока жив реестр.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SubscriptionId> for u64 {
    fn from(id: SubscriptionId) -> Self {
        id.0
    }
}

struct SubscriptionEntry {
    channel: Arc<str>,
    listener: Listener,
}

enum ChannelState {
    /// Транспортная подписка создаётся; слушатели ждут в `pending` в порядке
    /// поступления и ещё не получают сообщений.
    Subscribing {
        pending: Vec<(SubscriptionId, Listener)>,
        outcome: watch::Sender<SubscribeOutcome>,
    },
    Active { disposer: Box<dyn Disposer> },
}

struct ChannelEntry {
    refs: Vec<SubscriptionId>,
    state: ChannelState,
}

/// Как была принята новая подписка.
pub(crate) enum Admission {
    /// Канал активен: подписка зарегистрирована сразу.
    Registered(SubscriptionId),
    /// Транспортная подписка уже создаётся другим вызовом: нужно дождаться
    /// её результата.
    Joined(SubscriptionId, watch::Receiver<SubscribeOutcome>),
    /// Канал новый: вызывающий должен создать транспортную подписку.
    Lead(SubscriptionId),
}

/// Результат удаления подписки.
pub(crate) enum Removal {
    /// Удалена последняя подписка канала; транспортную подписку нужно
    /// освободить.
    Last {
        channel: Arc<str>,
        disposer: Box<dyn Disposer>,
    },
    /// У канала остались другие подписки.
    Shared { channel: Arc<str>, remaining: usize },
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    channels: HashMap<Arc<str>, ChannelEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Принимает новую подписку на канал.
    pub(crate) fn admit(
        &mut self,
        channel: Arc<str>,
        listener: Listener,
    ) -> Admission {
        let id = self.allocate_id();

        match self.channels.get_mut(&channel) {
            Some(entry) => match &mut entry.state {
                ChannelState::Active { .. } => {
                    entry.refs.push(id);
                    self.subscriptions
                        .insert(id, SubscriptionEntry { channel, listener });
                    Admission::Registered(id)
                }
                ChannelState::Subscribing { pending, outcome } => {
                    pending.push((id, listener));
                    Admission::Joined(id, outcome.subscribe())
                }
            },
            None => {
                let (outcome, _) = watch::channel(None);
                self.channels.insert(
                    channel,
                    ChannelEntry {
                        refs: Vec::new(),
                        state: ChannelState::Subscribing {
                            pending: vec![(id, listener)],
                            outcome,
                        },
                    },
                );
                Admission::Lead(id)
            }
        }
    }

    /// Переводит канал в активное состояние после успешной подписки
    /// транспорта: все ожидающие слушатели регистрируются в порядке
    /// поступления.
    ///
    /// Если канал больше не ожидает подписки, `disposer` возвращается
    /// вызывающему для освобождения.
    pub(crate) fn activate(
        &mut self,
        channel: &Arc<str>,
        disposer: Box<dyn Disposer>,
    ) -> Result<usize, Box<dyn Disposer>> {
        let Some(entry) = self.channels.get_mut(channel) else {
            return Err(disposer);
        };
        let ChannelState::Subscribing { pending, outcome } = &mut entry.state else {
            return Err(disposer);
        };

        let pending = std::mem::take(pending);
        let _ = outcome.send(Some(Ok(())));
        entry.state = ChannelState::Active { disposer };

        for (id, listener) in pending {
            entry.refs.push(id);
            self.subscriptions.insert(
                id,
                SubscriptionEntry {
                    channel: channel.clone(),
                    listener,
                },
            );
        }
        Ok(entry.refs.len())
    }

    /// Отменяет создание подписки: канал удаляется, ожидающие подписки
    /// отбрасываются и получают `error`. Возвращает отброшенные
    /// идентификаторы.
    pub(crate) fn reject(
        &mut self,
        channel: &str,
        error: TransportError,
    ) -> Vec<SubscriptionId> {
        let is_subscribing = matches!(
            self.channels.get(channel).map(|e| &e.state),
            Some(ChannelState::Subscribing { .. })
        );
        if !is_subscribing {
            return Vec::new();
        }

        match self.channels.remove(channel).map(|e| e.state) {
            Some(ChannelState::Subscribing { pending, outcome }) => {
                let _ = outcome.send(Some(Err(error)));
                pending.into_iter().map(|(id, _)| id).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Отменяет создание подписки на всех каналах, которые ещё ждут
    /// транспорт. Возвращает отброшенные идентификаторы.
    pub(crate) fn reject_all_pending(
        &mut self,
        error: TransportError,
    ) -> Vec<SubscriptionId> {
        let subscribing: Vec<Arc<str>> = self
            .channels
            .iter()
            .filter(|(_, entry)| matches!(entry.state, ChannelState::Subscribing { .. }))
            .map(|(channel, _)| channel.clone())
            .collect();

        subscribing
            .iter()
            .flat_map(|channel| self.reject(channel, error.clone()))
            .collect()
    }

    /// Убирает ещё не зарегистрированную подписку из очереди ожидания канала.
    /// Возвращает `false`, если подписки там нет.
    pub(crate) fn withdraw_pending(
        &mut self,
        channel: &str,
        id: SubscriptionId,
    ) -> bool {
        let Some(ChannelEntry {
            state: ChannelState::Subscribing { pending, .. },
            ..
        }) = self.channels.get_mut(channel)
        else {
            return false;
        };
        let before = pending.len();
        pending.retain(|(pending_id, _)| *pending_id != id);
        pending.len() != before
    }

    /// Удаляет подписку.
    ///
    /// Идентификатор удаляется из карты подписок всегда; если это была
    /// последняя ссылка на канал, канал удаляется, а `disposer` возвращается
    /// вызывающему.
    pub(crate) fn remove(
        &mut self,
        id: SubscriptionId,
    ) -> Result<Removal, PubSubError> {
        let entry = self
            .subscriptions
            .remove(&id)
            .ok_or(PubSubError::UnknownSubscription { id: id.get() })?;
        let channel = entry.channel;

        let remaining = match self.channels.get_mut(&channel) {
            Some(channel_entry) => {
                channel_entry.refs.retain(|r| *r != id);
                channel_entry.refs.len()
            }
            None => return Err(PubSubError::UnknownSubscription { id: id.get() }),
        };

        if remaining > 0 {
            return Ok(Removal::Shared { channel, remaining });
        }

        match self.channels.remove(&channel).map(|e| e.state) {
            Some(ChannelState::Active { disposer }) => Ok(Removal::Last { channel, disposer }),
            // Зарегистрированные подписки бывают только у активных каналов.
            _ => Err(PubSubError::UnknownSubscription { id: id.get() }),
        }
    }

    /// Снимок слушателей канала в порядке регистрации.
    pub(crate) fn listeners(
        &self,
        channel: &str,
    ) -> Vec<(SubscriptionId, Listener)> {
        let Some(entry) = self.channels.get(channel) else {
            return Vec::new();
        };
        entry
            .refs
            .iter()
            .filter_map(|id| {
                self.subscriptions
                    .get(id)
                    .map(|sub| (*id, Arc::clone(&sub.listener)))
            })
            .collect()
    }

    /// Зарегистрирована ли подписка (и в карте подписок, и в списке канала).
    pub(crate) fn is_live(
        &self,
        id: SubscriptionId,
    ) -> bool {
        self.subscriptions.get(&id).is_some_and(|sub| {
            self.channels
                .get(&sub.channel)
                .is_some_and(|entry| entry.refs.contains(&id))
        })
    }

    /// Удаляет все активные каналы и возвращает их `disposer`'ы. Каналы в
    /// процессе подписки остаются: их отклоняет `reject_all_pending`.
    pub(crate) fn drain(&mut self) -> Vec<(Arc<str>, Box<dyn Disposer>)> {
        let active: Vec<Arc<str>> = self
            .channels
            .iter()
            .filter(|(_, entry)| matches!(entry.state, ChannelState::Active { .. }))
            .map(|(channel, _)| channel.clone())
            .collect();

        let mut drained = Vec::with_capacity(active.len());
        for channel in active {
            if let Some(ChannelEntry {
                refs,
                state: ChannelState::Active { disposer },
            }) = self.channels.remove(&channel)
            {
                for id in refs {
                    self.subscriptions.remove(&id);
                }
                drained.push((channel, disposer));
            }
        }
        drained
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Количество каналов (включая находящиеся в процессе подписки).
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn listener_count(
        &self,
        channel: &str,
    ) -> usize {
        self.channels
            .get(channel)
            .map(|entry| entry.refs.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn is_subscribing(
        &self,
        channel: &str,
    ) -> bool {
        matches!(
            self.channels.get(channel).map(|e| &e.state),
            Some(ChannelState::Subscribing { .. })
        )
    }
}
