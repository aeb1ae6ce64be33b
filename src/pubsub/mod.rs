//! Подсистема Publish–Subscribe (pub/sub) поверх транспорта сообщений.
//!
//! - `engine`: публикация, подписка и отписка с подсчётом ссылок на
//!   транспортные подписки, рассылка сообщений слушателям.
//! - `registry` (приватный): реестр подписок и состояний каналов.
//! - `iterator`: pull-адаптер над событиями одного или нескольких триггеров.
//! - `trigger`: триггеры и их преобразование в имена каналов.
//! - `diagnostics`: диагностические события и счётчики движка.

mod diagnostics;
mod engine;
mod iterator;
mod registry;
mod trigger;

pub use diagnostics::{DiagnosticEvent, EngineStats, StatsSnapshot};
pub use engine::{PubSubEngine, PubSubOptions, DEFAULT_DIAGNOSTICS_CAPACITY};
pub use iterator::{Filter, IteratorOptions, IteratorPhase, PubSubIterator};
pub use registry::{Listener, SubscriptionId};
pub use trigger::{identity_transform, PathSegment, SubscribeOptions, Trigger, TriggerTransform};
