use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки транспортного уровня (очередь сообщений).
///
/// Транспорт возвращает их из `publish`, `subscribe` и при освобождении
/// подписки.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Транспорт недоступен (нет соединения, канал закрыт).
    #[error("transport unavailable: {reason}")]
    Unavailable { reason: String },

    /// Транспорт отказал в подписке на канал.
    #[error("subscribe to channel '{channel}' rejected: {reason}")]
    SubscribeRejected { channel: String, reason: String },

    /// Транспорт не принял сообщение.
    #[error("publish to channel '{channel}' rejected: {reason}")]
    PublishRejected { channel: String, reason: String },

    /// Не удалось снять подписку на уровне транспорта.
    #[error("failed to dispose subscription on channel '{channel}': {reason}")]
    DisposeFailed { channel: String, reason: String },
}

impl TransportError {
    /// Канал, к которому относится ошибка (если известен).
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Unavailable { .. } => None,
            Self::SubscribeRejected { channel, .. }
            | Self::PublishRejected { channel, .. }
            | Self::DisposeFailed { channel, .. } => Some(channel),
        }
    }
}

impl ErrorExt for TransportError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unavailable { .. } => StatusCode::ConnectionFailed,
            Self::SubscribeRejected { .. } => StatusCode::SubscribeFailed,
            Self::PublishRejected { .. } => StatusCode::PublishFailed,
            Self::DisposeFailed { .. } => StatusCode::DisposeFailed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "transport".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        if let Some(channel) = self.channel() {
            tags.push(("channel", channel.to_string()));
        }
        tags
    }
}
