use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode, TransportError};

/// Ошибки движка Pub/Sub, возвращаемые вызывающему коду.
///
/// Ошибки фоновой очистки (освобождение подписок) и рассылки слушателям
/// сюда не попадают: они логируются и публикуются как диагностические
/// события.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    /// Отписка по идентификатору, которого нет в реестре.
    #[error("There is no subscription of id \"{id}\"")]
    UnknownSubscription { id: u64 },

    /// Транспорт не смог создать подписку на канал.
    #[error("failed to subscribe to channel '{channel}': {source}")]
    SubscribeFailed {
        channel: String,
        #[source]
        source: TransportError,
    },

    /// Транспорт не принял публикацию.
    #[error("failed to publish to channel '{channel}': {source}")]
    PublishFailed {
        channel: String,
        #[source]
        source: TransportError,
    },

    /// Полезную нагрузку не удалось сериализовать.
    #[error("payload serialization failed: {reason}")]
    Serialization { reason: String },

    /// Движок уже остановлен.
    #[error("pub/sub engine has been shut down")]
    Shutdown,
}

impl ErrorExt for PubSubError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownSubscription { .. } => StatusCode::NotFound,
            Self::SubscribeFailed { .. } => StatusCode::SubscribeFailed,
            Self::PublishFailed { .. } => StatusCode::PublishFailed,
            Self::Serialization { .. } => StatusCode::SerializationFailed,
            Self::Shutdown => StatusCode::ConnectionClosed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "pubsub".to_string()),
            ("status_code", self.status_code().to_string()),
        ];

        match self {
            Self::UnknownSubscription { id } => {
                tags.push(("subscription_id", id.to_string()));
            }
            Self::SubscribeFailed { channel, .. } | Self::PublishFailed { channel, .. } => {
                tags.push(("channel", channel.clone()));
            }
            _ => {}
        }

        tags
    }
}
