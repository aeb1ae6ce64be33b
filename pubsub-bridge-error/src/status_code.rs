use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "serde_repr")]
use serde_repr::{Deserialize_repr, Serialize_repr};
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок.
///
/// # Диапазоны:
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки данных
/// - 5xxx: Сериализация
/// - 6xxx: Транспорт / соединение
/// - 9xxx: Подписки и доставка
///
/// `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`.
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[cfg_attr(feature = "serde_repr", derive(Serialize_repr, Deserialize_repr))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 1xxx: Общие ошибки ===
    Internal = 1003,

    // === 2xxx: Ошибки данных ===
    NotFound = 2000,

    // === 5xxx: Сериализация ===
    SerializationFailed = 5003,

    // === 6xxx: Транспорт ===
    ConnectionClosed = 6001,
    ConnectionFailed = 6004,

    // === 9xxx: Подписки ===
    SubscribeFailed = 9000,
    PublishFailed = 9001,
    DisposeFailed = 9002,
}

/// Уровень, на котором логируется ошибка с данным кодом.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Рекомендуемый уровень логирования для данного кода.
    ///
    /// Остановка движка ожидаема, ошибки вызывающего кода и сбои очистки
    /// не прерывают работу, остальное логируется как ошибка.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::ConnectionClosed => LogLevel::Info,
            Self::NotFound | Self::DisposeFailed => LogLevel::Warn,
            Self::Internal
            | Self::SerializationFailed
            | Self::ConnectionFailed
            | Self::SubscribeFailed
            | Self::PublishFailed => LogLevel::Error,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
