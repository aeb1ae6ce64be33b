use std::{fmt, sync::Arc};

use serde_json::Value;

/// Сегмент пути триггера: ключ или индекс.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Логическое имя события, на которое подписываются и в которое публикуют.
///
/// Либо простое имя (`"FIRST_EVENT"`), либо путь (`["orders", 3, "status"]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    Name(String),
    Path(Vec<PathSegment>),
}

impl Trigger {
    /// Имя канала транспорта без преобразований: имя как есть, путь
    /// через точку.
    pub fn default_channel(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Path(path) => path
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("."),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.default_channel())
    }
}

impl From<&str> for Trigger {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Trigger {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&String> for Trigger {
    fn from(name: &String) -> Self {
        Self::Name(name.clone())
    }
}

impl From<Vec<PathSegment>> for Trigger {
    fn from(path: Vec<PathSegment>) -> Self {
        Self::Path(path)
    }
}

/// Параметры канала, передаваемые в преобразование триггера.
pub type SubscribeOptions = Value;

/// Преобразование триггера в имя канала транспорта.
pub type TriggerTransform =
    Arc<dyn Fn(&Trigger, Option<&SubscribeOptions>) -> String + Send + Sync>;

/// Преобразование по умолчанию: [`Trigger::default_channel`], параметры
/// игнорируются.
pub fn identity_transform() -> TriggerTransform {
    Arc::new(|trigger, _| trigger.default_channel())
}
