use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

use crate::{logging::LoggingConfig, pubsub::DEFAULT_DIAGNOSTICS_CAPACITY};

/// Параметры соединения с транспортом.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Ёмкость буфера канала на стороне транспорта.
    pub channel_capacity: usize,
}

impl ConnectionConfig {
    /// Адрес в виде `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionConfig,
    /// Ёмкость канала диагностических событий движка.
    pub diagnostics_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Префикс переменных окружения: `PUBSUB_BRIDGE__CONNECTION__PORT=5673`.
    pub const ENV_PREFIX: &'static str = "PUBSUB_BRIDGE";

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix(Self::ENV_PREFIX)
    }

    pub fn load_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let cfg = Config::builder()
            // Добавляем значения по умолчанию
            .set_default("connection.host", defaults.connection.host)?
            .set_default("connection.port", i64::from(defaults.connection.port))?
            .set_default(
                "connection.channel_capacity",
                defaults.connection.channel_capacity as i64,
            )?
            .set_default("diagnostics_capacity", defaults.diagnostics_capacity as i64)?
            .set_default("logging.level", defaults.logging.level)?
            // Добавляем переменные окружения с префиксом
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        // Десериализуем конфигурацию в нашу структуру
        cfg.try_deserialize()
    }
}
