pub mod config;
mod filters;
mod formatter;

use std::io;

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Registry};

pub use config::{LogFormat, LoggingConfig};
pub use filters::build_filter_from_config;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Инициализация логирования с конфигурацией.
///
/// Устанавливает глобальный `tracing`-подписчик; повторный вызов
/// возвращает [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    config.validate()?;

    let env_filter = build_filter_from_config(config);
    let fmt_layer = formatter::build_formatter_from_config::<Registry, _>(config, io::stdout);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git_commit = env!("GIT_COMMIT"),
        build_time = env!("BUILD_TIME"),
        log_level = %config.level,
        format = ?config.format,
        "Logging system initialized"
    );

    Ok(())
}
