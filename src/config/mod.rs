//! Конфигурация: параметры соединения с транспортом, диагностика,
//! логирование.

pub mod settings;

pub use settings::{ConnectionConfig, Settings};
