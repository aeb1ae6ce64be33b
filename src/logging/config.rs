use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::LoggingError;

/// Формат вывода логов.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Базовый уровень: `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
    pub with_target: bool,
    /// Уровни для отдельных target'ов, например `pubsub_bridge::transport = "trace"`.
    pub targets: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            ansi: true,
            with_target: true,
            targets: BTreeMap::new(),
        }
    }
}

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

impl LoggingConfig {
    /// Собирает директиву для `EnvFilter`: `"info,pubsub_bridge::transport=trace"`.
    pub fn build_filter_directive(&self) -> String {
        let mut directive = self.level.to_lowercase();
        for (target, level) in &self.targets {
            directive.push(',');
            directive.push_str(target);
            directive.push('=');
            directive.push_str(&level.to_lowercase());
        }
        directive
    }

    pub fn validate(&self) -> Result<(), LoggingError> {
        let is_level = |l: &str| LEVELS.contains(&l.to_lowercase().as_str());

        if !is_level(&self.level) {
            return Err(LoggingError::InvalidLevel(self.level.clone()));
        }
        if let Some((_, level)) = self.targets.iter().find(|(_, l)| !is_level(l)) {
            return Err(LoggingError::InvalidLevel(level.clone()));
        }
        Ok(())
    }
}
