// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging options derived from the `[logging]` configuration section

use serde::{Deserialize, Serialize};
use sensorium_config::LoggingSettings;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum LogConfigError {
    #[error("Unknown log format '{0}' (expected text or json)")]
    UnknownFormat(String),
    #[error("Unknown log level '{0}'")]
    UnknownLevel(String),
}

/// Console line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = LogConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(LogConfigError::UnknownFormat(other.to_string())),
        }
    }
}

/// Resolved logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Default level for targets without a debug flag
    pub level: String,
    pub format: LogFormat,
    /// Base directory for run folders; `None` disables file output
    pub log_dir: Option<PathBuf>,
    pub retain_runs: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            log_dir: None,
            retain_runs: 10,
        }
    }
}

impl TryFrom<&LoggingSettings> for LoggingOptions {
    type Error = LogConfigError;

    fn try_from(settings: &LoggingSettings) -> Result<Self, Self::Error> {
        let level = settings.level.to_lowercase();
        if tracing::Level::from_str(&level).is_err() {
            return Err(LogConfigError::UnknownLevel(settings.level.clone()));
        }
        Ok(Self {
            level,
            format: settings.format.parse()?,
            log_dir: settings.log_dir.clone(),
            retain_runs: settings.retain_runs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let settings = LoggingSettings {
            level: "DEBUG".to_string(),
            format: "json".to_string(),
            log_dir: Some(PathBuf::from("/tmp/sensorium-logs")),
            retain_runs: 3,
        };
        let options = LoggingOptions::try_from(&settings).unwrap();
        assert_eq!(options.level, "debug");
        assert_eq!(options.format, LogFormat::Json);
        assert_eq!(options.retain_runs, 3);
    }

    #[test]
    fn test_rejects_unknown_values() {
        let mut settings = LoggingSettings::default();
        settings.format = "xml".to_string();
        assert!(matches!(
            LoggingOptions::try_from(&settings),
            Err(LogConfigError::UnknownFormat(_))
        ));

        let mut settings = LoggingSettings::default();
        settings.level = "loud".to_string();
        assert!(matches!(
            LoggingOptions::try_from(&settings),
            Err(LogConfigError::UnknownLevel(_))
        ));
    }
}
