// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! Checks that instance and stream declarations are consistent before the
//! runtime builds ports from them.

use crate::{ConfigError, ConfigResult, SensoriumConfig};
use std::collections::HashSet;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validation errors that can occur during config validation
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    MissingRequired { field: String },
    Duplicate { field: String, value: String },
    UnknownReference { field: String, value: String },
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::Duplicate { field, value } => {
                write!(f, "Duplicate {} '{}'", field, value)
            }
            Self::UnknownReference { field, value } => {
                write!(f, "{} refers to undeclared instance '{}'", field, value)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
        }
    }
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &SensoriumConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_instances(config, &mut errors);
    validate_streams(config, &mut errors);
    validate_logging(config, &mut errors);

    if errors.is_empty() {
        return Ok(());
    }

    let error_messages = errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::ValidationError(format!(
        "Configuration validation failed:\n{}",
        error_messages
    )))
}

fn validate_instances(config: &SensoriumConfig, errors: &mut Vec<ConfigValidationError>) {
    let mut seen = HashSet::new();
    for (index, instance) in config.instances.iter().enumerate() {
        if instance.name.is_empty() {
            errors.push(ConfigValidationError::MissingRequired {
                field: format!("instances[{}].name", index),
            });
        } else if !seen.insert(instance.name.as_str()) {
            errors.push(ConfigValidationError::Duplicate {
                field: "instance name".to_string(),
                value: instance.name.clone(),
            });
        }
        if instance.component.is_empty() {
            errors.push(ConfigValidationError::MissingRequired {
                field: format!("instances[{}].component", index),
            });
        }
    }
}

fn validate_streams(config: &SensoriumConfig, errors: &mut Vec<ConfigValidationError>) {
    let mut seen = HashSet::new();
    for (index, stream) in config.streams.iter().enumerate() {
        if stream.key.is_empty() {
            errors.push(ConfigValidationError::MissingRequired {
                field: format!("streams[{}].key", index),
            });
        } else if !seen.insert(stream.key.as_str()) {
            errors.push(ConfigValidationError::Duplicate {
                field: "stream key".to_string(),
                value: stream.key.clone(),
            });
        }
        if stream.port_type.is_empty() {
            errors.push(ConfigValidationError::MissingRequired {
                field: format!("streams[{}].port_type", index),
            });
        }
        if config.instance(&stream.instance).is_none() {
            errors.push(ConfigValidationError::UnknownReference {
                field: format!("streams[{}].instance", index),
                value: stream.instance.clone(),
            });
        }
    }
}

fn validate_logging(config: &SensoriumConfig, errors: &mut Vec<ConfigValidationError>) {
    let level = config.logging.level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ConfigValidationError::InvalidValue {
            field: "logging.level".to_string(),
            reason: format!("'{}' is not one of {}", config.logging.level, LOG_LEVELS.join("|")),
        });
    }
    if !matches!(config.logging.format.as_str(), "text" | "json") {
        errors.push(ConfigValidationError::InvalidValue {
            field: "logging.format".to_string(),
            reason: format!("'{}' is not text|json", config.logging.format),
        });
    }
}
