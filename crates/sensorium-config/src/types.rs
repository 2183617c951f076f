// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `sensorium.toml`.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SensoriumConfig {
    pub runtime: RuntimeSettings,
    pub logging: LoggingSettings,
    pub locks: LockSettings,
    pub instances: Vec<InstanceConfig>,
    pub streams: Vec<StreamConfig>,
}

impl SensoriumConfig {
    /// Look up a stream declaration by its key
    pub fn stream(&self, key: &str) -> ConfigResult<&StreamConfig> {
        self.streams
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| ConfigError::UnknownStream(key.to_string()))
    }

    /// Look up a component instance by name
    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Buffering for a stream, falling back to the runtime default
    pub fn effective_buffering(&self, stream: &StreamConfig) -> BufferingConfig {
        stream
            .buffering
            .clone()
            .unwrap_or_else(|| self.runtime.default_buffering.clone())
    }
}

/// Runtime-wide settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Buffering used by streams that do not declare their own
    pub default_buffering: BufferingConfig,
    /// Sleep applied by a production loop when a producer returns no frames
    pub production_idle_backoff_us: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_buffering: BufferingConfig::default(),
            production_idle_backoff_us: 500,
        }
    }
}

/// Logging settings consumed by `sensorium-observability`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    /// Run directories are created here when file logging is enabled
    pub log_dir: Option<PathBuf>,
    pub retain_runs: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            log_dir: None,
            retain_runs: 10,
        }
    }
}

/// Property lock settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockSettings {
    /// 0 polls once, negative waits forever, positive waits that many milliseconds
    pub default_property_lock_timeout_ms: i64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_property_lock_timeout_ms: -1,
        }
    }
}

/// One component instance and the arguments handed to its producers
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    /// Name of the producer factory registered with the runtime
    pub component: String,
    pub arguments: BTreeMap<String, String>,
}

/// A stream key bound to one port of one instance
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    pub key: String,
    pub instance: String,
    pub port_type: String,
    pub port_id: i32,
    pub arguments: BTreeMap<String, String>,
    pub buffering: Option<BufferingConfig>,
}

/// Frame buffering of a stream
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferingConfig {
    pub enabled: bool,
    /// Maximum frames held by a stream (queued plus acquired); 0 means unbounded
    pub num: usize,
    pub format: BufferFormat,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num: 4,
            format: BufferFormat::Discard,
        }
    }
}

/// What a full stream buffer does with a new frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferFormat {
    /// Reject the incoming frame
    #[default]
    Discard,
    /// Evict the oldest unread frame
    Overwrite,
}
