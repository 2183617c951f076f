// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! Three tiers, later tiers win:
//! 1. TOML file
//! 2. Environment variables
//! 3. CLI arguments

use crate::{ConfigError, ConfigResult, SensoriumConfig};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "sensorium.toml";

/// Find the sensorium configuration file
///
/// Search order:
/// 1. `SENSORIUM_CONFIG_PATH` environment variable
/// 2. `./sensorium.toml`
/// 3. `./config/sensorium.toml`
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var("SENSORIUM_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by SENSORIUM_CONFIG_PATH not found: {}",
            path.display()
        )));
    }

    let mut search_paths = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));
        search_paths.push(cwd.join("config").join(CONFIG_FILE_NAME));
    }

    if let Some(found) = search_paths.iter().find(|p| p.exists()) {
        return Ok(found.clone());
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "'{}' not found in any of these locations:\n{}\n\nSet SENSORIUM_CONFIG_PATH to specify a custom location.",
        CONFIG_FILE_NAME, search_list
    )))
}

/// Load configuration from a TOML file
///
/// * `config_path` - explicit file; when `None` the file is searched for
/// * `cli_args` - optional CLI overrides (`log_level`, `log_dir`, `buffer_num`, `lock_timeout_ms`)
///
/// # Errors
///
/// Returns an error if the file is missing, unreadable or not valid TOML.
/// Validation is a separate step (`validate_config`).
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<SensoriumConfig> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config: SensoriumConfig = toml::from_str(&content)?;

    apply_environment_overrides(&mut config);
    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli);
    }

    Ok(config)
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `SENSORIUM_LOG_LEVEL` -> `logging.level`
/// - `SENSORIUM_LOG_DIR` -> `logging.log_dir`
/// - `SENSORIUM_BUFFER_NUM` -> `runtime.default_buffering.num`
/// - `SENSORIUM_LOCK_TIMEOUT_MS` -> `locks.default_property_lock_timeout_ms`
pub fn apply_environment_overrides(config: &mut SensoriumConfig) {
    if let Ok(value) = env::var("SENSORIUM_LOG_LEVEL") {
        config.logging.level = value.to_lowercase();
    }
    if let Ok(value) = env::var("SENSORIUM_LOG_DIR") {
        config.logging.log_dir = Some(PathBuf::from(value));
    }
    if let Ok(value) = env::var("SENSORIUM_BUFFER_NUM") {
        if let Ok(num) = value.parse::<usize>() {
            config.runtime.default_buffering.num = num;
        }
    }
    if let Ok(value) = env::var("SENSORIUM_LOCK_TIMEOUT_MS") {
        if let Ok(timeout) = value.parse::<i64>() {
            config.locks.default_property_lock_timeout_ms = timeout;
        }
    }
}

/// Apply CLI argument overrides to configuration
///
/// `cli_args` holds already-split pairs such as `{"log_level": "debug"}`.
/// Values that fail to parse are ignored.
pub fn apply_cli_overrides(config: &mut SensoriumConfig, cli_args: &HashMap<String, String>) {
    if let Some(value) = cli_args.get("log_level") {
        config.logging.level = value.to_lowercase();
    }
    if let Some(value) = cli_args.get("log_dir") {
        config.logging.log_dir = Some(PathBuf::from(value));
    }
    if let Some(value) = cli_args.get("buffer_num") {
        if let Ok(num) = value.parse::<usize>() {
            config.runtime.default_buffering.num = num;
        }
    }
    if let Some(value) = cli_args.get("lock_timeout_ms") {
        if let Ok(timeout) = value.parse::<i64>() {
            config.locks.default_property_lock_timeout_ms = timeout;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_find_config_file_env_var() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("custom.toml");
        File::create(&config_path).unwrap();

        env::set_var("SENSORIUM_CONFIG_PATH", config_path.to_str().unwrap());
        let result = find_config_file();
        env::remove_var("SENSORIUM_CONFIG_PATH");

        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn test_find_config_file_env_var_missing_file() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("absent.toml");

        env::set_var("SENSORIUM_CONFIG_PATH", config_path.to_str().unwrap());
        let result = find_config_file();
        env::remove_var("SENSORIUM_CONFIG_PATH");

        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_minimal_config() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        env::remove_var("SENSORIUM_BUFFER_NUM");
        env::remove_var("SENSORIUM_LOG_LEVEL");
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[runtime.default_buffering]").unwrap();
        writeln!(file, "num = 16").unwrap();
        writeln!(file, "[[instances]]").unwrap();
        writeln!(file, "name = \"mic\"").unwrap();
        writeln!(file, "component = \"audio\"").unwrap();

        let config = load_config(Some(config_path.as_path()), None).unwrap();

        assert_eq!(config.runtime.default_buffering.num, 16);
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, "[[streams]\nkey = ").unwrap();

        assert!(matches!(
            load_config(Some(config_path.as_path()), None),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let mut config = SensoriumConfig::default();

        env::set_var("SENSORIUM_LOG_LEVEL", "DEBUG");
        env::set_var("SENSORIUM_LOCK_TIMEOUT_MS", "250");
        env::set_var("SENSORIUM_BUFFER_NUM", "not-a-number");

        apply_environment_overrides(&mut config);

        env::remove_var("SENSORIUM_LOG_LEVEL");
        env::remove_var("SENSORIUM_LOCK_TIMEOUT_MS");
        env::remove_var("SENSORIUM_BUFFER_NUM");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.locks.default_property_lock_timeout_ms, 250);
        assert_eq!(config.runtime.default_buffering.num, 4);
    }

    #[test]
    fn test_override_precedence() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &config_path,
            "[logging]\nlevel = \"warn\"\n[locks]\ndefault_property_lock_timeout_ms = 10\n",
        )
        .unwrap();

        env::set_var("SENSORIUM_LOG_LEVEL", "debug");
        env::set_var("SENSORIUM_LOCK_TIMEOUT_MS", "20");

        let mut cli_args = HashMap::new();
        cli_args.insert("log_level".to_string(), "trace".to_string());

        let config = load_config(Some(config_path.as_path()), Some(&cli_args)).unwrap();

        env::remove_var("SENSORIUM_LOG_LEVEL");
        env::remove_var("SENSORIUM_LOCK_TIMEOUT_MS");

        // CLI wins for level, env wins for timeout (no CLI override)
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.locks.default_property_lock_timeout_ms, 20);
    }
}
