// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization
//!
//! Console output always; with the `file-logging` feature and a `log_dir`,
//! a JSON log file per run as well:
//! ```text
//! <log_dir>/
//!   └── run_20250101_120000/
//!       └── sensorium.log
//! ```

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;
use crate::config::{LogFormat, LoggingOptions};

const RUN_PREFIX: &str = "run_";
const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Keeps file writers alive; logs are flushed when dropped
pub struct LoggingGuard {
    #[cfg(feature = "file-logging")]
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    run_dir: Option<PathBuf>,
}

impl LoggingGuard {
    /// Directory of this run's log files, if file output is active
    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }
}

/// `RUST_LOG` when set, otherwise the debug flags over the configured level
pub fn build_env_filter(options: &LoggingOptions, debug_flags: &CrateDebugFlags) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(debug_flags.to_filter_string(&options.level)))
}

/// Install the global subscriber
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the run directory
/// cannot be created.
pub fn init_logging(options: &LoggingOptions, debug_flags: &CrateDebugFlags) -> Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console_layer = match options.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(build_env_filter(options, debug_flags))
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_thread_names(true)
            .with_filter(build_env_filter(options, debug_flags))
            .boxed(),
    };
    layers.push(console_layer);

    #[cfg(feature = "file-logging")]
    let (file_guard, run_dir) = match &options.log_dir {
        Some(base) => {
            let run_dir = create_run_dir(base)?;
            cleanup_old_runs(base, options.retain_runs)?;

            let appender = tracing_appender::rolling::never(&run_dir, "sensorium.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .with_filter(build_env_filter(options, debug_flags))
                    .boxed(),
            );
            (Some(guard), Some(run_dir))
        }
        None => (None, None),
    };

    #[cfg(not(feature = "file-logging"))]
    let run_dir: Option<PathBuf> = None;

    Registry::default()
        .with(layers)
        .try_init()
        .context("Failed to install global tracing subscriber")?;

    #[cfg(not(feature = "file-logging"))]
    if options.log_dir.is_some() {
        tracing::warn!("[OBSERVABILITY] log_dir is set but file-logging is not compiled in");
    }

    Ok(LoggingGuard {
        #[cfg(feature = "file-logging")]
        _file_guard: file_guard,
        run_dir,
    })
}

/// Console-only logging at `info` with debug flags from the environment
pub fn init_logging_default() -> Result<LoggingGuard> {
    init_logging(&LoggingOptions::default(), &crate::cli::parse_debug_flags())
}

/// Create `<base>/run_<timestamp>`
pub fn create_run_dir(base: &Path) -> Result<PathBuf> {
    let run_dir = base.join(format!(
        "{}{}",
        RUN_PREFIX,
        Utc::now().format(RUN_TIMESTAMP_FORMAT)
    ));
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create log directory: {}", run_dir.display()))?;
    Ok(run_dir)
}

/// Remove the oldest run directories so at most `retain_runs` remain
///
/// Directories whose names do not parse as run timestamps are left alone.
/// Returns how many directories were removed.
pub fn cleanup_old_runs(base: &Path, retain_runs: usize) -> Result<usize> {
    if !base.exists() {
        return Ok(0);
    }

    let mut runs: Vec<(PathBuf, NaiveDateTime)> = Vec::new();
    for entry in std::fs::read_dir(base)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let stamp = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(RUN_PREFIX))
            .and_then(|s| NaiveDateTime::parse_from_str(s, RUN_TIMESTAMP_FORMAT).ok());
        if let Some(stamp) = stamp {
            runs.push((path, stamp));
        }
    }

    if runs.len() <= retain_runs {
        return Ok(0);
    }

    runs.sort_by_key(|(_, stamp)| *stamp);
    let excess = runs.len() - retain_runs;
    let mut removed = 0;
    for (path, _) in runs.into_iter().take(excess) {
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!(
                "Warning: Failed to remove old log directory {}: {}",
                path.display(),
                e
            ),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cleanup_keeps_most_recent_runs() {
        let dir = tempdir().unwrap();
        for stamp in ["20250101_000000", "20250102_000000", "20250103_000000"] {
            std::fs::create_dir(dir.path().join(format!("run_{}", stamp))).unwrap();
        }
        std::fs::create_dir(dir.path().join("keep_me")).unwrap();

        let removed = cleanup_old_runs(dir.path(), 2).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.path().join("run_20250101_000000").exists());
        assert!(dir.path().join("run_20250103_000000").exists());
        assert!(dir.path().join("keep_me").exists());
    }

    #[test]
    fn test_cleanup_missing_base_is_noop() {
        let dir = tempdir().unwrap();
        assert_eq!(cleanup_old_runs(&dir.path().join("absent"), 1).unwrap(), 0);
    }

    #[test]
    fn test_create_run_dir() {
        let dir = tempdir().unwrap();
        let run_dir = create_run_dir(dir.path()).unwrap();
        assert!(run_dir.is_dir());
        assert!(run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(RUN_PREFIX)));
    }
}
