// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # sensorium-observability
//!
//! Logging setup shared by every sensorium binary and test harness.
//!
//! Per-crate debug output is switched on with `--debug-<crate>` flags or the
//! `SENSORIUM_DEBUG` environment variable; `RUST_LOG` overrides both.
//!
//! ## Features
//! - `file-logging`: JSON log files in timestamped run directories

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod config;
pub mod init;

pub use cli::*;
pub use config::*;
pub use init::*;

/// Known sensorium crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "sensorium",
    "sensorium-core",
    "sensorium-config",
    "sensorium-observability",
];
