// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # sensorium
//!
//! Process-local sensor streaming runtime. Many independent streams attach to
//! ports driven by pluggable producers; a root runtime governs
//! initialization and teardown.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! sensorium = "0.1"
//! ```
//!
//! ```rust,no_run
//! use sensorium::prelude::*;
//! # fn producer() -> std::sync::Arc<dyn Producer> { unimplemented!() }
//!
//! let config = load_config(None, None)?;
//! let registry = ProducerRegistry::new();
//! registry.register("camera", |_spec: &ProducerSpec| Ok(producer()))?;
//!
//! let runtime = Runtime::new(config, registry);
//! runtime.init()?;
//! let stream = runtime.open_stream("camera.image")?;
//! runtime.start_stream(&stream)?;
//! let frame = stream.get_frame(WaitTimeout::Forever)?;
//! stream.release_frame(&frame)?;
//! runtime.close_stream(&stream)?;
//! runtime.exit()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Crates
//! - [`config`]: configuration structures, loader and validation
//! - [`stream_core`]: gates, ports, producers, streams and the runtime
//! - [`observability`]: logging initialization and debug flags

pub use sensorium_config as config;
pub use sensorium_core as stream_core;
pub use sensorium_observability as observability;

/// Version of the umbrella crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used items
pub mod prelude {
    pub use sensorium_config::{load_config, validate_config, SensoriumConfig};
    pub use sensorium_core::{
        CoreError, CoreResult, ErrorCause, Frame, LockResource, Producer, ProducerContext, ProducerRegistry,
        ProducerSpec, PropertyKey, PropertyValue, Runtime, Stream, StreamEvent, WaitTimeout,
    };
}
