// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Root runtime context

Owns the lifecycle gate, one port per configured (instance, port type,
port id) and every open stream. Each public call takes the matching
lifecycle admission before touching anything:

- `init` / `exit`: Init / Exit
- `open_stream`, `start_stream`, `stop_stream`, `close_stream`: Stream(port identity)
- queries: ReadOnly
*/

use crate::error::{CoreError, CoreResult, Traced};
use crate::lifecycle_gate::LifecycleGate;
use crate::port::FramePort;
use crate::producer::{ProducerAdapter, ProducerRegistry, ProducerSpec};
use crate::stream::{BufferPolicy, Stream};
use crate::types::{PortAddress, StreamId, WaitTimeout};
use ahash::AHashMap;
use parking_lot::RwLock;
use sensorium_config::{validate_config, SensoriumConfig, StreamConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BLOCK: &str = "runtime";

pub struct Runtime {
    config: SensoriumConfig,
    registry: ProducerRegistry,
    gate: LifecycleGate,
    ports: RwLock<AHashMap<PortAddress, Arc<FramePort>>>,
    streams: RwLock<BTreeMap<StreamId, Arc<Stream>>>,
    next_stream: AtomicU64,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("initialized", &self.gate.is_initialized())
            .field("ports", &self.ports.read().len())
            .field("streams", &self.streams.read().len())
            .finish()
    }
}

impl Runtime {
    pub fn new(config: SensoriumConfig, registry: ProducerRegistry) -> Self {
        Self {
            config,
            registry,
            gate: LifecycleGate::new(),
            ports: RwLock::new(AHashMap::new()),
            streams: RwLock::new(BTreeMap::new()),
            next_stream: AtomicU64::new(1),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.gate.is_initialized()
    }

    /// Validate the configuration and create every configured port
    pub fn init(&self) -> CoreResult<()> {
        let guard = self.gate.lock_for_init()?;
        validate_config(&self.config).map_err(|e| CoreError::invalid_argument(BLOCK, e.to_string()))?;

        let backoff = Duration::from_micros(self.config.runtime.production_idle_backoff_us);
        let mut ports = AHashMap::new();
        for stream in &self.config.streams {
            let address = port_address(stream);
            if ports.contains_key(&address) {
                continue;
            }
            let instance = self.config.instance(&stream.instance).ok_or_else(|| {
                CoreError::not_found(BLOCK, format!("instance '{}' is not declared", stream.instance))
            })?;
            let spec = ProducerSpec {
                instance: instance.name.clone(),
                component: instance.component.clone(),
                port_type: stream.port_type.clone(),
                port_id: stream.port_id,
                arguments: instance.arguments.clone(),
            };
            let producer = self.registry.create(&spec).traced()?;
            debug!("[RUNTIME] port {} uses component '{}'", address, spec.component);
            ports.insert(address.clone(), ProducerAdapter::attach(address, producer, backoff));
        }

        let count = ports.len();
        *self.ports.write() = ports;
        guard.set_initialized(true);
        info!("[RUNTIME] initialized with {} ports", count);
        Ok(())
    }

    /// Stop and close every open stream, then drop the ports
    ///
    /// Teardown always completes; the first stream error is returned.
    pub fn exit(&self) -> CoreResult<()> {
        let guard = self.gate.lock_for_exit()?;

        let streams = std::mem::take(&mut *self.streams.write());
        let mut first_error = None;
        for stream in streams.into_values() {
            if let Err(e) = stream.close() {
                warn!("[RUNTIME] closing {} during exit failed: {}", stream.key(), e);
                first_error.get_or_insert(e);
            }
        }

        self.ports.write().clear();
        guard.set_initialized(false);
        info!("[RUNTIME] exited");
        match first_error {
            Some(e) => Err(e.traced()),
            None => Ok(()),
        }
    }

    fn stream_config(&self, key: &str) -> CoreResult<&StreamConfig> {
        self.config
            .stream(key)
            .map_err(|e| CoreError::not_found(BLOCK, e.to_string()))
    }

    /// Open a new stream on the port configured for `key`
    pub fn open_stream(&self, key: &str) -> CoreResult<Arc<Stream>> {
        let stream_config = self.stream_config(key)?;
        let address = port_address(stream_config);
        let _guard = self.gate.lock_for_stream(&address.identity())?;

        let port = self
            .ports
            .read()
            .get(&address)
            .cloned()
            .ok_or_else(|| CoreError::not_found(BLOCK, format!("no port {}", address)))?;
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let policy = BufferPolicy::from(&self.config.effective_buffering(stream_config));
        let stream = Stream::new(id, key, port, stream_config.arguments.clone(), policy);

        stream.open().traced()?;
        self.streams.write().insert(id, Arc::clone(&stream));
        info!("[RUNTIME] opened '{}' as {}", key, id);
        Ok(stream)
    }

    fn ensure_open(&self, stream: &Stream) -> CoreResult<()> {
        match self.streams.read().get(&stream.id()) {
            Some(known) if std::ptr::eq(Arc::as_ptr(known), stream) => Ok(()),
            _ => Err(CoreError::invalid_argument(
                BLOCK,
                format!("{} is not open in this runtime", stream.id()),
            )),
        }
    }

    pub fn start_stream(&self, stream: &Stream) -> CoreResult<()> {
        let _guard = self.gate.lock_for_stream(&stream.address().identity())?;
        self.ensure_open(stream)?;
        stream.start().traced()
    }

    pub fn stop_stream(&self, stream: &Stream) -> CoreResult<()> {
        let _guard = self.gate.lock_for_stream(&stream.address().identity())?;
        self.ensure_open(stream)?;
        stream.stop().traced()
    }

    /// Close `stream`, stopping it first if it is running
    ///
    /// Threads that close the same stream concurrently all receive the
    /// result of the one close that ran.
    pub fn close_stream(&self, stream: &Stream) -> CoreResult<()> {
        let guard = self
            .gate
            .lock_for_closing_stream(&stream.address().identity(), stream.id())?;
        if let Some(result) = guard.close_status() {
            debug!("[RUNTIME] {} already closed by another caller", stream.id());
            return result.traced();
        }

        let result = self.ensure_open(stream).and_then(|()| stream.close());
        if result.is_ok() {
            self.streams.write().remove(&stream.id());
            info!("[RUNTIME] closed {}", stream.id());
        }
        guard.record_close_status(&result);
        result.traced()
    }

    pub fn stream_keys(&self) -> CoreResult<Vec<String>> {
        let _guard = self.gate.lock_for_read_only()?;
        Ok(self.config.streams.iter().map(|s| s.key.clone()).collect())
    }

    pub fn open_stream_count(&self) -> CoreResult<usize> {
        let _guard = self.gate.lock_for_read_only()?;
        Ok(self.streams.read().len())
    }

    pub fn config(&self) -> CoreResult<SensoriumConfig> {
        let _guard = self.gate.lock_for_read_only()?;
        Ok(self.config.clone())
    }

    /// Property lock timeout configured for callers that have no preference
    pub fn default_property_lock_timeout(&self) -> WaitTimeout {
        WaitTimeout::from_millis(self.config.locks.default_property_lock_timeout_ms)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.gate.is_initialized() {
            if let Err(e) = self.exit() {
                warn!("[RUNTIME] exit on drop failed: {}", e);
            }
        }
    }
}

fn port_address(stream: &StreamConfig) -> PortAddress {
    PortAddress::new(&stream.instance, &stream.port_type, stream.port_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCause, LifecycleConflict};
    use crate::producer::{Producer, ProducerContext};
    use crate::property::PropertyKey;
    use crate::types::{Frame, PropertyValue};
    use sensorium_config::InstanceConfig;

    struct Idle;

    impl Producer for Idle {
        fn open(&self, _context: &ProducerContext) -> CoreResult<()> {
            Ok(())
        }
        fn close(&self) -> CoreResult<()> {
            Ok(())
        }
        fn start(&self) -> CoreResult<()> {
            Ok(())
        }
        fn stop(&self) -> CoreResult<()> {
            Ok(())
        }
        fn get_frames(&self) -> CoreResult<Vec<Frame>> {
            Ok(Vec::new())
        }
        fn release_frame(&self, _frame: &Frame, _ids: &[u32]) -> CoreResult<()> {
            Ok(())
        }
        fn property_keys(&self) -> Vec<String> {
            Vec::new()
        }
        fn get_property(&self, key: &PropertyKey) -> CoreResult<PropertyValue> {
            Err(CoreError::not_found("idle", key.full()))
        }
        fn set_property(&self, key: &PropertyKey, _value: &PropertyValue) -> CoreResult<()> {
            Err(CoreError::not_found("idle", key.full()))
        }
    }

    fn config() -> SensoriumConfig {
        SensoriumConfig {
            instances: vec![InstanceConfig {
                name: "cam0".into(),
                component: "idle".into(),
                arguments: BTreeMap::new(),
            }],
            streams: vec![
                StreamConfig {
                    key: "image".into(),
                    instance: "cam0".into(),
                    port_type: "image".into(),
                    port_id: 0,
                    ..Default::default()
                },
                StreamConfig {
                    key: "depth".into(),
                    instance: "cam0".into(),
                    port_type: "depth".into(),
                    port_id: 0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn runtime() -> Runtime {
        let registry = ProducerRegistry::new();
        registry
            .register("idle", |_spec: &ProducerSpec| Ok(Arc::new(Idle) as Arc<dyn Producer>))
            .unwrap();
        Runtime::new(config(), registry)
    }

    #[test]
    fn test_init_exit_cycle() {
        let runtime = runtime();
        let err = runtime.open_stream("image").unwrap_err();
        assert_eq!(err.lifecycle_conflict(), Some(LifecycleConflict::NotInitialized));

        runtime.init().unwrap();
        let err = runtime.init().unwrap_err();
        assert_eq!(err.lifecycle_conflict(), Some(LifecycleConflict::AlreadyInitialized));
        assert_eq!(runtime.stream_keys().unwrap(), vec!["image", "depth"]);

        let stream = runtime.open_stream("image").unwrap();
        runtime.start_stream(&stream).unwrap();
        assert_eq!(runtime.open_stream_count().unwrap(), 1);

        runtime.exit().unwrap();
        assert!(!runtime.is_initialized());
        assert_eq!(
            runtime.exit().unwrap_err().lifecycle_conflict(),
            Some(LifecycleConflict::NotInitialized)
        );

        // Re-initialization after exit is allowed
        runtime.init().unwrap();
        assert_eq!(runtime.open_stream_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_component_fails_init() {
        let runtime = Runtime::new(config(), ProducerRegistry::new());
        assert_eq!(runtime.init().unwrap_err().cause(), ErrorCause::NotFound);
        assert!(!runtime.is_initialized());
    }

    #[test]
    fn test_invalid_config_fails_init() {
        let mut config = config();
        config.streams[0].instance = "missing".into();
        let runtime = Runtime::new(config, ProducerRegistry::new());
        assert_eq!(runtime.init().unwrap_err().cause(), ErrorCause::InvalidArgument);
    }

    #[test]
    fn test_unknown_stream_key() {
        let runtime = runtime();
        runtime.init().unwrap();
        assert_eq!(runtime.open_stream("nope").unwrap_err().cause(), ErrorCause::NotFound);
    }

    #[test]
    fn test_close_twice_and_foreign_stream() {
        let runtime = runtime();
        runtime.init().unwrap();
        let stream = runtime.open_stream("image").unwrap();
        runtime.close_stream(&stream).unwrap();
        assert_eq!(
            runtime.close_stream(&stream).unwrap_err().cause(),
            ErrorCause::InvalidArgument
        );

        let other = self::runtime();
        other.init().unwrap();
        let foreign = other.open_stream("image").unwrap();
        assert_eq!(
            runtime.start_stream(&foreign).unwrap_err().cause(),
            ErrorCause::InvalidArgument
        );
    }

    #[test]
    fn test_streams_share_one_port() {
        let runtime = runtime();
        runtime.init().unwrap();
        let a = runtime.open_stream("image").unwrap();
        let b = runtime.open_stream("image").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.address(), b.address());
        runtime.start_stream(&a).unwrap();
        runtime.start_stream(&b).unwrap();
        runtime.stop_stream(&a).unwrap();
        runtime.close_stream(&a).unwrap();
        runtime.close_stream(&b).unwrap();
        assert_eq!(runtime.open_stream_count().unwrap(), 0);
    }

    #[test]
    fn test_default_lock_timeout_from_config() {
        let mut config = config();
        config.locks.default_property_lock_timeout_ms = 250;
        let runtime = Runtime::new(config, ProducerRegistry::new());
        assert_eq!(
            runtime.default_property_lock_timeout(),
            WaitTimeout::After(Duration::from_millis(250))
        );
    }
}
