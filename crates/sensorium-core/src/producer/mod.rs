// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Producer contract

A producer is the component-specific part of a port: it opens the device,
hands out frames and serves properties. Everything else (fan-out, release
bookkeeping, call serialization, the production thread) lives in
[`ProducerAdapter`].
*/

pub mod adapter;

pub use adapter::ProducerAdapter;

use crate::error::{CoreError, CoreResult};
use crate::port::FramePort;
use crate::property::PropertyKey;
use crate::types::{Frame, PortAddress, PropertyValue, StreamArguments, StreamEvent, WaitTimeout};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Component-specific frame source behind one port
///
/// Calls are serialized by the adapter: `open`/`close`/`start`/`stop` never
/// overlap anything, `release_frame` calls never overlap each other and
/// property calls never overlap each other. `get_frames` runs on the
/// production thread and should return promptly (empty when idle).
pub trait Producer: Send + Sync {
    fn open(&self, context: &ProducerContext) -> CoreResult<()>;

    fn close(&self) -> CoreResult<()>;

    fn start(&self) -> CoreResult<()>;

    fn stop(&self) -> CoreResult<()>;

    fn get_frames(&self) -> CoreResult<Vec<Frame>>;

    /// Take back a frame nobody uses any more
    fn release_frame(&self, frame: &Frame, referenced_channel_ids: &[u32]) -> CoreResult<()>;

    /// Base keys this producer serves
    fn property_keys(&self) -> Vec<String>;

    fn get_property(&self, key: &PropertyKey) -> CoreResult<PropertyValue>;

    fn set_property(&self, key: &PropertyKey, value: &PropertyValue) -> CoreResult<()>;

    /// Notified after a stream takes an explicit lock on `keys`
    fn lock_property(&self, _keys: &[PropertyKey], _remaining: WaitTimeout) -> CoreResult<()> {
        Ok(())
    }

    /// Notified before an explicit lock on `keys` is released
    fn unlock_property(&self, _keys: &[PropertyKey]) -> CoreResult<()> {
        Ok(())
    }
}

/// Handed to [`Producer::open`]
#[derive(Debug, Clone)]
pub struct ProducerContext {
    address: PortAddress,
    arguments: StreamArguments,
    port: Weak<FramePort>,
}

impl ProducerContext {
    pub(crate) fn new(address: PortAddress, arguments: StreamArguments, port: Weak<FramePort>) -> Self {
        Self {
            address,
            arguments,
            port,
        }
    }

    pub fn address(&self) -> &PortAddress {
        &self.address
    }

    /// Arguments of the stream that opened the port
    pub fn arguments(&self) -> &StreamArguments {
        &self.arguments
    }

    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }

    /// Send `event` to every stream connected to this port
    pub fn send_event(&self, event: &StreamEvent) -> CoreResult<()> {
        let port = self.port.upgrade().ok_or_else(|| {
            CoreError::invalid_operation(self.address.to_string(), "port no longer exists")
        })?;
        port.send_event(event)
    }
}

/// What a factory needs to build one producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSpec {
    pub instance: String,
    pub component: String,
    pub port_type: String,
    pub port_id: i32,
    /// Instance-level arguments from configuration
    pub arguments: BTreeMap<String, String>,
}

impl ProducerSpec {
    pub fn address(&self) -> PortAddress {
        PortAddress::new(&self.instance, &self.port_type, self.port_id)
    }
}

pub type ProducerFactory = Arc<dyn Fn(&ProducerSpec) -> CoreResult<Arc<dyn Producer>> + Send + Sync>;

/// Component name to producer factory
#[derive(Default, Clone)]
pub struct ProducerRegistry {
    factories: Arc<RwLock<AHashMap<String, ProducerFactory>>>,
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("components", &self.components())
            .finish()
    }
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, component: impl Into<String>, factory: F) -> CoreResult<()>
    where
        F: Fn(&ProducerSpec) -> CoreResult<Arc<dyn Producer>> + Send + Sync + 'static,
    {
        let component = component.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&component) {
            return Err(CoreError::already_exists(
                "producer-registry",
                format!("component '{}' is already registered", component),
            ));
        }
        debug!("[PRODUCER] registered component '{}'", component);
        factories.insert(component, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, component: &str) -> bool {
        self.factories.read().contains_key(component)
    }

    pub fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, spec: &ProducerSpec) -> CoreResult<Arc<dyn Producer>> {
        let factory = self
            .factories
            .read()
            .get(&spec.component)
            .cloned()
            .ok_or_else(|| {
                CoreError::not_found(
                    "producer-registry",
                    format!("component '{}' is not registered", spec.component),
                )
            })?;
        factory(spec)
    }
}
