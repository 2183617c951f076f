// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: a producer driven by the test and a matching runtime

#![allow(dead_code)]

use parking_lot::Mutex;
use sensorium_config::{InstanceConfig, SensoriumConfig, StreamConfig};
use sensorium_core::{
    Channel, CoreError, CoreResult, Frame, Producer, ProducerContext, ProducerRegistry, ProducerSpec,
    PropertyKey, PropertyValue, Runtime,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Emits exactly the frames the test queues and records reclaims
#[derive(Default)]
pub struct ScriptedProducer {
    pending: Mutex<VecDeque<Frame>>,
    reclaimed: Mutex<Vec<(u64, Vec<u32>)>>,
    properties: Mutex<BTreeMap<String, PropertyValue>>,
    context: Mutex<Option<ProducerContext>>,
}

impl ScriptedProducer {
    pub fn emit(&self, sequence_number: u64) {
        self.pending.lock().push_back(Frame::new(
            sequence_number,
            sequence_number * 1_000,
            vec![Channel::new(0, vec![0u8; 16]), Channel::new(1, vec![1u8; 4])],
        ));
    }

    pub fn reclaimed(&self) -> Vec<(u64, Vec<u32>)> {
        self.reclaimed.lock().clone()
    }

    pub fn reclaim_count(&self, sequence_number: u64) -> usize {
        self.reclaimed
            .lock()
            .iter()
            .filter(|(seq, _)| *seq == sequence_number)
            .count()
    }

    pub fn context(&self) -> Option<ProducerContext> {
        self.context.lock().clone()
    }
}

impl Producer for ScriptedProducer {
    fn open(&self, context: &ProducerContext) -> CoreResult<()> {
        *self.context.lock() = Some(context.clone());
        Ok(())
    }

    fn close(&self) -> CoreResult<()> {
        *self.context.lock() = None;
        Ok(())
    }

    fn start(&self) -> CoreResult<()> {
        Ok(())
    }

    fn stop(&self) -> CoreResult<()> {
        Ok(())
    }

    fn get_frames(&self) -> CoreResult<Vec<Frame>> {
        Ok(self.pending.lock().drain(..).collect())
    }

    fn release_frame(&self, frame: &Frame, referenced_channel_ids: &[u32]) -> CoreResult<()> {
        self.reclaimed
            .lock()
            .push((frame.sequence_number, referenced_channel_ids.to_vec()));
        Ok(())
    }

    fn property_keys(&self) -> Vec<String> {
        vec!["k1".into(), "k2".into(), "gain".into()]
    }

    fn get_property(&self, key: &PropertyKey) -> CoreResult<PropertyValue> {
        self.properties
            .lock()
            .get(key.full())
            .cloned()
            .ok_or_else(|| CoreError::not_found("scripted", key.full()))
    }

    fn set_property(&self, key: &PropertyKey, value: &PropertyValue) -> CoreResult<()> {
        self.properties.lock().insert(key.full().to_string(), value.clone());
        Ok(())
    }
}

pub fn config() -> SensoriumConfig {
    let mut config = SensoriumConfig {
        instances: vec![InstanceConfig {
            name: "cam0".into(),
            component: "scripted".into(),
            arguments: BTreeMap::new(),
        }],
        streams: vec![
            StreamConfig {
                key: "cam.image".into(),
                instance: "cam0".into(),
                port_type: "image".into(),
                port_id: 0,
                ..Default::default()
            },
            StreamConfig {
                key: "cam.depth".into(),
                instance: "cam0".into(),
                port_type: "depth".into(),
                port_id: 0,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    config.runtime.production_idle_backoff_us = 200;
    config
}

/// Initialized runtime plus the producers it created, keyed by port type
pub fn runtime() -> (Runtime, Arc<Mutex<BTreeMap<String, Arc<ScriptedProducer>>>>) {
    let producers = Arc::new(Mutex::new(BTreeMap::new()));
    let registry = ProducerRegistry::new();
    {
        let producers = Arc::clone(&producers);
        registry
            .register("scripted", move |spec: &ProducerSpec| {
                let producer = Arc::new(ScriptedProducer::default());
                producers.lock().insert(spec.port_type.clone(), Arc::clone(&producer));
                Ok(producer as Arc<dyn Producer>)
            })
            .unwrap();
    }
    let runtime = Runtime::new(config(), registry);
    runtime.init().unwrap();
    (runtime, producers)
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        std::thread::sleep(Duration::from_millis(1));
    }
}
