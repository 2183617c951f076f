// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file to running streams and back

use parking_lot::Mutex;
use sensorium::config::{load_config, validate_config, BufferFormat};
use sensorium::observability::{CrateDebugFlags, LoggingOptions};
use sensorium::prelude::*;
use sensorium::stream_core::{Channel, StreamState};
use serde_json::json;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[logging]
level = "debug"

[runtime]
production_idle_backoff_us = 200

[runtime.default_buffering]
num = 2
format = "overwrite"

[[instances]]
name = "imu0"
component = "queue"

[instances.arguments]
rate_hz = "200"

[[streams]]
key = "imu.accel"
instance = "imu0"
port_type = "accel"
port_id = 0

[[streams]]
key = "imu.gyro"
instance = "imu0"
port_type = "gyro"
port_id = 0

[streams.buffering]
enabled = false
"#;

#[derive(Default)]
struct QueueProducer {
    pending: Mutex<VecDeque<Frame>>,
    reclaimed: Mutex<Vec<u64>>,
    rate: Mutex<PropertyValue>,
    opened_with: Mutex<Option<String>>,
}

impl QueueProducer {
    fn push(&self, sequence_number: u64) {
        self.pending
            .lock()
            .push_back(Frame::new(sequence_number, 0, vec![Channel::new(0, vec![7u8; 12])]));
    }
}

impl Producer for QueueProducer {
    fn open(&self, context: &ProducerContext) -> CoreResult<()> {
        *self.opened_with.lock() = Some(context.address().to_string());
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
        Ok(self.pending.lock().drain(..).collect())
    }
    fn release_frame(&self, frame: &Frame, _referenced_channel_ids: &[u32]) -> CoreResult<()> {
        self.reclaimed.lock().push(frame.sequence_number);
        Ok(())
    }
    fn property_keys(&self) -> Vec<String> {
        vec!["rate".to_string()]
    }
    fn get_property(&self, _key: &PropertyKey) -> CoreResult<PropertyValue> {
        Ok(self.rate.lock().clone())
    }
    fn set_property(&self, _key: &PropertyKey, value: &PropertyValue) -> CoreResult<()> {
        *self.rate.lock() = value.clone();
        Ok(())
    }
}

fn write_config() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    file
}

fn start_runtime(config: SensoriumConfig) -> (Runtime, Arc<Mutex<Vec<Arc<QueueProducer>>>>) {
    let producers = Arc::new(Mutex::new(Vec::new()));
    let registry = ProducerRegistry::new();
    {
        let producers = Arc::clone(&producers);
        registry
            .register("queue", move |spec: &ProducerSpec| {
                assert_eq!(spec.arguments.get("rate_hz").map(String::as_str), Some("200"));
                let producer = Arc::new(QueueProducer::default());
                producers.lock().push(Arc::clone(&producer));
                Ok(producer as Arc<dyn Producer>)
            })
            .unwrap();
    }
    let runtime = Runtime::new(config, registry);
    runtime.init().unwrap();
    (runtime, producers)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(std::time::Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_config_file_drives_runtime() {
    let file = write_config();
    let config = load_config(Some(file.path()), None).unwrap();
    validate_config(&config).unwrap();
    assert_eq!(config.runtime.default_buffering.format, BufferFormat::Overwrite);

    let options = LoggingOptions::try_from(&config.logging).unwrap();
    assert_eq!(options.level, "debug");
    let flags = CrateDebugFlags::from_args(["stream_soak", "--debug-sensorium-core"].map(String::from));
    assert!(flags.is_enabled("sensorium-core"));

    let (runtime, producers) = start_runtime(config);
    assert_eq!(producers.lock().len(), 2);
    assert_eq!(runtime.stream_keys().unwrap(), vec!["imu.accel", "imu.gyro"]);
    runtime.exit().unwrap();
}

#[test]
fn test_overwrite_keeps_latest_frames() {
    let file = write_config();
    let (runtime, producers) = start_runtime(load_config(Some(file.path()), None).unwrap());
    let stream = runtime.open_stream("imu.accel").unwrap();
    runtime.start_stream(&stream).unwrap();
    let producer = producers
        .lock()
        .iter()
        .find(|p| p.opened_with.lock().as_deref() == Some("imu0.accel.0"))
        .cloned()
        .unwrap();

    for sequence_number in 0..5 {
        producer.push(sequence_number);
    }
    // Capacity two: the three oldest are evicted and reclaimed
    wait_until(|| producer.reclaimed.lock().len() == 3);
    let first = stream.get_frame(WaitTimeout::Poll).unwrap();
    let second = stream.get_frame(WaitTimeout::Poll).unwrap();
    assert_eq!((first.sequence_number, second.sequence_number), (3, 4));

    stream.release_frame(&first).unwrap();
    stream.release_frame(&second).unwrap();
    assert_eq!(*producer.reclaimed.lock(), vec![0, 1, 2, 3, 4]);
    runtime.exit().unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn test_unbuffered_stream_holds_one_frame() {
    let file = write_config();
    let (runtime, _producers) = start_runtime(load_config(Some(file.path()), None).unwrap());
    let stream = runtime.open_stream("imu.gyro").unwrap();
    let policy = stream.buffer_policy();
    assert_eq!(policy.capacity, Some(1));
    assert_eq!(policy.format, BufferFormat::Overwrite);
    runtime.close_stream(&stream).unwrap();
    runtime.exit().unwrap();
}

#[test]
fn test_property_updates_notify_every_stream_on_port() {
    let file = write_config();
    let (runtime, _producers) = start_runtime(load_config(Some(file.path()), None).unwrap());
    let a = runtime.open_stream("imu.accel").unwrap();
    let b = runtime.open_stream("imu.accel").unwrap();
    let updates = Arc::new(AtomicUsize::new(0));
    for stream in [&a, &b] {
        let updates = Arc::clone(&updates);
        stream
            .register_event_handler("EventPropertyUpdated", move |event| {
                if let StreamEvent::PropertyUpdated { key } = event {
                    assert_eq!(key, "rate");
                    updates.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    a.set_property("rate", &json!(400)).unwrap();
    assert_eq!(b.get_property("rate").unwrap(), json!(400));
    assert_eq!(updates.load(Ordering::SeqCst), 2);
    assert_eq!(a.supported_property_keys(), vec!["rate".to_string()]);
    runtime.exit().unwrap();
}

#[test]
fn test_runtime_default_lock_timeout() {
    let file = write_config();
    let (runtime, _producers) = start_runtime(load_config(Some(file.path()), None).unwrap());
    assert_eq!(runtime.default_property_lock_timeout(), WaitTimeout::Forever);

    let a = runtime.open_stream("imu.accel").unwrap();
    let b = runtime.open_stream("imu.accel").unwrap();
    let resource = a.lock_property(&["rate"], runtime.default_property_lock_timeout()).unwrap();
    let err = b.lock_property(&["rate"], WaitTimeout::Poll).unwrap_err();
    assert_eq!(err.cause(), ErrorCause::Timeout);
    a.unlock_property(&resource).unwrap();
    runtime.exit().unwrap();
}
