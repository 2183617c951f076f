// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Stream soak test.
//!
//! Opens several streams per configured stream key on synthetic producers,
//! reads and releases frames from a thread per stream for a fixed time while
//! another thread churns property locks, then closes everything and checks
//! that every produced frame was reclaimed exactly once.
//!
//! Prints a JSON summary and exits 1 when the reclaim accounting is off.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sensorium::config::{load_config, InstanceConfig, SensoriumConfig, StreamConfig};
use sensorium::observability::{init_logging, parse_debug_flags, LoggingOptions};
use sensorium::stream_core::{
    Channel, CoreError, CoreResult, ErrorCause, Frame, Producer, ProducerContext, ProducerRegistry, ProducerSpec,
    PropertyKey, PropertyValue, Runtime, WaitTimeout,
};
use serde_json::json;
use tracing::{info, warn};

const COMPONENT: &str = "synthetic";

struct Args {
    config: Option<PathBuf>,
    duration: Duration,
    streams_per_key: usize,
    overrides: HashMap<String, String>,
}

fn usage_and_exit() -> ! {
    eprintln!(
        "Usage: stream_soak [--config <path>] [--seconds <n>] [--streams <n>] [--log-level <level>]\n\n\
         Defaults:\n\
         - config: built-in single camera with image and depth ports\n\
         - seconds: 5\n\
         - streams: 3 per stream key\n\n\
         Every instance in a supplied config must use component '{COMPONENT}'.\n"
    );
    process::exit(2);
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        duration: Duration::from_secs(5),
        streams_per_key: 3,
        overrides: HashMap::new(),
    };

    let mut raw = env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => {
                let v = raw.next().unwrap_or_else(|| usage_and_exit());
                args.config = Some(PathBuf::from(v));
            }
            "--seconds" => {
                let v = raw.next().unwrap_or_else(|| usage_and_exit());
                args.duration = Duration::from_secs(v.parse().unwrap_or_else(|_| usage_and_exit()));
            }
            "--streams" => {
                let v = raw.next().unwrap_or_else(|| usage_and_exit());
                args.streams_per_key = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--log-level" => {
                let v = raw.next().unwrap_or_else(|| usage_and_exit());
                args.overrides.insert("log_level".to_string(), v);
            }
            "-h" | "--help" => usage_and_exit(),
            other if other.starts_with("--debug-") => {}
            other => {
                eprintln!("Unknown argument: {other}");
                usage_and_exit();
            }
        }
    }
    args
}

fn builtin_config() -> SensoriumConfig {
    let mut arguments = BTreeMap::new();
    arguments.insert("payload_bytes".to_string(), "4096".to_string());
    arguments.insert("channels".to_string(), "2".to_string());

    let stream = |key: &str, port_type: &str| StreamConfig {
        key: key.to_string(),
        instance: "cam0".to_string(),
        port_type: port_type.to_string(),
        port_id: 0,
        ..Default::default()
    };
    SensoriumConfig {
        instances: vec![InstanceConfig {
            name: "cam0".to_string(),
            component: COMPONENT.to_string(),
            arguments,
        }],
        streams: vec![stream("cam.image", "image"), stream("cam.depth", "depth")],
        ..Default::default()
    }
}

/// Emits numbered frames with fixed-size channels and counts reclaims
struct SyntheticProducer {
    channels: u32,
    payload: Arc<[u8]>,
    next: AtomicU64,
    running: AtomicBool,
    reclaims: Mutex<HashMap<u64, u32>>,
    exposure: Mutex<PropertyValue>,
}

impl SyntheticProducer {
    fn from_spec(spec: &ProducerSpec) -> CoreResult<Self> {
        let number = |name: &str, default: usize| -> CoreResult<usize> {
            match spec.arguments.get(name) {
                None => Ok(default),
                Some(text) => text.parse().map_err(|_| {
                    CoreError::invalid_argument(COMPONENT, format!("{name} must be a number, got '{text}'"))
                }),
            }
        };
        Ok(Self {
            channels: number("channels", 1)? as u32,
            payload: vec![0xA5u8; number("payload_bytes", 1024)?].into(),
            next: AtomicU64::new(0),
            running: AtomicBool::new(false),
            reclaims: Mutex::new(HashMap::new()),
            exposure: Mutex::new(json!(10)),
        })
    }

    fn produced(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// (frames never reclaimed, frames reclaimed more than once)
    fn audit(&self) -> (u64, u64) {
        let reclaims = self.reclaims.lock().unwrap_or_else(|p| p.into_inner());
        let missing = (0..self.produced()).filter(|n| !reclaims.contains_key(n)).count() as u64;
        let repeated = reclaims.values().filter(|count| **count > 1).count() as u64;
        (missing, repeated)
    }
}

impl Producer for SyntheticProducer {
    fn open(&self, context: &ProducerContext) -> CoreResult<()> {
        info!("[SOAK] {} opened", context.address());
        Ok(())
    }

    fn close(&self) -> CoreResult<()> {
        Ok(())
    }

    fn start(&self) -> CoreResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> CoreResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn get_frames(&self) -> CoreResult<Vec<Frame>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        thread::sleep(Duration::from_millis(1));
        let sequence_number = self.next.fetch_add(1, Ordering::SeqCst);
        let channels = (0..self.channels)
            .map(|id| Channel::new(id, Arc::clone(&self.payload)))
            .collect();
        Ok(vec![Frame::new(sequence_number, sequence_number * 1_000_000, channels)])
    }

    fn release_frame(&self, frame: &Frame, _referenced_channel_ids: &[u32]) -> CoreResult<()> {
        let mut reclaims = self.reclaims.lock().unwrap_or_else(|p| p.into_inner());
        *reclaims.entry(frame.sequence_number).or_default() += 1;
        Ok(())
    }

    fn property_keys(&self) -> Vec<String> {
        vec!["exposure".to_string()]
    }

    fn get_property(&self, _key: &PropertyKey) -> CoreResult<PropertyValue> {
        Ok(self.exposure.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn set_property(&self, _key: &PropertyKey, value: &PropertyValue) -> CoreResult<()> {
        *self.exposure.lock().unwrap_or_else(|p| p.into_inner()) = value.clone();
        Ok(())
    }
}

fn main() {
    let args = parse_args();

    let config = match &args.config {
        Some(path) => load_config(Some(path.as_path()), Some(&args.overrides)).unwrap_or_else(|e| {
            eprintln!("Failed to load {}: {e}", path.display());
            process::exit(2);
        }),
        None => {
            let mut config = builtin_config();
            sensorium::config::apply_cli_overrides(&mut config, &args.overrides);
            config
        }
    };

    let options = LoggingOptions::try_from(&config.logging).unwrap_or_else(|e| {
        eprintln!("Invalid logging configuration: {e}");
        process::exit(2);
    });
    let _logging = init_logging(&options, &parse_debug_flags()).unwrap_or_else(|e| {
        eprintln!("Failed to initialize logging: {e:#}");
        process::exit(2);
    });

    let producers: Arc<Mutex<Vec<Arc<SyntheticProducer>>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = ProducerRegistry::new();
    {
        let producers = Arc::clone(&producers);
        let registered = registry.register(COMPONENT, move |spec: &ProducerSpec| {
            let producer = Arc::new(SyntheticProducer::from_spec(spec)?);
            producers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(Arc::clone(&producer));
            Ok(producer as Arc<dyn Producer>)
        });
        if let Err(e) = registered {
            eprintln!("Failed to register producer: {e}");
            process::exit(2);
        }
    }

    let runtime = Runtime::new(config.clone(), registry);
    if let Err(e) = runtime.init() {
        eprintln!("Runtime init failed: {e}");
        process::exit(2);
    }

    let mut streams = Vec::new();
    for stream_config in &config.streams {
        for _ in 0..args.streams_per_key {
            let opened = runtime
                .open_stream(&stream_config.key)
                .and_then(|stream| runtime.start_stream(&stream).map(|()| stream));
            match opened {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    eprintln!("Failed to open '{}': {e}", stream_config.key);
                    process::exit(2);
                }
            }
        }
    }
    info!("[SOAK] {} streams running for {:?}", streams.len(), args.duration);

    let deadline = Instant::now() + args.duration;
    let readers: Vec<_> = streams
        .iter()
        .map(|stream| {
            let stream = Arc::clone(stream);
            thread::spawn(move || {
                let mut read = 0u64;
                while Instant::now() < deadline {
                    match stream.get_frame(WaitTimeout::After(Duration::from_millis(50))) {
                        Ok(frame) => {
                            if let Err(e) = stream.release_frame(&frame) {
                                warn!("[SOAK] release failed: {e}");
                            }
                            read += 1;
                        }
                        Err(e) if e.cause() == ErrorCause::Timeout => {}
                        Err(e) => {
                            warn!("[SOAK] get_frame failed: {e}");
                            break;
                        }
                    }
                }
                read
            })
        })
        .collect();

    let lockers: Vec<_> = streams
        .iter()
        .take(2)
        .map(|stream| {
            let stream = Arc::clone(stream);
            thread::spawn(move || {
                let mut locks = 0u64;
                while Instant::now() < deadline {
                    if let Ok(resource) = stream.lock_property(&["exposure"], 20i64) {
                        let _ = stream.set_property("exposure", &json!(locks));
                        if stream.unlock_property(&resource).is_ok() {
                            locks += 1;
                        }
                    }
                }
                locks
            })
        })
        .collect();

    let frames_read: u64 = readers.into_iter().map(|r| r.join().unwrap_or(0)).sum();
    let locks_taken: u64 = lockers.into_iter().map(|l| l.join().unwrap_or(0)).sum();

    for stream in &streams {
        if let Err(e) = runtime.close_stream(stream) {
            warn!("[SOAK] close failed: {e}");
        }
    }
    if let Err(e) = runtime.exit() {
        warn!("[SOAK] exit failed: {e}");
    }

    let producers = producers.lock().unwrap_or_else(|p| p.into_inner());
    let produced: u64 = producers.iter().map(|p| p.produced()).sum();
    let (missing, repeated) = producers
        .iter()
        .map(|p| p.audit())
        .fold((0, 0), |(m, r), (pm, pr)| (m + pm, r + pr));

    let summary = json!({
        "streams": streams.len(),
        "seconds": args.duration.as_secs(),
        "frames_produced": produced,
        "frames_read": frames_read,
        "property_locks": locks_taken,
        "unreclaimed": missing,
        "reclaimed_twice": repeated,
    });
    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_else(|_| summary.to_string()));

    if missing > 0 || repeated > 0 {
        eprintln!("[stream_soak] FAILED: frame reclaim accounting is off");
        process::exit(1);
    }
}
