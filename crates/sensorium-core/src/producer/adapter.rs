// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Drives a [`Producer`] behind a [`FramePort`]
//!
//! State changes run under the `State` category of the producer's function
//! gate, reclaims under `ReleaseFrame`, property calls and lock hooks under
//! `Property`. One named thread per started port pulls frames and publishes
//! them.

use super::{Producer, ProducerContext};
use crate::error::{CoreError, CoreResult, Traced};
use crate::port::{FramePort, PortBackend};
use crate::producer_gate::ProducerFunctionGate;
use crate::property::{LockHook, LockRequest, LockResource, PropertyAccessor, PropertyKey, UnlockHook};
use crate::types::{Frame, PortAddress, PropertyValue, StreamArguments};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

struct Shared {
    label: String,
    producer: Arc<dyn Producer>,
    gate: ProducerFunctionGate,
}

impl Shared {
    fn release(&self, frame: &Frame, referenced_channel_ids: &[u32]) -> CoreResult<()> {
        let _guard = self.gate.lock_for_release_frame()?;
        self.producer.release_frame(frame, referenced_channel_ids).traced()
    }
}

/// Property accessor that runs producer calls under the `Property` category
struct GatedPropertyAccessor {
    key: String,
    shared: Arc<Shared>,
}

impl PropertyAccessor for GatedPropertyAccessor {
    fn key(&self) -> &str {
        &self.key
    }

    fn get(&self, key: &PropertyKey) -> CoreResult<PropertyValue> {
        let _guard = self.shared.gate.lock_for_property()?;
        self.shared.producer.get_property(key).traced()
    }

    fn set(&self, key: &PropertyKey, value: &PropertyValue) -> CoreResult<()> {
        let _guard = self.shared.gate.lock_for_property()?;
        self.shared.producer.set_property(key, value).traced()
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// [`PortBackend`] over a [`Producer`]
pub struct ProducerAdapter {
    address: PortAddress,
    shared: Arc<Shared>,
    port: Weak<FramePort>,
    idle_backoff: Duration,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for ProducerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerAdapter")
            .field("address", &self.address)
            .field("producing", &self.worker.lock().is_some())
            .finish()
    }
}

impl ProducerAdapter {
    /// Build a port driven by `producer`
    pub fn attach(address: PortAddress, producer: Arc<dyn Producer>, idle_backoff: Duration) -> Arc<FramePort> {
        Arc::new_cyclic(|port| {
            let label = address.to_string();
            let adapter = ProducerAdapter {
                shared: Arc::new(Shared {
                    gate: ProducerFunctionGate::new(label.clone()),
                    label,
                    producer,
                }),
                address: address.clone(),
                port: port.clone(),
                idle_backoff,
                worker: Mutex::new(None),
            };
            FramePort::new(address, Arc::new(adapter))
        })
    }

    fn port(&self) -> CoreResult<Arc<FramePort>> {
        self.port
            .upgrade()
            .ok_or_else(|| CoreError::invalid_operation(&self.shared.label, "port no longer exists"))
    }

    fn install_properties(&self, port: &FramePort) -> CoreResult<()> {
        for key in self.shared.producer.property_keys() {
            port.register_property_accessor(Arc::new(GatedPropertyAccessor {
                key,
                shared: Arc::clone(&self.shared),
            }))?;
        }

        let shared = Arc::clone(&self.shared);
        let on_lock: LockHook = Arc::new(move |request: &LockRequest<'_>| {
            let _guard = shared.gate.lock_for_property()?;
            shared.producer.lock_property(request.keys, request.remaining).traced()
        });
        let shared = Arc::clone(&self.shared);
        let on_unlock: UnlockHook = Arc::new(move |resource: &LockResource| {
            let _guard = shared.gate.lock_for_property()?;
            shared.producer.unlock_property(resource.keys()).traced()
        });
        port.property_gate().set_hooks(Some(on_lock), Some(on_unlock));
        Ok(())
    }

    fn remove_properties(&self, port: &FramePort) {
        port.clear_property_accessors();
        port.property_gate().set_hooks(None, None);
    }

    fn spawn_worker(&self) -> CoreResult<()> {
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let port = self.port.clone();
        let flag = Arc::clone(&running);
        let backoff = self.idle_backoff;

        let handle = thread::Builder::new()
            .name(format!("producer-{}", self.address))
            .spawn(move || production_loop(shared, port, flag, backoff))
            .map_err(|e| {
                CoreError::aborted(&self.shared.label, format!("failed to spawn production thread: {}", e))
            })?;

        *self.worker.lock() = Some(Worker { running, handle });
        Ok(())
    }

    fn join_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.running.store(false, Ordering::Release);
            // A stream handler can stop the port from the production thread;
            // that loop exits on its own once the call returns
            if worker.handle.thread().id() == thread::current().id() {
                debug!("[PRODUCER] {} stopped from its production thread", self.shared.label);
                return;
            }
            if worker.handle.join().is_err() {
                warn!("[PRODUCER] {} production thread panicked", self.shared.label);
            }
        }
    }
}

impl PortBackend for ProducerAdapter {
    fn open_port(&self, arguments: &StreamArguments) -> CoreResult<()> {
        let port = self.port()?;
        {
            let _guard = self.shared.gate.lock_for_state()?;
            let context = ProducerContext::new(self.address.clone(), arguments.clone(), self.port.clone());
            self.shared.producer.open(&context).traced()?;
        }
        if let Err(e) = self.install_properties(&port) {
            self.remove_properties(&port);
            let _guard = self.shared.gate.lock_for_state()?;
            if let Err(close_error) = self.shared.producer.close() {
                warn!("[PRODUCER] {} close after failed open: {}", self.shared.label, close_error);
            }
            return Err(e.traced());
        }
        info!("[PRODUCER] {} opened", self.shared.label);
        Ok(())
    }

    fn close_port(&self) -> CoreResult<()> {
        let port = self.port()?;
        {
            let _guard = self.shared.gate.lock_for_state()?;
            self.shared.producer.close().traced()?;
        }
        self.remove_properties(&port);
        info!("[PRODUCER] {} closed", self.shared.label);
        Ok(())
    }

    fn start_port(&self) -> CoreResult<()> {
        {
            let _guard = self.shared.gate.lock_for_state()?;
            self.shared.producer.start().traced()?;
        }
        if let Err(e) = self.spawn_worker() {
            let _guard = self.shared.gate.lock_for_state()?;
            if let Err(stop_error) = self.shared.producer.stop() {
                warn!("[PRODUCER] {} stop after failed spawn: {}", self.shared.label, stop_error);
            }
            return Err(e);
        }
        info!("[PRODUCER] {} started", self.shared.label);
        Ok(())
    }

    fn stop_port(&self) -> CoreResult<()> {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.running.store(false, Ordering::Release);
        }

        // The production thread may be queued on ReleaseFrame behind this
        // State call, so join only after the guard is gone
        let stopped = {
            let _guard = self.shared.gate.lock_for_state()?;
            self.shared.producer.stop().traced()
        };
        self.join_worker();

        if let Err(e) = stopped {
            warn!("[PRODUCER] {} stop failed, resuming production: {}", self.shared.label, e);
            if let Err(spawn_error) = self.spawn_worker() {
                warn!("[PRODUCER] {} could not resume production: {}", self.shared.label, spawn_error);
            }
            return Err(e);
        }
        info!("[PRODUCER] {} stopped", self.shared.label);
        Ok(())
    }

    fn release_port_frame(&self, frame: &Frame, referenced_channel_ids: &[u32]) -> CoreResult<()> {
        self.shared.release(frame, referenced_channel_ids)
    }
}

impl Drop for ProducerAdapter {
    fn drop(&mut self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.running.store(false, Ordering::Release);
            // The last port handle can be released by the production thread itself
            if worker.handle.thread().id() != thread::current().id() && worker.handle.join().is_err() {
                warn!("[PRODUCER] {} production thread panicked", self.shared.label);
            }
        }
    }
}

/// Pull frames and publish them until stopped
fn production_loop(shared: Arc<Shared>, port: Weak<FramePort>, running: Arc<AtomicBool>, backoff: Duration) {
    debug!("[PRODUCER] {} production loop started", shared.label);

    while running.load(Ordering::Acquire) {
        if shared.gate.is_state_changing() {
            debug!("[PRODUCER] {} state change pending, leaving production loop", shared.label);
            break;
        }

        let frames = match shared.producer.get_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("[PRODUCER] {} get_frames failed: {}", shared.label, e);
                thread::sleep(backoff);
                continue;
            }
        };
        if frames.is_empty() {
            thread::sleep(backoff);
            continue;
        }

        let Some(port) = port.upgrade() else {
            break;
        };
        let dropped = port.send_frames(frames);
        drop(port);

        for frame in dropped {
            if let Err(e) = shared.release(&frame, &[]) {
                warn!(
                    "[PRODUCER] {} could not release dropped frame #{}: {}",
                    shared.label, frame.sequence_number, e
                );
            }
        }
    }

    debug!("[PRODUCER] {} production loop stopped", shared.label);
}
