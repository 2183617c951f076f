// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! User-facing stream: buffered frames, events and property forwarding
//!
//! A stream is one consumer of a [`FramePort`]. Frames delivered by the port
//! wait in a bounded queue until the user takes them with
//! [`Stream::get_frame`] and hands them back with [`Stream::release_frame`].
//! Lifecycle transitions (`open`/`start`/`stop`/`close`) are driven by the
//! runtime under the lifecycle gate.

use crate::error::{CoreError, CoreResult, Traced};
use crate::port::{Delivery, FrameConsumer, FramePort};
use crate::property::LockResource;
use crate::sync::{lock, lock_recover, wait, wait_failed, wait_timeout};
use crate::types::{
    Frame, PortAddress, PropertyValue, StreamArguments, StreamEvent, StreamId, WaitTimeout, EVENT_ANY,
};
use ahash::AHashMap;
use parking_lot::RwLock;
use sensorium_config::{BufferFormat, BufferingConfig};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Callback for stream events
pub type EventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Opened, not delivering
    Ready,
    Running,
    Closed,
}

/// Resolved buffering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    /// `None` is unbounded
    pub capacity: Option<usize>,
    pub format: BufferFormat,
}

impl From<&BufferingConfig> for BufferPolicy {
    fn from(config: &BufferingConfig) -> Self {
        if !config.enabled {
            return Self {
                capacity: Some(1),
                format: BufferFormat::Overwrite,
            };
        }
        Self {
            capacity: (config.num > 0).then_some(config.num),
            format: config.format,
        }
    }
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    queue: VecDeque<Frame>,
    /// Frames handed to the user, by sequence number
    acquired: BTreeMap<u64, Frame>,
}

impl StreamInner {
    fn held(&self) -> usize {
        self.queue.len() + self.acquired.len()
    }
}

pub struct Stream {
    id: StreamId,
    key: String,
    label: String,
    port: Arc<FramePort>,
    arguments: StreamArguments,
    policy: BufferPolicy,
    inner: Mutex<StreamInner>,
    frame_ready: Condvar,
    handlers: RwLock<AHashMap<String, EventHandler>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("port", self.port.address())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Stream {
    pub fn new(
        id: StreamId,
        key: impl Into<String>,
        port: Arc<FramePort>,
        arguments: StreamArguments,
        policy: BufferPolicy,
    ) -> Arc<Self> {
        let key = key.into();
        Arc::new(Self {
            label: format!("{}({})", key, id),
            id,
            key,
            port,
            arguments,
            policy,
            inner: Mutex::new(StreamInner {
                state: StreamState::Ready,
                queue: VecDeque::new(),
                acquired: BTreeMap::new(),
            }),
            frame_ready: Condvar::new(),
            handlers: RwLock::new(AHashMap::new()),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn address(&self) -> &PortAddress {
        self.port.address()
    }

    pub fn buffer_policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn state(&self) -> StreamState {
        lock_recover(&self.inner).state
    }

    /// Frames queued but not yet taken
    pub fn queued_frames(&self) -> usize {
        lock_recover(&self.inner).queue.len()
    }

    /// Frames taken and not yet released
    pub fn acquired_frames(&self) -> usize {
        lock_recover(&self.inner).acquired.len()
    }

    // ---------------------------------------------------------------------
    // Lifecycle (driven by the runtime)
    // ---------------------------------------------------------------------

    pub(crate) fn open(self: &Arc<Self>) -> CoreResult<()> {
        let consumer: Arc<dyn FrameConsumer> = Arc::clone(self) as Arc<dyn FrameConsumer>;
        self.port.open(consumer, &self.arguments).traced()?;
        info!("[STREAM] {} opened on {}", self.label, self.port.address());
        Ok(())
    }

    pub(crate) fn start(&self) -> CoreResult<()> {
        {
            let mut inner = lock(&self.inner, &self.label)?;
            if inner.state != StreamState::Ready {
                return Err(CoreError::invalid_operation(
                    &self.label,
                    format!("cannot start from {:?}", inner.state),
                ));
            }
            inner.state = StreamState::Running;
        }
        if let Err(e) = self.port.start(self.id) {
            lock_recover(&self.inner).state = StreamState::Ready;
            return Err(e.traced());
        }
        info!("[STREAM] {} started", self.label);
        Ok(())
    }

    pub(crate) fn stop(&self) -> CoreResult<()> {
        {
            let mut inner = lock(&self.inner, &self.label)?;
            if inner.state != StreamState::Running {
                return Err(CoreError::invalid_operation(
                    &self.label,
                    format!("cannot stop from {:?}", inner.state),
                ));
            }
            inner.state = StreamState::Ready;
        }
        self.frame_ready.notify_all();

        if let Err(e) = self.port.stop(self.id) {
            lock_recover(&self.inner).state = StreamState::Running;
            return Err(e.traced());
        }
        info!("[STREAM] {} stopped", self.label);
        Ok(())
    }

    /// Close the stream, stopping it first when running
    pub(crate) fn close(&self) -> CoreResult<()> {
        let state = lock(&self.inner, &self.label)?.state;
        match state {
            StreamState::Closed => {
                return Err(CoreError::invalid_operation(&self.label, "stream is already closed"));
            }
            StreamState::Running => self.stop().traced()?,
            StreamState::Ready => {}
        }
        self.port.close(self.id).traced()?;

        let mut inner = lock_recover(&self.inner);
        inner.state = StreamState::Closed;
        inner.queue.clear();
        inner.acquired.clear();
        drop(inner);
        self.frame_ready.notify_all();
        self.handlers.write().clear();
        info!("[STREAM] {} closed", self.label);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Frames
    // ---------------------------------------------------------------------

    /// Take the oldest queued frame
    ///
    /// # Errors
    /// - `InvalidOperation`: stream not running, or stopped while waiting
    /// - `Timeout`: nothing arrived in time (immediately for `Poll`)
    pub fn get_frame(&self, timeout: WaitTimeout) -> CoreResult<Frame> {
        let deadline = timeout.deadline_from(Instant::now());
        let mut inner = lock(&self.inner, &self.label)?;
        loop {
            if inner.state != StreamState::Running {
                return Err(CoreError::invalid_operation(&self.label, "stream is not running"));
            }
            if let Some(frame) = inner.queue.pop_front() {
                inner.acquired.insert(frame.sequence_number, frame.clone());
                trace!("[STREAM] {} acquired frame #{}", self.label, frame.sequence_number);
                return Ok(frame);
            }

            inner = match timeout.remaining(deadline, Instant::now()) {
                WaitTimeout::Poll => {
                    return Err(CoreError::timeout(&self.label, "no frame available"));
                }
                WaitTimeout::After(left) if left.is_zero() => {
                    return Err(CoreError::timeout(&self.label, "no frame arrived in time"));
                }
                WaitTimeout::After(left) => {
                    wait_timeout(&self.frame_ready, inner, left).map_err(|_| wait_failed(&self.label))?
                }
                WaitTimeout::Forever => wait(&self.frame_ready, inner).map_err(|_| wait_failed(&self.label))?,
            };
        }
    }

    /// Hand a frame back, reporting every channel as used
    pub fn release_frame(&self, frame: &Frame) -> CoreResult<()> {
        let channels = frame.channel_ids();
        self.release(frame, &channels)
    }

    /// Hand a frame back, reporting only `referenced_channel_ids` as used
    pub fn release_frame_with_channels(&self, frame: &Frame, referenced_channel_ids: &[u32]) -> CoreResult<()> {
        self.release(frame, referenced_channel_ids)
    }

    /// Hand a frame back without having used any of it
    pub fn release_frame_unused(&self, frame: &Frame) -> CoreResult<()> {
        self.release(frame, &[])
    }

    fn release(&self, frame: &Frame, referenced_channel_ids: &[u32]) -> CoreResult<()> {
        {
            let mut inner = lock(&self.inner, &self.label)?;
            if inner.acquired.remove(&frame.sequence_number).is_none() {
                return Err(CoreError::invalid_argument(
                    &self.label,
                    format!("frame #{} was not acquired from this stream", frame.sequence_number),
                ));
            }
        }
        self.frame_ready.notify_all();
        self.port
            .release_frame(self.id, frame, Some(referenced_channel_ids))
            .traced()
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Register `handler` for `event_type` (or [`EVENT_ANY`]), replacing any
    /// previous handler for that type
    pub fn register_event_handler<F>(&self, event_type: impl Into<String>, handler: F) -> CoreResult<()>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(CoreError::invalid_argument(&self.label, "empty event type"));
        }
        if self.state() == StreamState::Closed {
            return Err(CoreError::invalid_operation(&self.label, "stream is closed"));
        }
        self.handlers.write().insert(event_type, Arc::new(handler));
        Ok(())
    }

    pub fn unregister_event_handler(&self, event_type: &str) -> CoreResult<()> {
        self.handlers
            .write()
            .remove(event_type)
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found(&self.label, format!("no handler for {}", event_type)))
    }

    /// Returns whether any handler ran
    fn dispatch(&self, event: &StreamEvent) -> bool {
        let handlers: Vec<EventHandler> = {
            let map = self.handlers.read();
            [event.event_type(), EVENT_ANY]
                .iter()
                .filter_map(|name| map.get(*name).cloned())
                .collect()
        };
        for handler in &handlers {
            handler(event);
        }
        !handlers.is_empty()
    }

    // ---------------------------------------------------------------------
    // Properties
    // ---------------------------------------------------------------------

    pub fn supported_property_keys(&self) -> Vec<String> {
        self.port.supported_property_keys()
    }

    pub fn get_property(&self, key: &str) -> CoreResult<PropertyValue> {
        self.port.get_property(self.id, key).traced()
    }

    pub fn set_property(&self, key: &str, value: &PropertyValue) -> CoreResult<()> {
        self.port.set_property(self.id, key, value).traced()
    }

    pub fn lock_property(&self, keys: &[&str], timeout: impl Into<WaitTimeout>) -> CoreResult<LockResource> {
        self.port.lock_property(self.id, keys, timeout.into()).traced()
    }

    pub fn unlock_property(&self, resource: &LockResource) -> CoreResult<()> {
        self.port.unlock_property(self.id, resource).traced()
    }
}

impl FrameConsumer for Stream {
    fn stream_id(&self) -> StreamId {
        self.id
    }

    fn deliver(&self, frames: &[Frame]) -> Delivery {
        let mut delivery = Delivery::default();
        {
            let mut inner = lock_recover(&self.inner);
            if inner.state != StreamState::Running {
                delivery.rejected = frames.iter().map(|f| f.sequence_number).collect();
            } else {
                for frame in frames {
                    let full = self.policy.capacity.is_some_and(|cap| inner.held() >= cap);
                    if full {
                        if self.policy.format == BufferFormat::Overwrite {
                            if let Some(oldest) = inner.queue.pop_front() {
                                delivery.evicted.push(oldest.sequence_number);
                                inner.queue.push_back(frame.clone());
                                continue;
                            }
                        }
                        delivery.rejected.push(frame.sequence_number);
                        continue;
                    }
                    inner.queue.push_back(frame.clone());
                }
            }
        }
        self.frame_ready.notify_all();
        delivery
    }

    fn frames_dropped(&self, sequence_numbers: &[u64]) {
        for &sequence_number in sequence_numbers {
            debug!("[STREAM] {} dropped frame #{}", self.label, sequence_number);
            self.dispatch(&StreamEvent::FrameDropped { sequence_number });
        }
    }

    fn clear_frames(&self) -> Vec<Frame> {
        let frames: Vec<Frame> = lock_recover(&self.inner).queue.drain(..).collect();
        self.frame_ready.notify_all();
        frames
    }

    fn deliver_event(&self, event: &StreamEvent) -> CoreResult<()> {
        if self.state() == StreamState::Closed {
            return Err(CoreError::invalid_operation(&self.label, "stream is closed"));
        }
        if !self.dispatch(event) {
            trace!("[STREAM] {} no handler for {}", self.label, event.event_type());
        }
        Ok(())
    }
}
