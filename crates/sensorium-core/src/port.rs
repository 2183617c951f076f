// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Frame port: fan-out to streams and exactly-once retirement
//!
//! Every frame sent while at least one stream is started gets a
//! [`SentFrameRecord`] listing the streams that were started at send time.
//! Each of those streams reports one outcome per frame (failed delivery,
//! release, or implicit release when it closes). The record is retired when
//! the last outcome arrives; if any stream released the frame, the backend's
//! reclaim call runs exactly once with the union of referenced channels.
//! Frames that every stream failed are handed back to the caller of
//! [`FramePort::send_frames`] as dropped.

use crate::error::{CoreError, CoreResult, Traced};
use crate::property::{LockResource, PropertyAccessGate, PropertyAccessor, PropertyKey};
use crate::types::{Frame, PortAddress, PropertyValue, StreamArguments, StreamEvent, StreamId, WaitTimeout};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Producer side of a port
pub trait PortBackend: Send + Sync {
    fn open_port(&self, arguments: &StreamArguments) -> CoreResult<()>;

    fn close_port(&self) -> CoreResult<()>;

    fn start_port(&self) -> CoreResult<()>;

    fn stop_port(&self) -> CoreResult<()>;

    /// Reclaim a fully retired frame; `referenced_channel_ids` is the union
    /// of channels the streams reported using
    fn release_port_frame(&self, frame: &Frame, referenced_channel_ids: &[u32]) -> CoreResult<()>;
}

/// What a stream did with a batch of frames
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sequence numbers the stream refused
    pub rejected: Vec<u64>,
    /// Earlier frames the stream evicted unread to make room
    pub evicted: Vec<u64>,
}

/// Stream side of a port
pub trait FrameConsumer: Send + Sync {
    fn stream_id(&self) -> StreamId;

    /// Must not block and must not call back into the port
    fn deliver(&self, frames: &[Frame]) -> Delivery;

    /// Frames this consumer rejected or evicted during the last delivery
    ///
    /// Called with no port lock held, so it may call back into the port.
    fn frames_dropped(&self, _sequence_numbers: &[u64]) {}

    /// Remove and return frames delivered but not yet handed to the user
    fn clear_frames(&self) -> Vec<Frame>;

    fn deliver_event(&self, event: &StreamEvent) -> CoreResult<()>;
}

/// Per-stream outcome of one sent frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Pending,
    Failed,
    Released,
}

#[derive(Debug)]
struct SentFrameRecord {
    frame: Frame,
    outcomes: AHashMap<StreamId, FrameOutcome>,
    pending: usize,
    referenced_channels: BTreeSet<u32>,
    released: bool,
}

#[derive(Debug, Default)]
struct Connection {
    /// Arguments of the first open; later opens must match
    arguments: Option<StreamArguments>,
}

/// Producer-side attachment point for streams
pub struct FramePort {
    address: PortAddress,
    label: String,
    backend: Arc<dyn PortBackend>,
    connection: Mutex<Connection>,
    opened: RwLock<Vec<Arc<dyn FrameConsumer>>>,
    started: RwLock<Vec<Arc<dyn FrameConsumer>>>,
    sent: Mutex<BTreeMap<u64, SentFrameRecord>>,
    accessors: RwLock<AHashMap<String, Arc<dyn PropertyAccessor>>>,
    properties: PropertyAccessGate,
}

impl std::fmt::Debug for FramePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePort")
            .field("address", &self.address)
            .field("opened", &self.opened.read().len())
            .field("started", &self.started.read().len())
            .field("in_flight", &self.sent.lock().len())
            .finish()
    }
}

impl FramePort {
    pub fn new(address: PortAddress, backend: Arc<dyn PortBackend>) -> Self {
        let label = address.to_string();
        Self {
            properties: PropertyAccessGate::new(label.clone()),
            label,
            address,
            backend,
            connection: Mutex::new(Connection::default()),
            opened: RwLock::new(Vec::new()),
            started: RwLock::new(Vec::new()),
            sent: Mutex::new(BTreeMap::new()),
            accessors: RwLock::new(AHashMap::new()),
        }
    }

    pub fn address(&self) -> &PortAddress {
        &self.address
    }

    pub fn property_gate(&self) -> &PropertyAccessGate {
        &self.properties
    }

    pub fn opened_count(&self) -> usize {
        self.opened.read().len()
    }

    pub fn started_count(&self) -> usize {
        self.started.read().len()
    }

    /// Frames sent but not yet retired
    pub fn in_flight_frames(&self) -> usize {
        self.sent.lock().len()
    }

    fn find(list: &[Arc<dyn FrameConsumer>], stream: StreamId) -> Option<usize> {
        list.iter().position(|c| c.stream_id() == stream)
    }

    // ---------------------------------------------------------------------
    // Connection management
    // ---------------------------------------------------------------------

    /// Connect a stream; the first one opens the producer
    pub fn open(&self, consumer: Arc<dyn FrameConsumer>, arguments: &StreamArguments) -> CoreResult<()> {
        let stream = consumer.stream_id();
        let mut connection = self.connection.lock();
        if Self::find(&self.opened.read(), stream).is_some() {
            return Err(CoreError::invalid_operation(
                &self.label,
                format!("{} is already opened", stream),
            ));
        }

        match &connection.arguments {
            Some(existing) if existing != arguments => {
                return Err(CoreError::invalid_argument(
                    &self.label,
                    "port is already opened with different arguments",
                ));
            }
            Some(_) => {}
            None => {
                self.backend.open_port(arguments).traced()?;
                connection.arguments = Some(arguments.clone());
                info!("[PORT] {} opened", self.label);
            }
        }

        self.properties.attach_stream(stream).traced()?;
        self.opened.write().push(consumer);
        debug!("[PORT] {} connected {}", self.label, stream);
        Ok(())
    }

    /// Disconnect a stopped stream; the last one closes the producer
    ///
    /// The stream's locks are force-released and its unreleased frames count
    /// as released.
    pub fn close(&self, stream: StreamId) -> CoreResult<()> {
        let mut connection = self.connection.lock();
        if Self::find(&self.opened.read(), stream).is_none() {
            return Err(CoreError::invalid_operation(
                &self.label,
                format!("{} is not opened", stream),
            ));
        }
        if Self::find(&self.started.read(), stream).is_some() {
            return Err(CoreError::invalid_operation(
                &self.label,
                format!("{} is still started", stream),
            ));
        }

        self.properties.detach_stream(stream);
        self.retire_consumer(stream);

        if self.opened.read().len() == 1 {
            if let Err(e) = self.backend.close_port() {
                warn!("[PORT] {} close failed, {} stays connected: {}", self.label, stream, e);
                // Was attached a moment ago; cannot collide
                let _ = self.properties.attach_stream(stream);
                return Err(e.traced());
            }
            connection.arguments = None;
            info!("[PORT] {} closed", self.label);
        }

        let mut opened = self.opened.write();
        if let Some(index) = Self::find(&opened, stream) {
            opened.remove(index);
        }
        debug!("[PORT] {} disconnected {}", self.label, stream);
        Ok(())
    }

    /// Begin delivering frames to a stream; the first one starts the producer
    pub fn start(&self, stream: StreamId) -> CoreResult<()> {
        let _connection = self.connection.lock();
        let consumer = {
            let opened = self.opened.read();
            let index = Self::find(&opened, stream).ok_or_else(|| {
                CoreError::invalid_operation(&self.label, format!("{} is not opened", stream))
            })?;
            Arc::clone(&opened[index])
        };
        if Self::find(&self.started.read(), stream).is_some() {
            return Err(CoreError::invalid_operation(
                &self.label,
                format!("{} is already started", stream),
            ));
        }

        if self.started.read().is_empty() {
            let unreleased = self.sent.lock().len();
            if unreleased > 0 {
                return Err(CoreError::busy(
                    &self.label,
                    format!("{} unreleased frames exist", unreleased),
                ));
            }
            self.backend.start_port().traced()?;
            info!("[PORT] {} started", self.label);
        }

        self.started.write().push(consumer);
        debug!("[PORT] {} delivering to {}", self.label, stream);
        Ok(())
    }

    /// Stop delivering to a stream; its unread frames are released and the
    /// last one stops the producer
    pub fn stop(&self, stream: StreamId) -> CoreResult<()> {
        let _connection = self.connection.lock();
        let consumer = {
            let mut started = self.started.write();
            let index = Self::find(&started, stream).ok_or_else(|| {
                CoreError::invalid_operation(&self.label, format!("{} is not started", stream))
            })?;
            started.remove(index)
        };

        for frame in consumer.clear_frames() {
            if let Err(e) = self.settle(stream, frame.sequence_number, FrameOutcome::Released, None) {
                warn!("[PORT] {} could not release unread frame: {}", self.label, e);
            }
        }

        if self.started.read().is_empty() {
            if let Err(e) = self.backend.stop_port() {
                warn!("[PORT] {} stop failed: {}", self.label, e);
                self.started.write().push(consumer);
                return Err(e.traced());
            }
            info!("[PORT] {} stopped", self.label);
        }
        debug!("[PORT] {} no longer delivering to {}", self.label, stream);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Frames
    // ---------------------------------------------------------------------

    /// Fan `frames` out to every started stream
    ///
    /// Returns the frames nobody took; the caller still owns those.
    pub fn send_frames(&self, frames: Vec<Frame>) -> Vec<Frame> {
        if frames.is_empty() {
            return frames;
        }
        let started = self.started.read();
        if started.is_empty() {
            debug!("[PORT] {} no started stream, dropping {} frames", self.label, frames.len());
            return frames;
        }

        let (frames, mut dropped): (Vec<Frame>, Vec<Frame>) = {
            let mut sent = self.sent.lock();
            frames.into_iter().partition(|frame| {
                if sent.contains_key(&frame.sequence_number) {
                    warn!(
                        "[PORT] {} frame #{} is already in flight, dropping duplicate",
                        self.label, frame.sequence_number
                    );
                    return false;
                }
                let outcomes: AHashMap<StreamId, FrameOutcome> = started
                    .iter()
                    .map(|c| (c.stream_id(), FrameOutcome::Pending))
                    .collect();
                sent.insert(
                    frame.sequence_number,
                    SentFrameRecord {
                        frame: frame.clone(),
                        pending: outcomes.len(),
                        outcomes,
                        referenced_channels: BTreeSet::new(),
                        released: false,
                    },
                );
                true
            })
        };

        let mut failures: AHashMap<u64, usize> = AHashMap::new();
        let mut notices: Vec<(Arc<dyn FrameConsumer>, Vec<u64>)> = Vec::new();
        for consumer in started.iter() {
            let stream = consumer.stream_id();
            let delivery = consumer.deliver(&frames);
            for &sequence_number in &delivery.rejected {
                *failures.entry(sequence_number).or_default() += 1;
                if let Err(e) = self.settle(stream, sequence_number, FrameOutcome::Failed, None) {
                    warn!("[PORT] {} rejected frame bookkeeping failed: {}", self.label, e);
                }
            }
            for &sequence_number in &delivery.evicted {
                if let Err(e) = self.settle(stream, sequence_number, FrameOutcome::Released, None) {
                    warn!("[PORT] {} evicted frame bookkeeping failed: {}", self.label, e);
                }
            }
            if !delivery.rejected.is_empty() || !delivery.evicted.is_empty() {
                let mut lost = delivery.rejected;
                lost.extend(delivery.evicted);
                notices.push((Arc::clone(consumer), lost));
            }
        }
        let recipients = started.len();
        drop(started);

        // Handlers may stop or close their stream
        for (consumer, lost) in notices {
            consumer.frames_dropped(&lost);
        }

        dropped.extend(
            frames
                .into_iter()
                .filter(|f| failures.get(&f.sequence_number) == Some(&recipients)),
        );
        if !dropped.is_empty() {
            debug!("[PORT] {} {} frames dropped by every stream", self.label, dropped.len());
        }
        dropped
    }

    /// Report that `stream` is done with `frame`
    ///
    /// # Errors
    /// - `NotFound`: frame already retired or never sent to `stream`
    /// - `InvalidOperation`: `stream` already reported this frame
    pub fn release_frame(
        &self,
        stream: StreamId,
        frame: &Frame,
        referenced_channel_ids: Option<&[u32]>,
    ) -> CoreResult<()> {
        self.settle(stream, frame.sequence_number, FrameOutcome::Released, referenced_channel_ids)
    }

    fn settle(
        &self,
        stream: StreamId,
        sequence_number: u64,
        outcome: FrameOutcome,
        referenced_channel_ids: Option<&[u32]>,
    ) -> CoreResult<()> {
        let retired = {
            let mut sent = self.sent.lock();
            let record = sent.get_mut(&sequence_number).ok_or_else(|| {
                CoreError::not_found(&self.label, format!("frame #{} is not in flight", sequence_number))
            })?;
            let state = record.outcomes.get_mut(&stream).ok_or_else(|| {
                CoreError::not_found(
                    &self.label,
                    format!("frame #{} was not sent to {}", sequence_number, stream),
                )
            })?;
            if *state != FrameOutcome::Pending {
                return Err(CoreError::invalid_operation(
                    &self.label,
                    format!("frame #{} already reported by {}", sequence_number, stream),
                ));
            }
            *state = outcome;
            record.pending -= 1;
            if outcome == FrameOutcome::Released {
                record.released = true;
                if let Some(ids) = referenced_channel_ids {
                    record.referenced_channels.extend(ids.iter().copied());
                }
            }
            if record.pending > 0 {
                return Ok(());
            }
            sent.remove(&sequence_number)
        };

        match retired {
            Some(record) if record.released => self.reclaim(record).traced(),
            _ => Ok(()),
        }
    }

    fn reclaim(&self, record: SentFrameRecord) -> CoreResult<()> {
        let channels: Vec<u32> = record.referenced_channels.into_iter().collect();
        debug!(
            "[PORT] {} retiring frame #{} (channels {:?})",
            self.label, record.frame.sequence_number, channels
        );
        self.backend.release_port_frame(&record.frame, &channels)
    }

    /// Count every pending frame of `stream` as released
    fn retire_consumer(&self, stream: StreamId) {
        let retired: Vec<SentFrameRecord> = {
            let mut sent = self.sent.lock();
            let mut done = Vec::new();
            for (sequence_number, record) in sent.iter_mut() {
                if let Some(state) = record.outcomes.get_mut(&stream) {
                    if *state == FrameOutcome::Pending {
                        *state = FrameOutcome::Released;
                        record.pending -= 1;
                        record.released = true;
                        if record.pending == 0 {
                            done.push(*sequence_number);
                        }
                    }
                }
            }
            done.iter().filter_map(|seq| sent.remove(seq)).collect()
        };
        if !retired.is_empty() {
            debug!("[PORT] {} {} left {} frames behind", self.label, stream, retired.len());
        }
        for record in retired {
            if let Err(e) = self.reclaim(record) {
                warn!("[PORT] {} reclaim failed: {}", self.label, e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Deliver `event` to every opened stream
    ///
    /// # Errors
    /// `Busy` when no stream accepted it.
    pub fn send_event(&self, event: &StreamEvent) -> CoreResult<()> {
        // Handlers may close their stream
        let opened: Vec<Arc<dyn FrameConsumer>> = self.opened.read().clone();
        let delivered = opened
            .iter()
            .filter(|consumer| match consumer.deliver_event(event) {
                Ok(()) => true,
                Err(e) => {
                    debug!("[PORT] {} event refused by {}: {}", self.label, consumer.stream_id(), e);
                    false
                }
            })
            .count();
        if delivered == 0 {
            return Err(CoreError::busy(
                &self.label,
                format!("no stream accepted {}", event.event_type()),
            ));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Properties
    // ---------------------------------------------------------------------

    pub fn register_property_accessor(&self, accessor: Arc<dyn PropertyAccessor>) -> CoreResult<()> {
        let key = accessor.key().to_string();
        if key.is_empty() {
            return Err(CoreError::invalid_argument(&self.label, "empty property key"));
        }
        let mut accessors = self.accessors.write();
        if accessors.contains_key(&key) {
            return Err(CoreError::already_exists(
                &self.label,
                format!("property '{}' is already registered", key),
            ));
        }
        accessors.insert(key, accessor);
        Ok(())
    }

    pub fn unregister_property_accessor(&self, key: &str) -> CoreResult<()> {
        self.accessors
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found(&self.label, format!("property '{}'", key)))
    }

    pub fn clear_property_accessors(&self) {
        self.accessors.write().clear();
    }

    pub fn supported_property_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.accessors.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn accessor(&self, key: &PropertyKey) -> CoreResult<Arc<dyn PropertyAccessor>> {
        self.accessors
            .read()
            .get(key.base())
            .cloned()
            .ok_or_else(|| CoreError::not_found(&self.label, format!("property '{}'", key.base())))
    }

    pub fn get_property(&self, stream: StreamId, key: &str) -> CoreResult<PropertyValue> {
        let key = PropertyKey::parse(key)?;
        let accessor = self.accessor(&key)?;
        let _access = self.properties.start_property_access(stream, &key, false)?;
        accessor.get(&key).traced()
    }

    /// Set a property and tell every opened stream it changed
    pub fn set_property(&self, stream: StreamId, key: &str, value: &PropertyValue) -> CoreResult<()> {
        let key = PropertyKey::parse(key)?;
        let accessor = self.accessor(&key)?;
        {
            let _access = self.properties.start_property_access(stream, &key, true)?;
            accessor.set(&key, value).traced()?;
        }
        let event = StreamEvent::PropertyUpdated {
            key: key.full().to_string(),
        };
        if let Err(e) = self.send_event(&event) {
            debug!("[PORT] {} property update not delivered: {}", self.label, e);
        }
        Ok(())
    }

    pub fn lock_property(
        &self,
        stream: StreamId,
        keys: &[&str],
        timeout: WaitTimeout,
    ) -> CoreResult<LockResource> {
        self.properties.lock_property(stream, keys, timeout).traced()
    }

    pub fn unlock_property(&self, stream: StreamId, resource: &LockResource) -> CoreResult<()> {
        self.properties.unlock_property(stream, resource).traced()
    }
}
