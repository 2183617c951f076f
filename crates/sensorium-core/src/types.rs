// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Identifiers, frames, events and timeouts shared across the core

use crate::error::ErrorCause;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Named, typed property value
pub type PropertyValue = serde_json::Value;

/// Free-form arguments handed to producers when a port is opened
pub type StreamArguments = BTreeMap<String, String>;

/// Runtime-assigned identifier of an open stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// One port of one component instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortAddress {
    pub instance: String,
    pub port_type: String,
    pub port_id: i32,
}

impl PortAddress {
    pub fn new(instance: impl Into<String>, port_type: impl Into<String>, port_id: i32) -> Self {
        Self {
            instance: instance.into(),
            port_type: port_type.into(),
            port_id,
        }
    }

    pub fn identity(&self) -> InstanceIdentity {
        InstanceIdentity(self.to_string())
    }
}

impl fmt::Display for PortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.instance, self.port_type, self.port_id)
    }
}

/// Key deciding which per-stream lifecycle operations conflict
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIdentity(String);

impl InstanceIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One channel of a frame; the payload is shared, never copied by the core
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: u32,
    pub data: Arc<[u8]>,
}

impl Channel {
    pub fn new(id: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }
}

/// One timestamped unit of data
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sequence_number: u64,
    /// Producer timestamp in nanoseconds
    pub timestamp_ns: u64,
    pub channels: Vec<Channel>,
}

impl Frame {
    pub fn new(sequence_number: u64, timestamp_ns: u64, channels: Vec<Channel>) -> Self {
        Self {
            sequence_number,
            timestamp_ns,
            channels,
        }
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn channel_ids(&self) -> Vec<u32> {
        self.channels.iter().map(|c| c.id).collect()
    }
}

/// Event type name that matches every event in handler registration
pub const EVENT_ANY: &str = "EventAny";

/// Notification sent from a port to its streams
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Error { cause: ErrorCause, message: String },
    Fatal { cause: ErrorCause, message: String },
    FrameDropped { sequence_number: u64 },
    PropertyUpdated { key: String },
    Plugged,
    Unplugged,
    Custom {
        name: String,
        arguments: BTreeMap<String, String>,
    },
}

impl StreamEvent {
    /// Name used to route the event to handlers
    pub fn event_type(&self) -> &str {
        match self {
            StreamEvent::Error { .. } => "EventError",
            StreamEvent::Fatal { .. } => "EventFatal",
            StreamEvent::FrameDropped { .. } => "EventFrameDropped",
            StreamEvent::PropertyUpdated { .. } => "EventPropertyUpdated",
            StreamEvent::Plugged => "EventPlugged",
            StreamEvent::Unplugged => "EventUnplugged",
            StreamEvent::Custom { name, .. } => name,
        }
    }
}

/// How long a blocking call may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Check once, never wait
    Poll,
    Forever,
    After(Duration),
}

impl WaitTimeout {
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => WaitTimeout::Poll,
            m if m < 0 => WaitTimeout::Forever,
            m => WaitTimeout::After(Duration::from_millis(m as u64)),
        }
    }

    /// Absolute deadline for `After`, measured from `start`
    pub fn deadline_from(&self, start: Instant) -> Option<Instant> {
        match self {
            WaitTimeout::After(duration) => Some(start + *duration),
            _ => None,
        }
    }

    /// What is left of this timeout at `now` given the original deadline
    pub fn remaining(&self, deadline: Option<Instant>, now: Instant) -> WaitTimeout {
        match (self, deadline) {
            (WaitTimeout::After(_), Some(deadline)) => {
                WaitTimeout::After(deadline.saturating_duration_since(now))
            }
            (other, _) => *other,
        }
    }
}

impl From<i64> for WaitTimeout {
    fn from(millis: i64) -> Self {
        WaitTimeout::from_millis(millis)
    }
}

impl From<Duration> for WaitTimeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            WaitTimeout::Poll
        } else {
            WaitTimeout::After(duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_conventions() {
        assert_eq!(WaitTimeout::from_millis(0), WaitTimeout::Poll);
        assert_eq!(WaitTimeout::from(-1i64), WaitTimeout::Forever);
        assert_eq!(WaitTimeout::from_millis(-500), WaitTimeout::Forever);
        assert_eq!(
            WaitTimeout::from(250i64),
            WaitTimeout::After(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_remaining_never_negative() {
        let timeout = WaitTimeout::After(Duration::from_millis(10));
        let start = Instant::now();
        let deadline = timeout.deadline_from(start);
        let later = start + Duration::from_millis(50);
        assert_eq!(
            timeout.remaining(deadline, later),
            WaitTimeout::After(Duration::ZERO)
        );
        assert_eq!(WaitTimeout::Forever.remaining(None, later), WaitTimeout::Forever);
    }

    #[test]
    fn test_identity_format() {
        let address = PortAddress::new("cam0", "image", 2);
        assert_eq!(address.identity().as_str(), "cam0.image.2");
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            StreamEvent::FrameDropped { sequence_number: 1 }.event_type(),
            "EventFrameDropped"
        );
        let custom = StreamEvent::Custom {
            name: "EventRecordState".to_string(),
            arguments: BTreeMap::new(),
        };
        assert_eq!(custom.event_type(), "EventRecordState");
    }
}
