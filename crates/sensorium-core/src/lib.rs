// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
# sensorium-core

Concurrency and resource-lifecycle core of the sensorium streaming runtime.

## Architecture

```text
Runtime ── LifecycleGate (Init / Exit / ReadOnly / Stream(identity))
   │
   ├── FramePort (one per instance.port_type.port_id)
   │      ├── PropertyAccessGate   explicit multi-key locks + implicit access
   │      ├── sent-frame records   exactly-once reclaim across streams
   │      └── ProducerAdapter      ProducerFunctionGate (State / ReleaseFrame / Property)
   │                                + production thread
   └── Stream (many per port)      bounded frame queue, events, properties
```

All blocking happens in the gates; every gate owns one private mutex and
parks callers on a condition variable until their admission predicate holds.
*/

pub mod error;
pub mod lifecycle_gate;
pub mod port;
pub mod producer;
pub mod producer_gate;
pub mod property;
pub mod runtime;
pub mod stream;
pub mod types;

mod sync;

pub use error::{CoreError, CoreResult, ErrorCause, LifecycleConflict, Traced};
pub use lifecycle_gate::{LifecycleGate, LifecycleGuard, OperationKind};
pub use port::{Delivery, FrameConsumer, FrameOutcome, FramePort, PortBackend};
pub use producer::{Producer, ProducerAdapter, ProducerContext, ProducerFactory, ProducerRegistry, ProducerSpec};
pub use producer_gate::{FunctionCategory, ProducerFunctionGate, ProducerGuard};
pub use property::{LockResource, PropertyAccess, PropertyAccessGate, PropertyAccessor, PropertyKey};
pub use runtime::Runtime;
pub use stream::{BufferPolicy, EventHandler, Stream, StreamState};
pub use types::{
    Channel, Frame, InstanceIdentity, PortAddress, PropertyValue, StreamArguments, StreamEvent, StreamId,
    WaitTimeout, EVENT_ANY,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
