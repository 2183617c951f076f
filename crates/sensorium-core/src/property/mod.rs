// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Properties: keys, accessors and the per-port access gate

pub mod access_gate;
pub mod key;

pub use access_gate::{LockHook, LockRequest, LockResource, PropertyAccess, PropertyAccessGate, UnlockHook};
pub use key::{PropertyKey, CHANNEL_TAG};

use crate::error::CoreResult;
use crate::types::PropertyValue;

/// Reads and writes one base property key (and its appended variants)
pub trait PropertyAccessor: Send + Sync {
    /// Base key served by this accessor
    fn key(&self) -> &str;

    fn get(&self, key: &PropertyKey) -> CoreResult<PropertyValue>;

    fn set(&self, key: &PropertyKey, value: &PropertyValue) -> CoreResult<()>;
}
