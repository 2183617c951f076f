// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-port property access gate
//!
//! Two mechanisms share one table of per-key state:
//! - explicit locks: a stream takes exclusive ownership of a key set
//!   ([`PropertyAccessGate::lock_property`] / [`PropertyAccessGate::unlock_property`])
//! - implicit access: every get/set runs inside a [`PropertyAccess`] scope
//!
//! Implicit access never waits. A get or set on a key locked by another
//! stream is `Busy`; a set needs the key free of any other accessor and is
//! `Busy` otherwise; a get is `Busy` while a set is in flight. Explicit locks
//! wait for in-flight accessors to drain.

use super::key::PropertyKey;
use crate::error::{CoreError, CoreResult, Traced};
use crate::sync::{lock, lock_recover, wait, wait_failed, wait_timeout};
use crate::types::{StreamId, WaitTimeout};
use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Invoked after keys are taken, with the gate unlocked; an error rolls the lock back
pub type LockHook = Arc<dyn Fn(&LockRequest<'_>) -> CoreResult<()> + Send + Sync>;

/// Invoked before keys are released, with the gate unlocked; an error keeps the lock
pub type UnlockHook = Arc<dyn Fn(&LockResource) -> CoreResult<()> + Send + Sync>;

/// What a lock hook sees
#[derive(Debug)]
pub struct LockRequest<'a> {
    pub stream: StreamId,
    pub keys: &'a [PropertyKey],
    pub resource: &'a LockResource,
    /// Time left of the caller's timeout
    pub remaining: WaitTimeout,
}

#[derive(Debug)]
struct ResourceInner {
    id: u64,
    stream: StreamId,
    keys: Vec<PropertyKey>,
}

/// Handle to an explicit multi-key lock
///
/// Owned by the locking caller; the gate keeps only a weak reference to
/// recognise handles it issued.
#[derive(Debug, Clone)]
pub struct LockResource {
    inner: Arc<ResourceInner>,
}

impl LockResource {
    pub fn stream(&self) -> StreamId {
        self.inner.stream
    }

    pub fn keys(&self) -> &[PropertyKey] {
        &self.inner.keys
    }
}

#[derive(Debug, Default)]
struct KeyLockState {
    holder: Option<StreamId>,
    in_flight: usize,
    writing: bool,
}

impl KeyLockState {
    fn is_vacant(&self) -> bool {
        self.holder.is_none() && self.in_flight == 0
    }
}

#[derive(Debug)]
struct ResourceEntry {
    stream: StreamId,
    keys: Vec<PropertyKey>,
    handle: Weak<ResourceInner>,
    /// Unlock hook running; other unlocks of this resource are refused
    releasing: bool,
}

#[derive(Debug, Default)]
struct LockTable {
    /// base key -> append information -> state
    keys: AHashMap<String, AHashMap<String, KeyLockState>>,
    resources: AHashMap<u64, ResourceEntry>,
    attached: AHashSet<StreamId>,
    next_resource: u64,
}

impl LockTable {
    /// States contending with `key`
    fn scope<'a>(&'a self, key: &'a PropertyKey) -> impl Iterator<Item = &'a KeyLockState> + 'a {
        self.keys
            .get(key.base())
            .into_iter()
            .flat_map(move |appends| {
                appends
                    .iter()
                    .filter_map(move |(append, state)| key.contends_with_append(append).then_some(state))
            })
    }

    fn state_mut(&mut self, key: &PropertyKey) -> &mut KeyLockState {
        self.keys
            .entry(key.base().to_string())
            .or_default()
            .entry(key.append().to_string())
            .or_default()
    }

    fn prune(&mut self, key: &PropertyKey) {
        if let Some(appends) = self.keys.get_mut(key.base()) {
            if appends.get(key.append()).is_some_and(KeyLockState::is_vacant) {
                appends.remove(key.append());
            }
            if appends.is_empty() {
                self.keys.remove(key.base());
            }
        }
    }

    fn held_by(&self, key: &PropertyKey, stream: StreamId) -> bool {
        self.scope(key).any(|s| s.holder == Some(stream))
    }

    fn lockable(&self, key: &PropertyKey) -> bool {
        self.scope(key).all(KeyLockState::is_vacant)
    }

    fn release_keys(&mut self, keys: &[PropertyKey]) {
        for key in keys {
            self.state_mut(key).holder = None;
            self.prune(key);
        }
    }
}

/// Arbitrates explicit locks and implicit access for one port's properties
pub struct PropertyAccessGate {
    label: String,
    table: Mutex<LockTable>,
    wake: Condvar,
    lock_hook: RwLock<Option<LockHook>>,
    unlock_hook: RwLock<Option<UnlockHook>>,
}

impl std::fmt::Debug for PropertyAccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyAccessGate")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl PropertyAccessGate {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            table: Mutex::new(LockTable::default()),
            wake: Condvar::new(),
            lock_hook: RwLock::new(None),
            unlock_hook: RwLock::new(None),
        }
    }

    /// Install or clear the lock/unlock hooks
    pub fn set_hooks(&self, on_lock: Option<LockHook>, on_unlock: Option<UnlockHook>) {
        *self.lock_hook.write() = on_lock;
        *self.unlock_hook.write() = on_unlock;
    }

    /// Allow `stream` to lock and access properties
    pub fn attach_stream(&self, stream: StreamId) -> CoreResult<()> {
        let mut table = lock(&self.table, &self.label)?;
        if !table.attached.insert(stream) {
            return Err(CoreError::already_exists(
                &self.label,
                format!("{} is already attached", stream),
            ));
        }
        Ok(())
    }

    /// Force-release every lock `stream` holds and reject its future requests
    ///
    /// Threads of `stream` waiting in `lock_property` fail with `InvalidOperation`.
    pub fn detach_stream(&self, stream: StreamId) {
        let orphaned: Vec<LockResource> = {
            let mut table = lock_recover(&self.table);
            table.attached.remove(&stream);
            table
                .resources
                .iter_mut()
                .filter(|(_, entry)| entry.stream == stream && !entry.releasing)
                .map(|(id, entry)| {
                    entry.releasing = true;
                    LockResource {
                        inner: entry.handle.upgrade().unwrap_or_else(|| {
                            Arc::new(ResourceInner {
                                id: *id,
                                stream,
                                keys: entry.keys.clone(),
                            })
                        }),
                    }
                })
                .collect()
        };

        let unlock_hook = self.unlock_hook.read().clone();
        for resource in orphaned {
            if let Some(hook) = &unlock_hook {
                if let Err(e) = hook(&resource) {
                    warn!("[PROPERTY-GATE] {} unlock hook failed during force unlock: {}", self.label, e);
                }
            }
            let mut table = lock_recover(&self.table);
            if let Some(entry) = table.resources.remove(&resource.inner.id) {
                table.release_keys(&entry.keys);
            }
            debug!(
                "[PROPERTY-GATE] {} force-unlocked {:?} of {}",
                self.label,
                resource.keys().iter().map(PropertyKey::full).collect::<Vec<_>>(),
                stream
            );
        }
        self.wake.notify_all();
    }

    /// Take exclusive ownership of every key in `keys` at once
    ///
    /// # Errors
    /// - `InvalidArgument`: empty set or malformed key
    /// - `InvalidOperation`: `stream` already holds one of the keys, or is detached
    /// - `Timeout`: keys not free in time (`Poll` fails on the first conflict)
    /// - `Aborted`: the wait itself failed
    /// - anything the lock hook returns
    pub fn lock_property(
        &self,
        stream: StreamId,
        keys: &[&str],
        timeout: WaitTimeout,
    ) -> CoreResult<LockResource> {
        if keys.is_empty() {
            return Err(CoreError::invalid_argument(&self.label, "empty property key set"));
        }
        let keys: Vec<PropertyKey> = keys
            .iter()
            .map(|k| PropertyKey::parse(k))
            .collect::<CoreResult<BTreeSet<_>>>()?
            .into_iter()
            .collect();

        let deadline = timeout.deadline_from(Instant::now());
        let mut table = lock(&self.table, &self.label)?;
        loop {
            if !table.attached.contains(&stream) {
                return Err(CoreError::invalid_operation(
                    &self.label,
                    format!("{} is not attached", stream),
                ));
            }
            if let Some(key) = keys.iter().find(|k| table.held_by(k, stream)) {
                return Err(CoreError::invalid_operation(
                    &self.label,
                    format!("'{}' is already locked by {}", key, stream),
                ));
            }
            if keys.iter().all(|k| table.lockable(k)) {
                break;
            }

            table = match (timeout, deadline) {
                (WaitTimeout::Poll, _) => {
                    return Err(CoreError::timeout(&self.label, "property is locked"));
                }
                (WaitTimeout::After(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CoreError::timeout(&self.label, "property lock timed out"));
                    }
                    wait_timeout(&self.wake, table, deadline - now)
                        .map_err(|_| wait_failed(&self.label))?
                }
                _ => wait(&self.wake, table).map_err(|_| wait_failed(&self.label))?,
            };
            trace!("[PROPERTY-GATE] {} woke, re-checking lock for {}", self.label, stream);
        }

        let id = table.next_resource;
        table.next_resource += 1;
        for key in &keys {
            table.state_mut(key).holder = Some(stream);
        }
        let resource = LockResource {
            inner: Arc::new(ResourceInner {
                id,
                stream,
                keys: keys.clone(),
            }),
        };
        table.resources.insert(
            id,
            ResourceEntry {
                stream,
                keys,
                handle: Arc::downgrade(&resource.inner),
                releasing: false,
            },
        );
        drop(table);

        let lock_hook = self.lock_hook.read().clone();
        if let Some(hook) = lock_hook {
            let request = LockRequest {
                stream,
                keys: resource.keys(),
                resource: &resource,
                remaining: timeout.remaining(deadline, Instant::now()),
            };
            if let Err(e) = hook(&request) {
                warn!("[PROPERTY-GATE] {} lock hook failed, rolling back: {}", self.label, e);
                let mut table = lock_recover(&self.table);
                if let Some(entry) = table.resources.remove(&id) {
                    table.release_keys(&entry.keys);
                }
                drop(table);
                self.wake.notify_all();
                return Err(e.traced());
            }
        }

        debug!(
            "[PROPERTY-GATE] {} locked {:?} for {}",
            self.label,
            resource.keys().iter().map(PropertyKey::full).collect::<Vec<_>>(),
            stream
        );
        Ok(resource)
    }

    /// Release an explicit lock
    ///
    /// # Errors
    /// `InvalidArgument` if `resource` was not issued by this gate, is already
    /// released, or belongs to another stream.
    pub fn unlock_property(&self, stream: StreamId, resource: &LockResource) -> CoreResult<()> {
        {
            let mut table = lock_recover(&self.table);
            let issued = table.resources.get_mut(&resource.inner.id).filter(|entry| {
                Weak::ptr_eq(&entry.handle, &Arc::downgrade(&resource.inner))
            });
            match issued {
                Some(entry) if entry.stream == stream && !entry.releasing => entry.releasing = true,
                Some(entry) if entry.stream == stream => {
                    return Err(CoreError::invalid_argument(
                        &self.label,
                        "lock resource is already being released",
                    ))
                }
                Some(_) => {
                    return Err(CoreError::invalid_argument(
                        &self.label,
                        format!("lock resource is not owned by {}", stream),
                    ))
                }
                None => {
                    return Err(CoreError::invalid_argument(
                        &self.label,
                        "unknown or released lock resource",
                    ))
                }
            }
        }

        let unlock_hook = self.unlock_hook.read().clone();
        if let Some(hook) = unlock_hook {
            if let Err(e) = hook(resource) {
                let mut table = lock_recover(&self.table);
                if table.attached.contains(&stream) {
                    if let Some(entry) = table.resources.get_mut(&resource.inner.id) {
                        entry.releasing = false;
                    }
                } else if let Some(entry) = table.resources.remove(&resource.inner.id) {
                    // Detached meanwhile; nobody is left to retry
                    table.release_keys(&entry.keys);
                    drop(table);
                    self.wake.notify_all();
                }
                return Err(e.traced());
            }
        }

        let mut table = lock_recover(&self.table);
        if let Some(entry) = table.resources.remove(&resource.inner.id) {
            table.release_keys(&entry.keys);
        }
        drop(table);
        self.wake.notify_all();
        debug!("[PROPERTY-GATE] {} unlocked resource of {}", self.label, stream);
        Ok(())
    }

    /// Begin one get (`is_set == false`) or set on `key`; ends when the guard drops
    pub fn start_property_access(
        &self,
        stream: StreamId,
        key: &PropertyKey,
        is_set: bool,
    ) -> CoreResult<PropertyAccess<'_>> {
        let mut table = lock(&self.table, &self.label)?;
        if !table.attached.contains(&stream) {
            return Err(CoreError::invalid_operation(
                &self.label,
                format!("{} is not attached", stream),
            ));
        }
        if table
            .scope(key)
            .any(|s| s.holder.is_some_and(|holder| holder != stream))
        {
            return Err(CoreError::busy(
                &self.label,
                format!("'{}' is locked by another stream", key),
            ));
        }
        if is_set && table.scope(key).any(|s| s.in_flight > 0) {
            return Err(CoreError::busy(
                &self.label,
                format!("'{}' is being accessed", key),
            ));
        }
        if !is_set && table.scope(key).any(|s| s.writing) {
            return Err(CoreError::busy(
                &self.label,
                format!("'{}' is being set", key),
            ));
        }

        let state = table.state_mut(key);
        state.in_flight += 1;
        state.writing |= is_set;
        Ok(PropertyAccess {
            gate: self,
            key: key.clone(),
            is_set,
        })
    }

    /// Stream holding an explicit lock that covers `key`
    pub fn lock_holder(&self, key: &PropertyKey) -> Option<StreamId> {
        lock_recover(&self.table).scope(key).find_map(|s| s.holder)
    }

    /// Number of keys with live bookkeeping
    pub fn tracked_keys(&self) -> usize {
        lock_recover(&self.table).keys.values().map(|a| a.len()).sum()
    }

    fn end_property_access(&self, key: &PropertyKey, is_set: bool) {
        let mut table = lock_recover(&self.table);
        let state = table.state_mut(key);
        state.in_flight = state.in_flight.saturating_sub(1);
        if is_set {
            state.writing = false;
        }
        table.prune(key);
        drop(table);
        self.wake.notify_all();
    }
}

/// One in-flight get or set
#[derive(Debug)]
pub struct PropertyAccess<'a> {
    gate: &'a PropertyAccessGate,
    key: PropertyKey,
    is_set: bool,
}

impl PropertyAccess<'_> {
    pub fn key(&self) -> &PropertyKey {
        &self.key
    }

    /// End the access now rather than at scope exit
    pub fn end(self) {}
}

impl Drop for PropertyAccess<'_> {
    fn drop(&mut self) {
        self.gate.end_property_access(&self.key, self.is_set);
    }
}
