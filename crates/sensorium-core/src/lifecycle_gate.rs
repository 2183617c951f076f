// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Root lifecycle gate
//!
//! Serializes runtime initialization, teardown, read-only queries and
//! per-stream operations. Admission, given the active operations A:
//!
//! | Request   | Rejected if A holds       | Waits while A holds     | Then requires   |
//! |-----------|---------------------------|-------------------------|-----------------|
//! | Init      | Init, ReadOnly, Stream(*) | Exit                    | not initialized |
//! | Exit      | Exit                      | Init, ReadOnly, Stream  | initialized     |
//! | ReadOnly  | Exit                      | Init                    | initialized     |
//! | Stream(k) | Exit                      | Init, Stream(k)         | initialized     |
//!
//! Admitted operations are represented by a [`LifecycleGuard`]; dropping it
//! removes the record and wakes every waiter.

use crate::error::{CoreError, CoreResult, LifecycleConflict};
use crate::sync::{lock, lock_recover, wait, wait_failed};
use crate::types::{InstanceIdentity, StreamId};
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

const BLOCK: &str = "lifecycle";

/// Category of a guarded public call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Init,
    Exit,
    ReadOnly,
    Stream(InstanceIdentity),
}

#[derive(Debug)]
struct OperationRecord {
    kind: OperationKind,
    owner: ThreadId,
}

/// Threads closing one stream and the outcome of the close that ran
#[derive(Debug, Default)]
struct CloseStatus {
    closers: usize,
    result: Option<CoreResult<()>>,
}

#[derive(Debug, Default)]
struct GateState {
    initialized: bool,
    next_id: u64,
    active: BTreeMap<u64, OperationRecord>,
    closing: AHashMap<StreamId, CloseStatus>,
}

enum Admission {
    Admit,
    Wait,
    Reject(LifecycleConflict, &'static str),
}

impl GateState {
    fn any(&self, predicate: impl Fn(&OperationKind) -> bool) -> bool {
        self.active.values().any(|record| predicate(&record.kind))
    }

    fn evaluate(&self, kind: &OperationKind) -> Admission {
        use LifecycleConflict::*;
        let exit_running = self.any(|k| matches!(k, OperationKind::Exit));
        let init_running = self.any(|k| matches!(k, OperationKind::Init));

        match kind {
            OperationKind::Init => {
                if init_running {
                    Admission::Reject(AlreadyRunning, "initialized by another thread")
                } else if self.any(|k| matches!(k, OperationKind::ReadOnly | OperationKind::Stream(_))) {
                    Admission::Reject(AlreadyInitialized, "already initialized")
                } else if exit_running {
                    Admission::Wait
                } else if self.initialized {
                    Admission::Reject(AlreadyInitialized, "already initialized")
                } else {
                    Admission::Admit
                }
            }
            OperationKind::Exit => {
                if exit_running {
                    Admission::Reject(AlreadyRunning, "terminated by another thread")
                } else if !self.active.is_empty() {
                    Admission::Wait
                } else if !self.initialized {
                    Admission::Reject(NotInitialized, "not initialized")
                } else {
                    Admission::Admit
                }
            }
            OperationKind::ReadOnly => {
                if exit_running {
                    Admission::Reject(AlreadyRunning, "terminated by another thread")
                } else if init_running {
                    Admission::Wait
                } else if !self.initialized {
                    Admission::Reject(NotInitialized, "not initialized")
                } else {
                    Admission::Admit
                }
            }
            OperationKind::Stream(identity) => {
                let same_identity = self.any(|k| matches!(k, OperationKind::Stream(other) if other == identity));
                if exit_running {
                    Admission::Reject(AlreadyRunning, "terminated by another thread")
                } else if init_running || same_identity {
                    Admission::Wait
                } else if !self.initialized {
                    Admission::Reject(NotInitialized, "not initialized")
                } else {
                    Admission::Admit
                }
            }
        }
    }

    fn release_closer(&mut self, stream: StreamId) {
        if let Some(status) = self.closing.get_mut(&stream) {
            status.closers = status.closers.saturating_sub(1);
            if status.closers == 0 {
                self.closing.remove(&stream);
            }
        }
    }
}

/// Process-wide lifecycle gate, owned by the runtime context
#[derive(Debug, Default)]
pub struct LifecycleGate {
    state: Mutex<GateState>,
    wake: Condvar,
}

impl LifecycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        lock_recover(&self.state).initialized
    }

    /// Number of operations currently admitted
    pub fn active_count(&self) -> usize {
        lock_recover(&self.state).active.len()
    }

    pub fn lock_for_init(&self) -> CoreResult<LifecycleGuard<'_>> {
        self.admit(OperationKind::Init, None)
    }

    pub fn lock_for_exit(&self) -> CoreResult<LifecycleGuard<'_>> {
        self.admit(OperationKind::Exit, None)
    }

    pub fn lock_for_read_only(&self) -> CoreResult<LifecycleGuard<'_>> {
        self.admit(OperationKind::ReadOnly, None)
    }

    pub fn lock_for_stream(&self, identity: &InstanceIdentity) -> CoreResult<LifecycleGuard<'_>> {
        self.admit(OperationKind::Stream(identity.clone()), None)
    }

    /// Stream admission for closing `stream`
    ///
    /// The closer is registered before waiting, so every thread that piles up
    /// behind the first close can read that close's result from the guard.
    pub fn lock_for_closing_stream(
        &self,
        identity: &InstanceIdentity,
        stream: StreamId,
    ) -> CoreResult<LifecycleGuard<'_>> {
        lock(&self.state, BLOCK)?
            .closing
            .entry(stream)
            .or_default()
            .closers += 1;

        let admitted = self.admit(OperationKind::Stream(identity.clone()), Some(stream));
        if admitted.is_err() {
            let mut state = lock_recover(&self.state);
            state.release_closer(stream);
        }
        admitted
    }

    fn admit(&self, kind: OperationKind, closing: Option<StreamId>) -> CoreResult<LifecycleGuard<'_>> {
        let mut state = lock(&self.state, BLOCK)?;
        loop {
            match state.evaluate(&kind) {
                Admission::Admit => break,
                Admission::Reject(conflict, message) => {
                    debug!("[LIFECYCLE] {:?} rejected: {}", kind, message);
                    return Err(CoreError::lifecycle(conflict, message));
                }
                Admission::Wait => {
                    trace!("[LIFECYCLE] {:?} waiting", kind);
                    state = wait(&self.wake, state).map_err(|_| wait_failed(BLOCK))?;
                }
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        debug!("[LIFECYCLE] {:?} admitted as #{}", kind, id);
        state.active.insert(
            id,
            OperationRecord {
                kind,
                owner: thread::current().id(),
            },
        );
        Ok(LifecycleGuard {
            gate: self,
            id,
            closing,
        })
    }
}

/// One admitted operation; released on drop
#[derive(Debug)]
pub struct LifecycleGuard<'a> {
    gate: &'a LifecycleGate,
    id: u64,
    closing: Option<StreamId>,
}

impl LifecycleGuard<'_> {
    /// Record the outcome of `Init` (true) or `Exit` (false) before the guard drops
    pub fn set_initialized(&self, initialized: bool) {
        let mut state = lock_recover(&self.gate.state);
        debug_assert!(matches!(
            state.active.get(&self.id).map(|r| &r.kind),
            Some(OperationKind::Init | OperationKind::Exit)
        ));
        state.initialized = initialized;
    }

    /// Result of a close already performed by an earlier closer of the same stream
    pub fn close_status(&self) -> Option<CoreResult<()>> {
        let stream = self.closing?;
        let state = lock_recover(&self.gate.state);
        state.closing.get(&stream).and_then(|s| s.result.clone())
    }

    /// Publish this close's result to the closers queued behind it
    pub fn record_close_status(&self, result: &CoreResult<()>) {
        if let Some(stream) = self.closing {
            let mut state = lock_recover(&self.gate.state);
            if let Some(status) = state.closing.get_mut(&stream) {
                status.result = Some(result.clone());
            }
        }
    }

    /// Thread that was admitted
    pub fn owner(&self) -> Option<ThreadId> {
        lock_recover(&self.gate.state).active.get(&self.id).map(|r| r.owner)
    }
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock_recover(&self.gate.state);
        if let Some(record) = state.active.remove(&self.id) {
            trace!("[LIFECYCLE] {:?} released", record.kind);
        }
        if let Some(stream) = self.closing {
            state.release_closer(stream);
        }
        drop(state);
        self.gate.wake.notify_all();
    }
}
