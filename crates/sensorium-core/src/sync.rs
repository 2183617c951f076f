// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mutex/condvar helpers for the gates
//!
//! A poisoned mutex means a thread panicked while holding gate bookkeeping.
//! Acquisition paths turn that into `Aborted`; release paths recover the
//! guard so records are still removed and waiters still woken.

use crate::error::{CoreError, CoreResult};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::error;

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, block: &str) -> CoreResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| {
        error!("[{}] bookkeeping mutex poisoned", block);
        CoreError::aborted(block, "bookkeeping mutex poisoned")
    })
}

/// Lock for cleanup, ignoring poison
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Park on `condvar`; `Err` carries the recovered guard so the caller can
/// withdraw its request before reporting `Aborted`
pub(crate) fn wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
) -> Result<MutexGuard<'a, T>, MutexGuard<'a, T>> {
    condvar.wait(guard).map_err(PoisonError::into_inner)
}

/// Timed variant of [`wait`]
pub(crate) fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    duration: Duration,
) -> Result<MutexGuard<'a, T>, MutexGuard<'a, T>> {
    condvar
        .wait_timeout(guard, duration)
        .map(|(guard, _)| guard)
        .map_err(|poisoned| poisoned.into_inner().0)
}

#[track_caller]
pub(crate) fn wait_failed(block: &str) -> CoreError {
    error!("[{}] condition wait failed", block);
    CoreError::aborted(block, "condition wait failed")
}
