// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Core error type.

Every fallible core operation returns [`CoreResult`]. A [`CoreError`] keeps
the cause and the location where it was first detected; each layer it passes
through may append its own call site with [`Traced::traced`] so the top-level
caller sees both.
*/

use std::fmt;
use std::panic::Location;
use thiserror::Error;

/// What went wrong, independent of where
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCause {
    /// Empty or malformed input
    InvalidArgument,
    /// Wrong lifecycle state, double lock, release after retirement
    InvalidOperation,
    /// Unknown key, stream, port, frame or resource
    NotFound,
    /// Explicit wait deadline exceeded
    Timeout,
    /// The wait primitive itself failed
    Aborted,
    /// Resource held by someone else
    Busy,
    /// Duplicate registration
    AlreadyExists,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCause::InvalidArgument => "invalid argument",
            ErrorCause::InvalidOperation => "invalid operation",
            ErrorCause::NotFound => "not found",
            ErrorCause::Timeout => "timeout",
            ErrorCause::Aborted => "aborted",
            ErrorCause::Busy => "busy",
            ErrorCause::AlreadyExists => "already exists",
        };
        f.write_str(name)
    }
}

/// Why the lifecycle gate refused an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleConflict {
    /// The same exclusive operation is already in flight on another thread
    AlreadyRunning,
    NotInitialized,
    AlreadyInitialized,
}

/// Error raised by the core
#[derive(Error, Debug, Clone)]
#[error("[{block}] {cause}: {message}")]
pub struct CoreError {
    cause: ErrorCause,
    block: String,
    message: String,
    conflict: Option<LifecycleConflict>,
    trace: Vec<&'static Location<'static>>,
}

impl CoreError {
    /// `block` names the component or manager that detected the failure
    #[track_caller]
    pub fn new(cause: ErrorCause, block: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            cause,
            block: block.into(),
            message: message.into(),
            conflict: None,
            trace: vec![Location::caller()],
        }
    }

    #[track_caller]
    pub fn invalid_argument(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCause::InvalidArgument, block, message)
    }

    #[track_caller]
    pub fn invalid_operation(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCause::InvalidOperation, block, message)
    }

    #[track_caller]
    pub fn not_found(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCause::NotFound, block, message)
    }

    #[track_caller]
    pub fn timeout(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCause::Timeout, block, message)
    }

    #[track_caller]
    pub fn aborted(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCause::Aborted, block, message)
    }

    #[track_caller]
    pub fn busy(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCause::Busy, block, message)
    }

    #[track_caller]
    pub fn already_exists(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCause::AlreadyExists, block, message)
    }

    /// Lifecycle refusal; always an `InvalidOperation`
    #[track_caller]
    pub fn lifecycle(conflict: LifecycleConflict, message: impl Into<String>) -> Self {
        let mut error = Self::new(ErrorCause::InvalidOperation, "lifecycle", message);
        error.conflict = Some(conflict);
        error
    }

    pub fn cause(&self) -> ErrorCause {
        self.cause
    }

    pub fn block(&self) -> &str {
        &self.block
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn lifecycle_conflict(&self) -> Option<LifecycleConflict> {
        self.conflict
    }

    pub fn is(&self, cause: ErrorCause) -> bool {
        self.cause == cause
    }

    /// Where the error was first detected
    pub fn origin(&self) -> &'static Location<'static> {
        self.trace[0]
    }

    /// Detection site followed by every call site that traced it, innermost first
    pub fn trace(&self) -> &[&'static Location<'static>] {
        &self.trace
    }

    /// Append the caller's location
    #[track_caller]
    pub fn traced(mut self) -> Self {
        self.trace.push(Location::caller());
        self
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Call-site annotation for propagating errors
pub trait Traced {
    #[track_caller]
    fn traced(self) -> Self;
}

impl<T> Traced for CoreResult<T> {
    #[track_caller]
    fn traced(self) -> Self {
        let here = Location::caller();
        self.map_err(|mut error| {
            error.trace.push(here);
            error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect() -> CoreResult<()> {
        Err(CoreError::not_found("port", "frame 7 is not in flight"))
    }

    fn forward() -> CoreResult<()> {
        detect().traced()
    }

    #[test]
    fn test_trace_keeps_origin_and_adds_call_sites() {
        let err = forward().traced().unwrap_err();
        assert_eq!(err.cause(), ErrorCause::NotFound);
        assert_eq!(err.trace().len(), 3);
        assert_eq!(err.origin().file(), file!());
        assert!(err.trace()[0].line() < err.trace()[1].line());
    }

    #[test]
    fn test_display() {
        let err = CoreError::busy("stream-3", "property locked");
        assert_eq!(err.to_string(), "[stream-3] busy: property locked");
    }

    #[test]
    fn test_lifecycle_conflict() {
        let err = CoreError::lifecycle(LifecycleConflict::NotInitialized, "not initialized");
        assert!(err.is(ErrorCause::InvalidOperation));
        assert_eq!(err.lifecycle_conflict(), Some(LifecycleConflict::NotInitialized));
        assert_eq!(err.block(), "lifecycle");
    }
}
