// SPDX-License-Identifier: CEPL-1.0
use std::fmt;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Logged, the operation is aborted, the process continues.
    Recoverable,
    /// Logged, the process terminates once the renderer has been dropped.
    Fatal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Uncategorized,
    InitializationFailed,
    DriverError,
    ArenaOutOfMemory,
    NullDereference,
    IndexOutOfBounds,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Uncategorized => "uncategorized",
            Origin::InitializationFailed => "initialization-failed",
            Origin::DriverError => "driver-error",
            Origin::ArenaOutOfMemory => "arena-out-of-memory",
            Origin::NullDereference => "null-dereference",
            Origin::IndexOutOfBounds => "index-out-of-bounds",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{origin}: {message}")]
pub struct EngineError {
    pub severity: Severity,
    pub origin: Origin,
    pub message: String,
    /// Raw driver result code, when the failure came from a driver call.
    pub code: Option<i32>,
}

impl EngineError {
    pub fn new(severity: Severity, origin: Origin, message: impl Into<String>) -> Self {
        Self {
            severity,
            origin,
            message: message.into(),
            code: None,
        }
    }

    pub fn fatal(origin: Origin, message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, origin, message)
    }

    pub fn recoverable(origin: Origin, message: impl Into<String>) -> Self {
        Self::new(Severity::Recoverable, origin, message)
    }

    pub fn with_code(mut self, code: Option<i32>) -> Self {
        self.code = code;
        self
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

/// Receiver for every error a component reports.
///
/// Injected at construction; there is no process-wide renderer pointer.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &EngineError);
}

impl<F> ErrorSink for F
where
    F: Fn(&EngineError) + Send + Sync,
{
    fn report(&self, err: &EngineError) {
        self(err)
    }
}

/// Default sink: recoverable errors at `warn`, fatal ones at `error`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, err: &EngineError) {
        match (err.severity, err.code) {
            (Severity::Recoverable, Some(code)) => {
                tracing::warn!(origin = %err.origin, code, "{}", err.message)
            }
            (Severity::Recoverable, None) => {
                tracing::warn!(origin = %err.origin, "{}", err.message)
            }
            (Severity::Fatal, Some(code)) => {
                tracing::error!(origin = %err.origin, code, "fatal: {}", err.message)
            }
            (Severity::Fatal, None) => {
                tracing::error!(origin = %err.origin, "fatal: {}", err.message)
            }
        }
    }
}
