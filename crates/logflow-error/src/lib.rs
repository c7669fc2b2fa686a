//! Structured error taxonomy for the logflow workspace.
//!
//! §7 of the design distinguishes *kinds* of failure, not a flat list of
//! error types: transient vs. permanent transport failures, overflow,
//! shutdown, config errors, and fatal invariant violations. `LogFlowError`
//! keeps that taxonomy explicit so callers can match on `.kind()` instead
//! of downcasting.
//!
//! Propagation policy (§7): transport errors never escape the destination
//! worker — they are interpreted locally and turned into state transitions
//! and counters. Only `ConfigError` crosses into the control surface, and
//! `Fatal` aborts the process rather than unwinding, since it signals a
//! broken invariant (e.g. acking more items than are on the backlog) that
//! cannot be recovered from.

use thiserror::Error;

/// Coarse error kind, independent of the message/context carried by the
/// variant. Used to drive retry/backoff decisions without matching the
/// full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientTransport,
    PermanentTransport,
    Overflow,
    Shutdown,
    ConfigError,
    Fatal,
}

#[derive(Error, Debug)]
pub enum LogFlowError {
    #[error("transient transport error in driver `{driver}` (worker {worker_index}): {message}")]
    TransientTransport {
        driver: String,
        worker_index: usize,
        message: String,
    },

    #[error("permanent transport error in driver `{driver}` (worker {worker_index}): {message}")]
    PermanentTransport {
        driver: String,
        worker_index: usize,
        message: String,
    },

    #[error("queue `{queue}` overflowed: dropped {dropped} message(s) (capacity {capacity})")]
    Overflow {
        queue: String,
        dropped: u64,
        capacity: u32,
    },

    #[error("shutdown requested")]
    Shutdown,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("fatal internal invariant violated: {0}")]
    Fatal(String),
}

impl LogFlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LogFlowError::TransientTransport { .. } => ErrorKind::TransientTransport,
            LogFlowError::PermanentTransport { .. } => ErrorKind::PermanentTransport,
            LogFlowError::Overflow { .. } => ErrorKind::Overflow,
            LogFlowError::Shutdown => ErrorKind::Shutdown,
            LogFlowError::ConfigError(_) => ErrorKind::ConfigError,
            LogFlowError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Fatal)
    }
}

pub type Result<T> = std::result::Result<T, LogFlowError>;

/// Abort the process on a broken core invariant (§7 `Fatal`).
///
/// Used for conditions that indicate the queue/backlog bookkeeping has
/// gone inconsistent (e.g. acking more items than exist in the backlog) —
/// situations where continuing would silently corrupt delivery guarantees
/// rather than just failing one operation.
#[track_caller]
pub fn fatal(message: impl Into<String>) -> ! {
    let message = message.into();
    tracing::error!(target: "logflow::fatal", "{message}");
    panic!("logflow: fatal invariant violation: {message}");
}
