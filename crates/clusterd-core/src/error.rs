//! Error types for the worker pool.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure of the supervisor, dispatcher and
//! workers.
//!
//! ## Error Cases
//! - `Startup`: The pool could not bring every worker to `Ready`. Fatal.
//! - `NoCapacity`: No worker is eligible to take a new connection. The caller
//!   must reject or back off.
//! - `DrainTimeoutExceeded`: A draining worker did not finish in time and was
//!   force-terminated. Logged, never fatal.
//! - `PoolDegraded`: The crash-loop guard suspended a slot. The pool keeps
//!   serving with the remaining workers.
//! - `ChannelError`: A control or connection channel to a worker is closed.
//! - `ServiceShutdown`: The pool is shutting down.

use crate::pool::WorkerId;
use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the worker pool.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The pool failed to launch; every spawned worker has been stopped.
    #[error("Startup error: {reason}")]
    Startup { reason: String },

    /// No worker is `Ready` or `Busy`.
    #[error("No worker has capacity for a new connection")]
    NoCapacity,

    /// A draining worker kept in-flight work past the drain timeout.
    #[error("Worker {id} did not drain within {timeout:?}")]
    DrainTimeoutExceeded { id: WorkerId, timeout: Duration },

    /// A slot crashed too often and is no longer respawned.
    #[error("Worker {id} exited more than {limit} times within {window:?}; respawning suspended")]
    PoolDegraded {
        id: WorkerId,
        limit: usize,
        window: Duration,
    },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The pool is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub(crate) fn startup(reason: impl Into<String>) -> Self {
        Self::Startup {
            reason: reason.into(),
        }
    }
}
