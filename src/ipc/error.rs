//! Error types for the worker bridge.

use std::time::Duration;

use thiserror::Error;

/// IPC-specific error types.
///
/// Every failed call surfaces exactly one of these. Framing problems and
/// responses for unknown correlation ids are recovered inside the bridge
/// and never reach a caller.
#[derive(Debug, Error)]
pub enum IpcError {
    /// No live worker process to send the request to.
    #[error("No worker process available")]
    NoProcess,

    /// No response arrived before the request deadline.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The worker answered with an explicit `error` field.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Protocol-level error (encoding, malformed response shape).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Parameters could not be flattened into the request envelope.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Too many requests are already waiting for a response.
    #[error("Too many requests in flight (limit {0})")]
    Overloaded(usize),

    /// The worker exited while the request was in flight.
    #[error("Worker process exited before responding")]
    WorkerCrashed,

    /// The supervisor was stopped while the request was in flight.
    #[error("Bridge is shutting down")]
    Shutdown,

    /// `start()` was called on a supervisor that is already running.
    #[error("Supervisor already started")]
    AlreadyStarted,

    /// The supervisor has not been started (or has been stopped).
    #[error("Supervisor not started")]
    NotStarted,

    /// Failed to spawn the worker process.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl IpcError {
    /// True when the request ran out its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout(_))
    }

    /// True when the failure was reported by the worker itself.
    pub fn is_worker_error(&self) -> bool {
        matches!(self, IpcError::Worker(_))
    }
}
