//! Error taxonomy for the fan-out collector and the stream bridge.
//!
//! Errors fall into three groups:
//!
//! * `PreconditionError`: the operation could not even start (listing failed,
//!   invalid pool or buffer size). Always fatal to the caller.
//! * `EntityError`: one entity could not be fetched. Recorded in the
//!   collection and logged, never fatal to the batch.
//! * `BridgeError` / `StreamError`: a stage of the stream bridge failed.

use std::{fmt, time::Duration};

use thiserror::Error;

use super::types::EntityHandle;

/// Failure of a single call against the entity backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteCallError {
    /// The backend could not be reached at all.
    #[error("Backend unreachable: {0}")]
    Connectivity(String),

    /// The entity disappeared between listing and fetching.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// A failure worth retrying (timeouts on the backend side, busy resources).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The backend answered, but the payload could not be understood.
    #[error("Malformed response from {location}: {reason}")]
    Malformed { location: String, reason: String },
}

impl RemoteCallError {
    /// Whether a retrying client should attempt the call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteCallError::Transient(_))
    }
}

/// Errors that prevent an operation from starting.
#[derive(Error, Debug)]
pub enum PreconditionError {
    /// The initial entity listing failed.
    #[error("Failed to list entities: {0}")]
    Listing(#[source] RemoteCallError),

    /// A worker pool needs at least one slot.
    #[error("Invalid concurrency {0}: worker pool capacity must be greater than zero")]
    InvalidConcurrency(usize),

    /// The bridge channel needs at least one byte of buffer.
    #[error("Invalid buffer size {0}: bridge channel capacity must be greater than zero")]
    InvalidBufferSize(usize),
}

/// Which of the two per-entity calls produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Detail,
    Metrics,
}

impl fmt::Display for FetchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStage::Detail => write!(f, "detail"),
            FetchStage::Metrics => write!(f, "metrics"),
        }
    }
}

/// Failure to collect one entity. Every variant carries the entity handle.
#[derive(Error, Debug, Clone)]
pub enum EntityError {
    #[error("Failed to fetch {stage} for '{handle}': {source}")]
    Fetch {
        handle: EntityHandle,
        stage: FetchStage,
        #[source]
        source: RemoteCallError,
    },

    #[error("Fetch for '{handle}' timed out after {timeout:?}")]
    TimedOut {
        handle: EntityHandle,
        timeout: Duration,
    },

    #[error("Fetch for '{handle}' was cancelled")]
    Cancelled { handle: EntityHandle },

    #[error("Worker for '{handle}' panicked: {reason}")]
    WorkerPanicked { handle: EntityHandle, reason: String },
}

impl EntityError {
    /// Handle of the entity this error belongs to.
    pub fn handle(&self) -> &EntityHandle {
        match self {
            EntityError::Fetch { handle, .. }
            | EntityError::TimedOut { handle, .. }
            | EntityError::Cancelled { handle }
            | EntityError::WorkerPanicked { handle, .. } => handle,
        }
    }

    /// The failing call, when the error came from the backend.
    pub fn stage(&self) -> Option<FetchStage> {
        match self {
            EntityError::Fetch { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Failure inside one stage of a stream bridge.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// Reconciled failure of a stream bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Stream source failed: {0}")]
    Source(#[source] StreamError),

    #[error("Stream sink failed: {0}")]
    Sink(#[source] StreamError),

    #[error("Stream bridge was cancelled")]
    Cancelled,
}
