//! Error taxonomy for the overseer core.
//!
//! Only store unavailability and reasoning-call failure propagate as
//! run-level failures; budget exhaustion, worker failure, missing markers,
//! and join timeouts are recoverable degradations absorbed by the core.

use crate::ids::{GroupId, RunId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),
    #[error("invalid budget: {0}")]
    InvalidBudget(String),
    #[error("reasoning failed: {0}")]
    ReasoningFailed(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Convenience result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
