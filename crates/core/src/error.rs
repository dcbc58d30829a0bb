//! Core error model.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Deterministic failures of the job model (validation, illegal transitions).
///
/// Storage and runtime failures belong to `marketpulse-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. priority out of range).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status string did not match any known status.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// A status change that is not an edge of the job lifecycle DAG.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
