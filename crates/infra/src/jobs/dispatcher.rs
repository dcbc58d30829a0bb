//! Job-type registry: routes a claimed job to its handler.

use std::collections::HashMap;
use std::sync::Arc;

use marketpulse_core::{Job, JobKind};

/// Error returned by a [`JobHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (network hiccup, collaborator down).
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help (malformed payload); skips remaining attempts.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Payload did not match the handler's expected shape.
    pub fn bad_payload(job: &Job, err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid {} payload: {err}", job.job_type))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Runs one job type.
///
/// Delivery is at-least-once: a job can run again after a lost report or a
/// reaped claim, so handlers must tolerate re-execution.
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&Job) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        self(job)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for job type '{0}'")]
    UnknownJobType(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl DispatchError {
    /// Whether the job should skip its remaining attempts.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Handler(e) if e.is_permanent())
    }
}

/// Maps `job_type` strings to handlers.
#[derive(Clone, Default)]
pub struct JobDispatcher {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl core::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl JobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn register_kind<H>(&mut self, kind: JobKind, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.register(kind.as_str(), handler)
    }

    pub fn register_shared(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn handles(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| DispatchError::UnknownJobType(job.job_type.clone()))?;
        handler.handle(job)?;
        Ok(())
    }
}
