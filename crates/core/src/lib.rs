//! `marketpulse-core`: job queue domain model.
//!
//! This crate contains the **pure** parts of the queue: the job record, its
//! status DAG, the retry/backoff policy and the clock abstraction. Storage,
//! workers and I/O live in `marketpulse-infra`.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::JobId;
pub use job::{
    Job, JobKind, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, MAX_ATTEMPTS_LIMIT,
    MAX_DELAY, MAX_PRIORITY, MIN_PRIORITY,
};
pub use retry::{BackoffStrategy, RetryPolicy};
