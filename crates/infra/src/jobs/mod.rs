//! Durable job queue: stores, producers, workers and maintenance.
//!
//! ## Design
//!
//! - The store is the only point of coordination; `claim_next` is atomic
//! - Workers are independent peers and can live in separate processes
//! - Failures retry with backoff until `max_attempts`, then stay `failed`
//! - Jobs abandoned in `processing` are recovered by the reaper
//!
//! ## Components
//!
//! - `JobStore`: persistence with atomic claim (in-memory or Postgres)
//! - `QueueClient`: producer API
//! - `JobDispatcher`: `job_type` -> handler registry
//! - `Worker` / `WorkerPool`: claim, dispatch, report loop
//! - `Reaper`: recovers stuck jobs
//! - `PeriodicProducer`: recurring enqueues
//! - `QueueStats` / `diagnose`: operational view

pub mod dispatcher;
pub mod postgres;
pub mod queue;
pub mod reaper;
pub mod schedule;
pub mod stats;
pub mod store;
pub mod worker;

pub use dispatcher::{DispatchError, HandlerError, JobDispatcher, JobHandler};
pub use postgres::PostgresJobStore;
pub use queue::{QueueClient, QueueClientError};
pub use reaper::{ReapReport, Reaper, ReaperConfig, ReaperHandle};
pub use schedule::{PeriodicProducer, ProducerHandle};
pub use stats::{diagnose, HealthReport, HealthStatus, HealthThresholds, QueueStats, StatsWindow};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use worker::{JobOutcome, Worker, WorkerConfig, WorkerHandle, WorkerPool, WorkerStats};
