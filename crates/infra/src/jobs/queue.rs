//! Producer-facing API over a [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use marketpulse_core::{JobId, JobKind, NewJob};

use super::store::{JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueueClientError {
    #[error("failed to serialize payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Enqueues jobs on behalf of producers (HTTP handlers, schedulers, other jobs).
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn JobStore>,
}

impl core::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueClient").finish_non_exhaustive()
    }
}

impl QueueClient {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a job of any type.
    ///
    /// `priority` outside `1..=10` and an empty `job_type` are rejected by the store.
    pub fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
        delay: Duration,
    ) -> Result<JobId, QueueClientError> {
        self.submit(
            NewJob::new(job_type, payload)
                .with_priority(priority)
                .delayed(delay),
        )
    }

    /// Enqueue a built-in job kind at its default priority.
    pub fn enqueue_kind(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<JobId, QueueClientError> {
        self.submit(NewJob::of_kind(kind, payload))
    }

    /// Enqueue a built-in job kind with a typed payload.
    pub fn enqueue_typed<P: serde::Serialize>(
        &self,
        kind: JobKind,
        payload: &P,
    ) -> Result<JobId, QueueClientError> {
        let payload = serde_json::to_value(payload)?;
        self.enqueue_kind(kind, payload)
    }

    pub fn submit(&self, job: NewJob) -> Result<JobId, QueueClientError> {
        let job_type = job.job_type.clone();
        let priority = job.priority;
        let id = self.store.enqueue(job)?;
        debug!(job_id = %id, job_type = %job_type, priority, "job enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use marketpulse_core::{CoreError, JobStatus, DEFAULT_PRIORITY};

    fn client() -> QueueClient {
        QueueClient::new(InMemoryJobStore::arc())
    }

    #[test]
    fn enqueue_stores_pending_job() {
        let client = client();
        let id = client
            .enqueue("custom", serde_json::json!({"x": 1}), 2, Duration::ZERO)
            .unwrap();

        let job = client.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 2);
        assert_eq!(job.payload["x"], 1);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn enqueue_kind_uses_kind_priority() {
        let client = client();
        let id = client
            .enqueue_kind(JobKind::Cleanup, serde_json::json!({}))
            .unwrap();
        let job = client.store().get(id).unwrap().unwrap();
        assert_eq!(job.job_type, "cleanup");
        assert_eq!(job.priority, JobKind::Cleanup.default_priority());
        assert_ne!(job.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn invalid_priority_is_rejected() {
        let err = client()
            .enqueue("custom", serde_json::json!({}), 0, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(
            err,
            QueueClientError::Store(JobStoreError::Invalid(CoreError::Validation(_)))
        ));
    }

    #[test]
    fn typed_payload_is_serialized() {
        #[derive(serde::Serialize)]
        struct Payload {
            source_id: u32,
        }

        let client = client();
        let id = client
            .enqueue_typed(JobKind::FeedFetch, &Payload { source_id: 7 })
            .unwrap();
        let job = client.store().get(id).unwrap().unwrap();
        assert_eq!(job.payload, serde_json::json!({"source_id": 7}));
    }
}
