//! `cleanup`: deletes terminal jobs past the retention window.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use marketpulse_core::Job;

use crate::jobs::store::checked_cutoff;
use crate::jobs::{HandlerError, JobHandler, JobStore};

/// Largest accepted `retention_hours` override (ten years).
pub const MAX_RETENTION_HOURS: u64 = 10 * 365 * 24;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPayload {
    /// Overrides the configured retention for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_hours: Option<u64>,
}

pub struct CleanupHandler {
    store: Arc<dyn JobStore>,
    retention: Duration,
}

impl CleanupHandler {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self { store, retention }
    }
}

impl JobHandler for CleanupHandler {
    fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: CleanupPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::bad_payload(job, e))?;
        let retention = match payload.retention_hours {
            Some(hours) if hours > MAX_RETENTION_HOURS => {
                return Err(HandlerError::permanent(format!(
                    "retention_hours must be at most {MAX_RETENTION_HOURS}, got {hours}"
                )));
            }
            Some(hours) => Duration::from_secs(hours * 3600),
            None => self.retention,
        };

        let cutoff = checked_cutoff(self.store.now(), retention).ok_or_else(|| {
            HandlerError::permanent(format!(
                "retention of {}h reaches before the earliest representable time",
                retention.as_secs() / 3600
            ))
        })?;
        let purged = self
            .store
            .purge_terminal(cutoff)
            .map_err(|e| HandlerError::transient(e.to_string()))?;

        info!(job_id = %job.id, purged, retention_hours = retention.as_secs() / 3600, "terminal jobs purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use chrono::Utc;
    use marketpulse_core::{JobKind, ManualClock, NewJob, RetryPolicy};

    fn finished_job(store: &InMemoryJobStore) -> marketpulse_core::JobId {
        let id = store.enqueue(NewJob::new("t", serde_json::json!({}))).unwrap();
        store.claim_next().unwrap().unwrap();
        store.complete(id).unwrap();
        id
    }

    fn cleanup_job(payload: serde_json::Value) -> Job {
        Job::create(NewJob::of_kind(JobKind::Cleanup, payload), Utc::now()).unwrap()
    }

    #[test]
    fn purges_only_past_retention() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone(), RetryPolicy::default()));

        let old = finished_job(&store);
        clock.advance(chrono::Duration::hours(30));
        let recent = finished_job(&store);
        let pending = store.enqueue(NewJob::new("t", serde_json::json!({}))).unwrap();

        let handler = CleanupHandler::new(store.clone(), Duration::from_secs(24 * 3600));
        handler.handle(&cleanup_job(serde_json::json!({}))).unwrap();

        assert!(store.get(old).unwrap().is_none());
        assert!(store.get(recent).unwrap().is_some());
        assert!(store.get(pending).unwrap().is_some());
    }

    #[test]
    fn payload_overrides_retention() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone(), RetryPolicy::default()));
        let id = finished_job(&store);
        clock.advance(chrono::Duration::hours(2));

        let handler = CleanupHandler::new(store.clone(), Duration::from_secs(24 * 3600));
        handler.handle(&cleanup_job(serde_json::json!({}))).unwrap();
        assert!(store.get(id).unwrap().is_some());

        handler
            .handle(&cleanup_job(serde_json::json!({"retention_hours": 1})))
            .unwrap();
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn bad_retention_is_permanent() {
        let handler = CleanupHandler::new(InMemoryJobStore::arc(), Duration::from_secs(3600));
        let err = handler
            .handle(&cleanup_job(serde_json::json!({"retention_hours": "soon"})))
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn out_of_range_retention_is_permanent() {
        let store = InMemoryJobStore::arc();
        let handler = CleanupHandler::new(store.clone(), Duration::from_secs(3600));

        for hours in [MAX_RETENTION_HOURS + 1, 10_000_000_000, u64::MAX] {
            let err = handler
                .handle(&cleanup_job(serde_json::json!({"retention_hours": hours})))
                .unwrap_err();
            assert!(err.is_permanent(), "{hours}: {err}");
        }

        // The store is still usable afterwards.
        assert!(store.enqueue(NewJob::new("t", serde_json::json!({}))).is_ok());
    }
}
