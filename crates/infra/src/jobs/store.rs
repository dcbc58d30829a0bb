//! Job storage: the single synchronization point for all workers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use marketpulse_core::{Clock, CoreError, Job, JobId, JobStatus, NewJob, RetryPolicy, SystemClock};

use super::stats::{QueueStats, StatsWindow};

/// Job store abstraction.
///
/// Every method is one atomic unit with respect to concurrent callers.
/// `claim_next` is the only operation that may move a job into
/// `processing`; `complete`/`fail` only act on jobs still `processing`.
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job.
    fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Atomically claim the best-ranked claimable job.
    ///
    /// Order: priority asc, scheduled_at asc, created_at asc, enqueue order.
    /// Returns `None` when nothing is claimable (not an error).
    fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// `processing -> completed`. `false` when the job is not processing.
    fn complete(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Record a failed attempt: `retry` (with backoff) while attempts remain,
    /// terminal `failed` otherwise. `false` when the job is not processing.
    fn fail(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError>;

    /// `processing -> failed` regardless of remaining attempts.
    fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// List jobs (oldest first), optionally filtered by status.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// `processing` jobs claimed at or before `started_before`, oldest claim first.
    fn find_stuck(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Delete terminal jobs that finished at or before `finished_before`.
    fn purge_terminal(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Aggregate statistics (non-locking for SQL stores).
    fn stats(&self, window: StatsWindow) -> Result<QueueStats, JobStoreError>;

    /// The store's notion of "now".
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("invalid job: {0}")]
    Invalid(#[from] CoreError),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next()
    }

    fn complete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).complete(job_id)
    }

    fn fail(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError> {
        (**self).fail(job_id, error)
    }

    fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError> {
        (**self).fail_permanently(job_id, error)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(status, limit)
    }

    fn find_stuck(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_stuck(started_before, limit)
    }

    fn purge_terminal(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).purge_terminal(finished_before)
    }

    fn stats(&self, window: StatsWindow) -> Result<QueueStats, JobStoreError> {
        (**self).stats(window)
    }

    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

#[derive(Debug)]
struct Entry {
    /// Enqueue order, breaks ties between jobs enqueued in the same instant.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

/// In-memory job store for tests/dev and single-process deployments.
///
/// All mutations run under one write guard, so the claim is a single-writer
/// arbitration: two callers can never observe the same job as claimable.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), RetryPolicy::default())
    }

    pub fn with_clock(clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
            retry,
        }
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self::with_clock(Arc::new(SystemClock), retry)
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    /// Apply `f` to a job that is still `processing`; `false` otherwise.
    fn with_processing<F>(&self, job_id: JobId, f: F) -> Result<bool, JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), CoreError>,
    {
        let mut inner = self.write()?;
        let now = self.clock.now();
        match inner.jobs.get_mut(&job_id) {
            Some(entry) if entry.job.status == JobStatus::Processing => {
                f(&mut entry.job, now)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let job = Job::create(job, self.clock.now())?;
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, Entry { seq, job });
        Ok(id)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;
        let now = self.clock.now();

        let next = inner
            .jobs
            .values()
            .filter(|e| e.job.is_claimable(now))
            .min_by_key(|e| (e.job.priority, e.job.scheduled_at, e.job.created_at, e.seq))
            .map(|e| e.job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        match inner.jobs.get_mut(&job_id) {
            Some(entry) => {
                entry.job.mark_processing(now)?;
                Ok(Some(entry.job.clone()))
            }
            None => Ok(None),
        }
    }

    fn complete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.with_processing(job_id, |job, now| job.mark_completed(now))
    }

    fn fail(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError> {
        let retry = &self.retry;
        self.with_processing(job_id, |job, now| {
            job.mark_failed(error, now, retry).map(|_| ())
        })
    }

    fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError> {
        self.with_processing(job_id, |job, now| job.mark_failed_permanently(error, now))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut entries: Vec<_> = inner
            .jobs
            .values()
            .filter(|e| status.is_none_or(|s| e.job.status == s))
            .collect();

        entries.sort_by_key(|e| (e.job.created_at, e.seq));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }

    fn find_stuck(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut stuck: Vec<_> = inner
            .jobs
            .values()
            .filter(|e| e.job.is_stuck(started_before))
            .map(|e| e.job.clone())
            .collect();

        stuck.sort_by_key(|j| j.started_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    fn purge_terminal(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut inner = self.write()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, e| {
            !(e.job.status.is_terminal() && e.job.completed_at.is_some_and(|t| t <= finished_before))
        });
        Ok(before - inner.jobs.len())
    }

    fn stats(&self, window: StatsWindow) -> Result<QueueStats, JobStoreError> {
        let inner = self.read()?;
        let now = self.clock.now();
        // An unrepresentable cutoff means nothing is old enough / everything is recent.
        let stuck_cutoff = checked_cutoff(now, window.stuck_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recent_cutoff =
            checked_cutoff(now, window.throughput_window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut stats = QueueStats {
            throughput_window_secs: window.throughput_window.as_secs(),
            sampled_at: Some(now),
            ..Default::default()
        };
        let mut oldest_due: Option<DateTime<Utc>> = None;
        let mut oldest_claim: Option<DateTime<Utc>> = None;

        for Entry { job, .. } in inner.jobs.values() {
            *stats.count_mut(job.status) += 1;
            *stats.attempts_distribution.entry(job.attempts).or_default() += 1;

            match job.status {
                JobStatus::Pending | JobStatus::Retry if job.scheduled_at <= now => {
                    oldest_due = Some(oldest_due.map_or(job.scheduled_at, |t| t.min(job.scheduled_at)));
                }
                JobStatus::Processing => {
                    if let Some(started) = job.started_at {
                        oldest_claim = Some(oldest_claim.map_or(started, |t| t.min(started)));
                    }
                    if job.is_stuck(stuck_cutoff) {
                        stats.stuck += 1;
                    }
                }
                JobStatus::Completed if job.completed_at.is_some_and(|t| t >= recent_cutoff) => {
                    stats.completed_recent += 1;
                }
                JobStatus::Failed if job.completed_at.is_some_and(|t| t >= recent_cutoff) => {
                    stats.failed_recent += 1;
                }
                _ => {}
            }
        }

        stats.oldest_pending_age_secs = oldest_due.map(|t| (now - t).num_seconds());
        stats.oldest_processing_age_secs = oldest_claim.map(|t| (now - t).num_seconds());
        Ok(stats)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// `now - age`, or `None` when that instant is not representable.
pub(crate) fn checked_cutoff(now: DateTime<Utc>, age: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}
