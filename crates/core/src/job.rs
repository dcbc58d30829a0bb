//! The job record and its lifecycle.
//!
//! ```text
//! pending ──► processing ──► completed
//!                │   ▲
//!                │   └────── retry ──► failed
//!                └─────────────────────► failed
//! ```
//!
//! Every mutation goes through the `mark_*` methods below so that in-memory
//! and SQL-backed stores apply identical transition rules.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::JobId;
use crate::retry::RetryPolicy;

/// Lowest (most urgent) priority value.
pub const MIN_PRIORITY: i32 = 1;
/// Highest (least urgent) priority value.
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Largest accepted `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 100;
/// Longest accepted enqueue delay, and ceiling for retry backoff settings.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Finished successfully (terminal)
    Completed,
    /// Attempts exhausted or permanently rejected (terminal)
    Failed,
    /// Failed at least once, claimable again once `scheduled_at` passes
    Retry,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retry => "retry",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `retry` rows are treated as re-pending.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retry)
    }

    /// Whether `self -> next` is an edge of the lifecycle DAG.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Retry, Processing)
                | (Processing, Completed)
                | (Processing, Retry)
                | (Processing, Failed)
                | (Retry, Failed)
        )
    }

    fn ensure_transition(&self, next: JobStatus) -> CoreResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::IllegalTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retry" => Ok(JobStatus::Retry),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Job types the dashboard ships handlers for.
///
/// The queue itself stays string-keyed; this enum names the built-ins so
/// producers don't scatter string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FeedFetch,
    ContentProcess,
    DailyAnalysis,
    PredictionComparison,
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::FeedFetch,
        JobKind::ContentProcess,
        JobKind::DailyAnalysis,
        JobKind::PredictionComparison,
        JobKind::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FeedFetch => "feed_fetch",
            JobKind::ContentProcess => "content_process",
            JobKind::DailyAnalysis => "daily_analysis",
            JobKind::PredictionComparison => "prediction_comparison",
            JobKind::Cleanup => "cleanup",
        }
    }

    /// Default priority a producer should use for this kind.
    ///
    /// Housekeeping yields to user-visible freshness work.
    pub fn default_priority(&self) -> i32 {
        match self {
            JobKind::FeedFetch => 3,
            JobKind::ContentProcess => 4,
            JobKind::DailyAnalysis => 5,
            JobKind::PredictionComparison => 6,
            JobKind::Cleanup => 9,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        JobKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enqueue request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Delay before the job first becomes claimable.
    pub delay: Duration,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn of_kind(kind: JobKind, payload: serde_json::Value) -> Self {
        Self::new(kind.as_str(), payload).with_priority(kind.default_priority())
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(CoreError::validation("job_type must not be empty"));
        }
        if self.job_type.len() > 100 {
            return Err(CoreError::validation("job_type must be at most 100 characters"));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(CoreError::validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::validation("max_attempts must be at least 1"));
        }
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(CoreError::validation(format!(
                "max_attempts must be at most {MAX_ATTEMPTS_LIMIT}, got {}",
                self.max_attempts
            )));
        }
        if self.delay > MAX_DELAY {
            return Err(CoreError::validation(format!(
                "delay must be at most {}s, got {}s",
                MAX_DELAY.as_secs(),
                self.delay.as_secs()
            )));
        }
        Ok(())
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Lower value is claimed first.
    pub priority: i32,
    pub status: JobStatus,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest instant at which the job is claimable.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Materialize an enqueue request at `now`.
    pub fn create(new: NewJob, now: DateTime<Utc>) -> CoreResult<Self> {
        new.validate()?;
        let scheduled_at = chrono::Duration::from_std(new.delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| CoreError::validation("delay is out of range"))?;

        Ok(Self {
            id: JobId::new(),
            job_type: new.job_type,
            payload: new.payload,
            priority: new.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            scheduled_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
        })
    }

    pub fn kind(&self) -> Option<JobKind> {
        JobKind::parse(&self.job_type)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at <= now && self.attempts < self.max_attempts
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Claim: `pending|retry -> processing`, counting one attempt.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.status.ensure_transition(JobStatus::Processing)?;
        if self.attempts >= self.max_attempts {
            return Err(CoreError::validation(format!(
                "job {} has no attempts left ({}/{})",
                self.id, self.attempts, self.max_attempts
            )));
        }
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.completed_at = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.status.ensure_transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.error_message = None;
        Ok(())
    }

    /// Handler failure: back to `retry` with a backoff delay while attempts
    /// remain, otherwise terminal `failed`. Returns the new status.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> CoreResult<JobStatus> {
        if self.status != JobStatus::Processing {
            return Err(CoreError::IllegalTransition {
                from: self.status,
                to: JobStatus::Retry,
            });
        }
        self.error_message = Some(error.into());

        if self.attempts < self.max_attempts {
            self.status = JobStatus::Retry;
            // Saturate rather than overflow on absurd backoff settings.
            self.scheduled_at = now
                .checked_add_signed(policy.chrono_delay(self.attempts, self.id.salt()))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        }
        Ok(self.status)
    }

    /// `processing -> failed` without consuming remaining attempts.
    pub fn mark_failed_permanently(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.status.ensure_transition(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// Processing since before `cutoff`.
    pub fn is_stuck(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.started_at.is_some_and(|t| t <= cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn new_job() -> Job {
        Job::create(
            NewJob::new("feed_fetch", serde_json::json!({"feed_id": 1})).with_max_attempts(3),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "done".parse::<JobStatus>(),
            Err(CoreError::UnknownStatus(s)) if s == "done"
        ));
    }

    #[test]
    fn lifecycle_dag_has_only_documented_edges() {
        use JobStatus::*;
        let legal = [
            (Pending, Processing),
            (Retry, Processing),
            (Processing, Completed),
            (Processing, Retry),
            (Processing, Failed),
            (Retry, Failed),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn validation_rejects_out_of_range_priority() {
        let err = NewJob::new("cleanup", serde_json::json!({}))
            .with_priority(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(msg) if msg.contains("priority")));

        assert!(NewJob::new("cleanup", serde_json::json!({})).with_priority(11).validate().is_err());
        assert!(NewJob::new("", serde_json::json!({})).validate().is_err());
        assert!(NewJob::new("x", serde_json::json!({})).with_max_attempts(0).validate().is_err());
    }

    #[test]
    fn validation_bounds_delay_and_attempts() {
        let huge = NewJob::new("t", serde_json::json!({})).delayed(Duration::from_secs(10_000_000_000_000));
        assert!(matches!(huge.validate(), Err(CoreError::Validation(msg)) if msg.contains("delay")));
        assert!(Job::create(huge, Utc::now()).is_err());

        assert!(NewJob::new("t", serde_json::json!({})).delayed(MAX_DELAY).validate().is_ok());
        assert!(NewJob::new("t", serde_json::json!({}))
            .delayed(MAX_DELAY + Duration::from_secs(1))
            .validate()
            .is_err());

        assert!(NewJob::new("t", serde_json::json!({}))
            .with_max_attempts(MAX_ATTEMPTS_LIMIT)
            .validate()
            .is_ok());
        assert!(NewJob::new("t", serde_json::json!({}))
            .with_max_attempts(3_000_000_000)
            .validate()
            .is_err());
    }

    #[test]
    fn absurd_backoff_saturates_instead_of_overflowing() {
        let mut job = new_job();
        let now = Utc::now();
        let policy = RetryPolicy::fixed(Duration::from_secs(10_000_000_000_000));

        job.mark_processing(now).unwrap();
        assert_eq!(job.mark_failed("boom", now, &policy).unwrap(), JobStatus::Retry);
        assert_eq!(job.scheduled_at, DateTime::<Utc>::MAX_UTC);
        assert!(!job.is_claimable(now));
    }

    #[test]
    fn delay_pushes_scheduled_at() {
        let now = Utc::now();
        let job = Job::create(
            NewJob::new("daily_analysis", serde_json::json!({})).delayed(Duration::from_secs(60)),
            now,
        )
        .unwrap();

        assert_eq!(job.scheduled_at, now + ChronoDuration::seconds(60));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn failure_retries_until_attempts_exhausted() {
        let mut job = new_job();
        let policy = RetryPolicy::immediate();
        let now = Utc::now();

        let mut seen = vec![job.status];
        for _ in 0..3 {
            job.mark_processing(now).unwrap();
            seen.push(job.status);
            job.mark_failed("boom", now, &policy).unwrap();
            seen.push(job.status);
        }

        use JobStatus::*;
        assert_eq!(
            seen,
            vec![Pending, Processing, Retry, Processing, Retry, Processing, Failed]
        );
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.completed_at.is_some());
        assert!(job.mark_processing(now).is_err());
    }

    #[test]
    fn retry_keeps_priority_and_moves_scheduled_at() {
        let mut job = new_job();
        let priority = job.priority;
        let now = Utc::now();
        let policy = RetryPolicy::fixed(Duration::from_secs(30));

        job.mark_processing(now).unwrap();
        assert_eq!(job.mark_failed("timeout", now, &policy).unwrap(), JobStatus::Retry);
        assert_eq!(job.priority, priority);
        assert_eq!(job.scheduled_at, now + ChronoDuration::seconds(30));
        assert!(!job.is_claimable(now));
    }

    #[test]
    fn completing_twice_is_rejected() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_processing(now).unwrap();
        job.mark_completed(now).unwrap();
        assert!(matches!(
            job.mark_completed(now),
            Err(CoreError::IllegalTransition { from: JobStatus::Completed, .. })
        ));
    }

    #[test]
    fn permanent_failure_skips_remaining_attempts() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_processing(now).unwrap();
        job.mark_failed_permanently("bad payload", now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn kind_lookup() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("does_not_exist"), None);
    }
}
