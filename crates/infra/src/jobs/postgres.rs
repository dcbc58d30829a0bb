//! Postgres-backed job store.
//!
//! ## Claim protocol
//!
//! `claim_next` is one statement: a sub-select picks the best-ranked
//! claimable row with `FOR UPDATE SKIP LOCKED` and the outer `UPDATE` flips it
//! to `processing`. Concurrent claimers skip rows another transaction has
//! locked instead of waiting on them, so N workers against M rows hand out
//! `min(N, M)` distinct jobs.
//!
//! `complete` is a conditional update guarded by `status = 'processing'`.
//! `fail` locks the row, applies the same transition logic as the in-memory
//! store (`Job::mark_failed`) using the database clock, and writes it back.
//! `JobStore::now` also reads the database clock, so reaper and cleanup
//! cutoffs compare against timestamps written by `NOW()`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Storage` |
//! | Database (check constraint violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous. The async sqlx calls are driven with the
//! stored `tokio::runtime::Handle`, so trait methods must be called from
//! threads that are not executing async tasks: worker threads, or
//! `tokio::task::spawn_blocking` from HTTP handlers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{instrument, warn, Span};

use marketpulse_core::{CoreError, Job, JobId, JobStatus, NewJob, RetryPolicy};

use super::stats::{QueueStats, StatsWindow};
use super::store::{JobStore, JobStoreError};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS job_queue (
        id UUID PRIMARY KEY,
        job_type VARCHAR(100) NOT NULL,
        priority INTEGER NOT NULL DEFAULT 5 CHECK (priority BETWEEN 1 AND 10),
        payload JSONB NOT NULL DEFAULT '{}',
        status VARCHAR(50) NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'retry')),
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
        error_message TEXT,
        scheduled_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        started_at TIMESTAMP WITH TIME ZONE,
        completed_at TIMESTAMP WITH TIME ZONE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        CHECK (attempts BETWEEN 0 AND max_attempts)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_queue_claimable
        ON job_queue (priority, scheduled_at, created_at)
        WHERE status IN ('pending', 'retry')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_queue_processing
        ON job_queue (started_at)
        WHERE status = 'processing'
    "#,
];

/// Postgres-backed job store; cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
    retry: RetryPolicy,
}

impl PostgresJobStore {
    /// Create a store on top of an existing pool.
    ///
    /// `runtime` drives the async queries behind the synchronous [`JobStore`] API.
    pub fn new(pool: PgPool, runtime: Handle, retry: RetryPolicy) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            retry,
        }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Create the `job_queue` table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, new), fields(job_type = %new.job_type, priority = new.priority), err)]
    pub async fn enqueue_job(&self, new: NewJob) -> Result<JobId, JobStoreError> {
        new.validate()?;
        let max_attempts = i32::try_from(new.max_attempts)
            .map_err(|_| CoreError::validation("max_attempts is out of range"))?;
        let id = JobId::new();

        sqlx::query(
            r#"
            INSERT INTO job_queue (
                id,
                job_type,
                priority,
                payload,
                status,
                attempts,
                max_attempts,
                scheduled_at,
                created_at
            )
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, NOW() + make_interval(secs => $6), NOW())
            "#,
        )
        .bind(*id.as_uuid())
        .bind(&new.job_type)
        .bind(new.priority)
        .bind(&new.payload)
        .bind(max_attempts)
        .bind(new.delay.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(id)
    }

    #[instrument(skip(self), fields(job_id = tracing::field::Empty), err)]
    pub async fn claim_job(&self) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_queue AS j
            SET status = 'processing',
                started_at = NOW(),
                completed_at = NULL,
                attempts = j.attempts + 1
            FROM (
                SELECT id
                FROM job_queue
                WHERE status IN ('pending', 'retry')
                  AND scheduled_at <= NOW()
                  AND attempts < max_attempts
                ORDER BY priority ASC, scheduled_at ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ) AS next_job
            WHERE j.id = next_job.id
            RETURNING j.id, j.job_type, j.payload, j.priority, j.status, j.attempts,
                      j.max_attempts, j.scheduled_at, j.started_at, j.completed_at,
                      j.error_message, j.created_at
            "#,
        )
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = JobRow::decode(&row)?;
        Span::current().record("job_id", tracing::field::display(job.id));
        Ok(Some(job))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn complete_job(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'completed',
                completed_at = NOW(),
                error_message = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(*job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    pub async fn fail_job(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError> {
        let retry = &self.retry;
        self.transition_processing(job_id, "fail", |job, now| {
            job.mark_failed(error, now, retry).map(|_| ())
        })
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    pub async fn fail_job_permanently(
        &self,
        job_id: JobId,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        self.transition_processing(job_id, "fail_permanently", |job, now| {
            job.mark_failed_permanently(error, now)
        })
        .await
    }

    /// Lock a `processing` row, apply `f` at database time, write it back.
    async fn transition_processing<F>(
        &self,
        job_id: JobId,
        operation: &str,
        f: F,
    ) -> Result<bool, JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), CoreError>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            SELECT id, job_type, payload, priority, status, attempts, max_attempts,
                   scheduled_at, started_at, completed_at, error_message, created_at,
                   NOW() AS db_now
            FROM job_queue
            WHERE id = $1 AND status = 'processing'
            FOR UPDATE
            "#,
        )
        .bind(*job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        };

        let now: DateTime<Utc> = row
            .try_get("db_now")
            .map_err(|e| JobStoreError::Corrupt(format!("failed to read db_now: {e}")))?;
        let mut job = JobRow::decode(&row)?;
        f(&mut job, now)?;

        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = $2,
                error_message = $3,
                scheduled_at = $4,
                completed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.error_message)
        .bind(job.scheduled_at)
        .bind(job.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    pub async fn db_now(&self) -> Result<DateTime<Utc>, JobStoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("now", e))
    }

    pub async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_type, payload, priority, status, attempts, max_attempts,
                   scheduled_at, started_at, completed_at, error_message, created_at
            FROM job_queue
            WHERE id = $1
            "#,
        )
        .bind(*job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(JobRow::decode).transpose()
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, payload, priority, status, attempts, max_attempts,
                   scheduled_at, started_at, completed_at, error_message, created_at
            FROM job_queue
            WHERE $1::TEXT IS NULL OR status = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(clamp_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(JobRow::decode).collect()
    }

    pub async fn find_stuck_jobs(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, payload, priority, status, attempts, max_attempts,
                   scheduled_at, started_at, completed_at, error_message, created_at
            FROM job_queue
            WHERE status = 'processing' AND started_at <= $1
            ORDER BY started_at ASC
            LIMIT $2
            "#,
        )
        .bind(started_before)
        .bind(clamp_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stuck", e))?;

        rows.iter().map(JobRow::decode).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn purge_terminal_jobs(
        &self,
        finished_before: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE status IN ('completed', 'failed')
              AND completed_at <= $1
            "#,
        )
        .bind(finished_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_terminal", e))?;

        Ok(result.rows_affected() as usize)
    }

    pub async fn collect_stats(&self, window: StatsWindow) -> Result<QueueStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'retry') AS retry,
                COUNT(*) FILTER (
                    WHERE status = 'processing'
                      AND started_at <= NOW() - make_interval(secs => $1)
                ) AS stuck,
                EXTRACT(EPOCH FROM NOW() - MIN(scheduled_at) FILTER (
                    WHERE status IN ('pending', 'retry') AND scheduled_at <= NOW()
                ))::BIGINT AS oldest_pending_age_secs,
                EXTRACT(EPOCH FROM NOW() - MIN(started_at) FILTER (
                    WHERE status = 'processing'
                ))::BIGINT AS oldest_processing_age_secs,
                COUNT(*) FILTER (
                    WHERE status = 'completed'
                      AND completed_at >= NOW() - make_interval(secs => $2)
                ) AS completed_recent,
                COUNT(*) FILTER (
                    WHERE status = 'failed'
                      AND completed_at >= NOW() - make_interval(secs => $2)
                ) AS failed_recent,
                NOW() AS sampled_at
            FROM job_queue
            "#,
        )
        .bind(window.stuck_after.as_secs_f64())
        .bind(window.throughput_window.as_secs_f64())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, JobStoreError> {
            row.try_get::<i64, _>(name)
                .map(|n| n.max(0) as usize)
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read {name}: {e}")))
        };
        let age = |name: &str| -> Result<Option<i64>, JobStoreError> {
            row.try_get::<Option<i64>, _>(name)
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read {name}: {e}")))
        };

        let mut stats = QueueStats {
            pending: count("pending")?,
            processing: count("processing")?,
            completed: count("completed")?,
            failed: count("failed")?,
            retry: count("retry")?,
            stuck: count("stuck")?,
            oldest_pending_age_secs: age("oldest_pending_age_secs")?,
            oldest_processing_age_secs: age("oldest_processing_age_secs")?,
            attempts_distribution: BTreeMap::new(),
            completed_recent: count("completed_recent")?,
            failed_recent: count("failed_recent")?,
            throughput_window_secs: window.throughput_window.as_secs(),
            sampled_at: row.try_get("sampled_at").ok(),
        };

        let buckets = sqlx::query(
            r#"
            SELECT attempts, COUNT(*) AS jobs
            FROM job_queue
            GROUP BY attempts
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats_attempts", e))?;

        for bucket in buckets {
            let attempts: i32 = bucket
                .try_get("attempts")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read attempts: {e}")))?;
            let jobs: i64 = bucket
                .try_get("jobs")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read jobs: {e}")))?;
            stats
                .attempts_distribution
                .insert(attempts.max(0) as u32, jobs.max(0) as usize);
        }

        Ok(stats)
    }
}

impl JobStore for PostgresJobStore {
    fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        self.block_on(self.enqueue_job(job))
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.claim_job())
    }

    fn complete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.block_on(self.complete_job(job_id))
    }

    fn fail(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError> {
        self.block_on(self.fail_job(job_id, error))
    }

    fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<bool, JobStoreError> {
        self.block_on(self.fail_job_permanently(job_id, error))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.fetch_job(job_id))
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.list_jobs(status, limit))
    }

    fn find_stuck(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.find_stuck_jobs(started_before, limit))
    }

    fn purge_terminal(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        self.block_on(self.purge_terminal_jobs(finished_before))
    }

    fn stats(&self, window: StatsWindow) -> Result<QueueStats, JobStoreError> {
        self.block_on(self.collect_stats(window))
    }

    fn now(&self) -> DateTime<Utc> {
        self.block_on(self.db_now()).unwrap_or_else(|e| {
            warn!(error = %e, "database clock unavailable, using local clock");
            Utc::now()
        })
    }
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
        let parsed = <JobRow as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row)
            .map_err(|e| JobStoreError::Corrupt(format!("failed to deserialize job row: {e}")))?;
        Job::try_from(parsed)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Corrupt(format!("job {}: {e}", row.id)))?;
        let non_negative = |name: &str, v: i32| {
            u32::try_from(v)
                .map_err(|_| JobStoreError::Corrupt(format!("job {}: negative {name}", row.id)))
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            attempts: non_negative("attempts", row.attempts)?,
            max_attempts: non_negative("max_attempts", row.max_attempts)?,
            job_type: row.job_type,
            payload: row.payload,
            priority: row.priority,
            status,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => JobStoreError::Invalid(CoreError::Validation(msg)),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    //! These run against a disposable database:
    //! `DATABASE_URL=postgres://… cargo test -p marketpulse-infra -- --ignored`

    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn setup() -> Option<(tokio::runtime::Runtime, PostgresJobStore)> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let pool = runtime
            .block_on(
                sqlx::postgres::PgPoolOptions::new()
                    .max_connections(16)
                    .connect(&url),
            )
            .expect("connect");
        let store = PostgresJobStore::new(pool, runtime.handle().clone(), RetryPolicy::immediate());
        runtime.block_on(store.ensure_schema()).expect("schema");
        runtime
            .block_on(sqlx::query("TRUNCATE job_queue").execute(&*store.pool))
            .expect("truncate");
        Some((runtime, store))
    }

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn postgres_queue_contract() {
        let Some((_runtime, store)) = setup() else {
            return;
        };

        // Priority order, FIFO within a band.
        let a = store.enqueue(NewJob::new("t", serde_json::json!({})).with_priority(5)).unwrap();
        let b = store.enqueue(NewJob::new("t", serde_json::json!({})).with_priority(1)).unwrap();
        let c = store.enqueue(NewJob::new("t", serde_json::json!({})).with_priority(5)).unwrap();
        let order: Vec<JobId> = (0..3).map(|_| store.claim_next().unwrap().unwrap().id).collect();
        assert_eq!(order, vec![b, a, c]);

        // Idempotent complete.
        assert!(store.complete(a).unwrap());
        assert!(!store.complete(a).unwrap());

        // Retry bound.
        let r = store
            .enqueue(NewJob::new("t", serde_json::json!({})).with_max_attempts(2))
            .unwrap();
        assert_eq!(store.claim_next().unwrap().unwrap().id, r);
        assert!(store.fail(r, "first").unwrap());
        assert_eq!(store.get(r).unwrap().unwrap().status, JobStatus::Retry);
        assert_eq!(store.claim_next().unwrap().unwrap().id, r);
        assert!(store.fail(r, "second").unwrap());
        let failed = store.get(r).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 2);

        // Delay honored.
        store
            .enqueue(
                NewJob::new("t", serde_json::json!({}))
                    .with_priority(1)
                    .delayed(std::time::Duration::from_secs(60)),
            )
            .unwrap();
        assert!(store.claim_next().unwrap().is_none());

        // Cutoffs use the database clock that stamped started_at.
        let db_now = store.now();
        assert_eq!(store.find_stuck(db_now, 10).unwrap().len(), 2);

        // Both stores bound max_attempts the same way.
        let err = store
            .enqueue(NewJob::new("t", serde_json::json!({})).with_max_attempts(3_000_000_000))
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Invalid(CoreError::Validation(_))));

        let stats = store.stats(StatsWindow::default()).unwrap();
        assert_eq!(stats.processing, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn postgres_concurrent_claims_are_exclusive() {
        let Some((_runtime, store)) = setup() else {
            return;
        };
        const JOBS: usize = 20;
        const CLAIMERS: usize = 32;

        for _ in 0..JOBS {
            store.enqueue(NewJob::new("t", serde_json::json!({}))).unwrap();
        }

        let barrier = Arc::new(Barrier::new(CLAIMERS));
        let handles: Vec<_> = (0..CLAIMERS)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.claim_next().unwrap().map(|j| j.id)
                })
            })
            .collect();

        let claimed: Vec<JobId> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        let distinct: HashSet<_> = claimed.iter().collect();
        assert_eq!(claimed.len(), JOBS);
        assert_eq!(distinct.len(), JOBS);
    }
}
