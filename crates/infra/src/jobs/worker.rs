//! Worker loop: claim, dispatch, report.
//!
//! Each worker owns one OS thread and processes one job at a time. Workers
//! never coordinate with each other; the store's claim is the only
//! arbitration point, so any number of workers (threads here, or other
//! processes against the same Postgres table) can run side by side.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use marketpulse_core::{Job, JobId};

use super::dispatcher::{DispatchError, HandlerError, JobDispatcher};
use super::store::{JobStore, JobStoreError};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after an empty claim.
    pub poll_interval: Duration,
    /// Sleep after a store error.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Runtime statistics for one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// `complete`/`fail` found the job no longer `processing` (reaped meanwhile).
    pub lost_reports: u64,
    pub store_errors: u64,
    pub current_job: Option<JobId>,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.lost_reports += other.lost_reports;
        self.store_errors += other.store_errors;
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobId),
    Failed { job_id: JobId, error: String },
    /// The handler ran but the store no longer considered the job ours.
    Lost(JobId),
}

/// Claims and runs jobs from a store.
#[derive(Clone)]
pub struct Worker {
    name: String,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<JobDispatcher>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<JobDispatcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            dispatcher,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Spawn a worker on its own thread.
    pub fn spawn(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<JobDispatcher>,
        config: WorkerConfig,
    ) -> io::Result<WorkerHandle> {
        Self::new(name, store, dispatcher, config).start()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    /// Move this worker onto a dedicated thread.
    pub fn start(self) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let name = self.name.clone();

        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            // Dropped when the loop exits, which wakes `WorkerHandle::shutdown`.
            let _done = done_tx;
            self.run(shutdown_rx);
        })?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            done: done_rx,
            join: Some(join),
            stats,
        })
    }

    fn run(&self, shutdown_rx: mpsc::Receiver<()>) {
        info!(worker = %self.name, "worker started");

        loop {
            if stop_requested(&shutdown_rx) {
                break;
            }

            let pause = match self.process_next() {
                Ok(Some(_)) => continue,
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "job store error");
                    self.update_stats(|s| s.store_errors += 1);
                    self.config.error_backoff
                }
            };

            if wait_for_stop(&shutdown_rx, pause) {
                break;
            }
        }

        info!(worker = %self.name, "worker stopped");
    }

    /// Claim one job, run it and report the result.
    ///
    /// Returns `Ok(None)` when nothing is claimable.
    pub fn process_next(&self) -> Result<Option<JobOutcome>, JobStoreError> {
        let Some(job) = self.store.claim_next()? else {
            return Ok(None);
        };

        debug!(
            worker = %self.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "claimed job"
        );
        self.update_stats(|s| s.current_job = Some(job.id));

        let result = self.execute(&job);
        let outcome = self.report(&job, result);

        self.update_stats(|s| {
            s.current_job = None;
            s.processed += 1;
            match &outcome {
                Ok(JobOutcome::Completed(_)) => s.succeeded += 1,
                Ok(JobOutcome::Failed { .. }) => s.failed += 1,
                Ok(JobOutcome::Lost(_)) => s.lost_reports += 1,
                Err(_) => {}
            }
        });

        outcome.map(Some)
    }

    /// Run the handler, turning a panic into an ordinary failure.
    fn execute(&self, job: &Job) -> Result<(), DispatchError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch(job))) {
            Ok(result) => result,
            Err(payload) => Err(DispatchError::Handler(HandlerError::Transient(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            )))),
        }
    }

    fn report(
        &self,
        job: &Job,
        result: Result<(), DispatchError>,
    ) -> Result<JobOutcome, JobStoreError> {
        match result {
            Ok(()) => {
                if self.store.complete(job.id)? {
                    debug!(worker = %self.name, job_id = %job.id, "job completed");
                    Ok(JobOutcome::Completed(job.id))
                } else {
                    warn!(
                        worker = %self.name,
                        job_id = %job.id,
                        "job was no longer processing when completed; report dropped"
                    );
                    Ok(JobOutcome::Lost(job.id))
                }
            }
            Err(err) => {
                let error = err.to_string();
                let recorded = if err.is_permanent() {
                    self.store.fail_permanently(job.id, &error)?
                } else {
                    self.store.fail(job.id, &error)?
                };

                if !recorded {
                    warn!(
                        worker = %self.name,
                        job_id = %job.id,
                        error = %error,
                        "job was no longer processing when failed; report dropped"
                    );
                    return Ok(JobOutcome::Lost(job.id));
                }

                if err.is_permanent() || job.attempts >= job.max_attempts {
                    warn!(
                        worker = %self.name,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts = job.attempts,
                        error = %error,
                        "job failed permanently"
                    );
                } else {
                    warn!(
                        worker = %self.name,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        error = %error,
                        "job failed; will retry"
                    );
                }
                Ok(JobOutcome::Failed {
                    job_id: job.id,
                    error,
                })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Non-blocking shutdown check. A dropped handle counts as a stop request.
pub(crate) fn stop_requested(rx: &mpsc::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

/// Sleep for `pause`, waking early on shutdown. Returns `true` to stop.
pub(crate) fn wait_for_stop(rx: &mpsc::Receiver<()>, pause: Duration) -> bool {
    !matches!(rx.recv_timeout(pause), Err(RecvTimeoutError::Timeout))
}

/// Handle to control a running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    done: mpsc::Receiver<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stop claiming new jobs. The in-flight job, if any, keeps running.
    pub fn request_stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Stop the worker, waiting up to `grace` for the in-flight job.
    ///
    /// Returns `false` if the bound elapsed; the thread is then detached and
    /// its job is left `processing` for the reaper.
    pub fn shutdown(self, grace: Duration) -> bool {
        self.request_stop();
        self.wait_until(Instant::now() + grace)
    }

    fn wait_until(mut self, deadline: Instant) -> bool {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(remaining) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    worker = %self.name,
                    job_id = ?self.stats().current_job,
                    "worker did not stop within grace period; detaching"
                );
                self.join.take();
                false
            }
            _ => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                true
            }
        }
    }
}

/// A set of identical workers sharing one store and dispatcher.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `count` workers named `{prefix}-{n}`.
    pub fn spawn(
        prefix: &str,
        count: usize,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<JobDispatcher>,
        config: WorkerConfig,
    ) -> io::Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for n in 0..count {
            let handle = Worker::spawn(
                format!("{prefix}-{n}"),
                store.clone(),
                dispatcher.clone(),
                config.clone(),
            );
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => {
                    // Don't leak the ones already running.
                    Self { workers }.shutdown(Duration::ZERO);
                    return Err(e);
                }
            }
        }
        info!(workers = count, "worker pool started");
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn stats(&self) -> Vec<(String, WorkerStats)> {
        self.workers
            .iter()
            .map(|w| (w.name().to_string(), w.stats()))
            .collect()
    }

    /// Sum of all workers' counters.
    pub fn totals(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for w in &self.workers {
            total.merge(&w.stats());
        }
        total
    }

    /// Stop every worker; `grace` bounds the whole pool, not each worker.
    ///
    /// Returns how many workers had to be detached.
    pub fn shutdown(self, grace: Duration) -> usize {
        for w in &self.workers {
            w.request_stop();
        }
        let deadline = Instant::now() + grace;
        let detached = self
            .workers
            .into_iter()
            .map(|w| w.wait_until(deadline))
            .filter(|stopped| !stopped)
            .count();
        info!(detached, "worker pool stopped");
        detached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use marketpulse_core::{JobStatus, NewJob, RetryPolicy};

    fn store() -> Arc<InMemoryJobStore> {
        Arc::new(InMemoryJobStore::with_retry_policy(RetryPolicy::immediate()))
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        }
    }

    fn worker(store: &Arc<InMemoryJobStore>, dispatcher: JobDispatcher) -> Worker {
        Worker::new("test-worker", store.clone(), Arc::new(dispatcher), fast_config())
    }

    fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn successful_job_is_completed() {
        let store = store();
        let mut dispatcher = JobDispatcher::new();
        dispatcher.register("ok", |_job: &Job| Ok(()));
        let worker = worker(&store, dispatcher);

        let id = store.enqueue(NewJob::new("ok", serde_json::json!({}))).unwrap();
        assert_eq!(worker.process_next().unwrap(), Some(JobOutcome::Completed(id)));
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(worker.process_next().unwrap(), None);

        let stats = worker.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.succeeded, 1);
    }

    #[test]
    fn transient_failure_is_retried_and_permanent_is_not() {
        let store = store();
        let mut dispatcher = JobDispatcher::new();
        dispatcher
            .register("flaky", |_job: &Job| Err(HandlerError::transient("upstream 503")))
            .register("broken", |_job: &Job| Err(HandlerError::permanent("bad payload")));
        let worker = worker(&store, dispatcher);

        let flaky = store
            .enqueue(NewJob::new("flaky", serde_json::json!({})).with_priority(1))
            .unwrap();
        let broken = store.enqueue(NewJob::new("broken", serde_json::json!({}))).unwrap();

        worker.process_next().unwrap();
        let job = store.get(flaky).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.error_message.as_deref(), Some("upstream 503"));

        // The retried job is claimable again right away and outranks `broken`.
        worker.process_next().unwrap();
        assert_eq!(store.get(flaky).unwrap().unwrap().attempts, 2);

        worker.process_next().unwrap();
        worker.process_next().unwrap();
        let job = store.get(broken).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn handler_panic_is_reported_as_failure() {
        let store = store();
        let mut dispatcher = JobDispatcher::new();
        dispatcher.register("boom", |_job: &Job| -> Result<(), HandlerError> {
            panic!("kaboom")
        });
        let worker = worker(&store, dispatcher);

        let id = store.enqueue(NewJob::new("boom", serde_json::json!({}))).unwrap();
        let outcome = worker.process_next().unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { ref error, .. } if error.contains("kaboom")));
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Retry);
    }

    #[test]
    fn report_on_a_reaped_job_is_dropped() {
        let store = store();
        let inner = store.clone();
        let mut dispatcher = JobDispatcher::new();
        // Simulates the reaper finishing the job while the handler still runs.
        dispatcher.register("slow", move |job: &Job| {
            inner.fail(job.id, "reaped").map_err(|e| HandlerError::transient(e.to_string()))?;
            Ok(())
        });
        let worker = worker(&store, dispatcher);

        let id = store.enqueue(NewJob::new("slow", serde_json::json!({}))).unwrap();
        assert_eq!(worker.process_next().unwrap(), Some(JobOutcome::Lost(id)));
        assert_eq!(worker.stats().lost_reports, 1);
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Retry);
    }

    #[test]
    fn unknown_job_type_reaches_failed_through_worker_pool() {
        let store = store();
        let mut dispatcher = JobDispatcher::new();
        dispatcher.register("known", |_job: &Job| Ok(()));

        let pool = WorkerPool::spawn(
            "pool",
            2,
            store.clone(),
            Arc::new(dispatcher),
            fast_config(),
        )
        .unwrap();

        let id = store
            .enqueue(NewJob::new("mystery", serde_json::json!({})).with_max_attempts(3))
            .unwrap();
        wait_for("unknown job to fail", || {
            store.get(id).unwrap().unwrap().status == JobStatus::Failed
        });

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert!(job.error_message.unwrap().contains("no handler registered"));

        wait_for("worker stats", || pool.totals().failed == 3);
        assert_eq!(pool.shutdown(Duration::from_secs(2)), 0);
    }

    #[test]
    fn idle_worker_stops_within_grace() {
        let store = store();
        let handle = Worker::spawn(
            "idle",
            store,
            Arc::new(JobDispatcher::new()),
            WorkerConfig {
                poll_interval: Duration::from_secs(60),
                error_backoff: Duration::from_secs(60),
            },
        )
        .unwrap();
        assert!(handle.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn busy_worker_is_detached_after_grace() {
        let store = store();
        let mut dispatcher = JobDispatcher::new();
        dispatcher.register("sleepy", |_job: &Job| {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        let handle = Worker::spawn("busy", store.clone(), Arc::new(dispatcher), fast_config())
            .unwrap();

        let id = store.enqueue(NewJob::new("sleepy", serde_json::json!({}))).unwrap();
        wait_for("job to be claimed", || handle.stats().current_job == Some(id));

        assert!(!handle.shutdown(Duration::from_millis(20)));
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Processing);
    }
}
