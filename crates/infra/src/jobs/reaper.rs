//! Stuck-job reaper.
//!
//! A worker that dies mid-job (crash, kill, detached on shutdown) leaves its
//! row in `processing` forever. The reaper puts such rows back through the
//! ordinary failure path, so they retry or fail like any other failure and
//! still respect `max_attempts`.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::store::{checked_cutoff, JobStore, JobStoreError};
use super::worker::wait_for_stop;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often `spawn` runs a pass.
    pub interval: Duration,
    /// A `processing` job older than this is presumed abandoned.
    pub stuck_after: Duration,
    /// Maximum jobs recovered per pass.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stuck_after: Duration::from_secs(15 * 60),
            batch_size: 100,
        }
    }
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReapReport {
    pub examined: usize,
    /// Sent back to `retry`.
    pub retried: usize,
    /// Out of attempts; now terminal `failed`.
    pub failed: usize,
    /// Finished by their worker between the scan and the update.
    pub skipped: usize,
}

impl ReapReport {
    pub fn recovered(&self) -> usize {
        self.retried + self.failed
    }
}

pub struct Reaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
}

impl core::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reaper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Recover one batch of stuck jobs.
    pub fn run_once(&self) -> Result<ReapReport, JobStoreError> {
        let now = self.store.now();
        let Some(cutoff) = checked_cutoff(now, self.config.stuck_after) else {
            return Ok(ReapReport::default());
        };
        let stuck = self.store.find_stuck(cutoff, self.config.batch_size)?;

        let mut report = ReapReport {
            examined: stuck.len(),
            ..Default::default()
        };

        for job in stuck {
            let age = job
                .started_at
                .map(|t| (now - t).num_seconds())
                .unwrap_or_default();
            let message = format!(
                "stuck in processing for {age}s (limit {}s)",
                self.config.stuck_after.as_secs()
            );

            if !self.store.fail(job.id, &message)? {
                debug!(job_id = %job.id, "stuck job finished before it could be reaped");
                report.skipped += 1;
                continue;
            }

            // Same rule `fail` applies: the claim already counted this attempt.
            if job.attempts >= job.max_attempts {
                warn!(job_id = %job.id, job_type = %job.job_type, age_secs = age, "stuck job failed permanently");
                report.failed += 1;
            } else {
                info!(job_id = %job.id, job_type = %job.job_type, age_secs = age, "stuck job requeued");
                report.retried += 1;
            }
        }

        Ok(report)
    }

    /// Run a pass every `interval` on a dedicated thread.
    pub fn spawn(self) -> io::Result<ReaperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("job-reaper".to_string())
            .spawn(move || {
                info!(interval_secs = self.config.interval.as_secs(), "reaper started");
                loop {
                    match self.run_once() {
                        Ok(report) if report.examined > 0 => {
                            info!(
                                retried = report.retried,
                                failed = report.failed,
                                skipped = report.skipped,
                                "reaper pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "reaper pass failed"),
                    }
                    if wait_for_stop(&shutdown_rx, self.config.interval) {
                        break;
                    }
                }
                info!("reaper stopped");
            })?;

        Ok(ReaperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Handle to control a running reaper thread.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReaperHandle {
    /// Request shutdown and wait for the current pass to end.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::stats::StatsWindow;
    use crate::jobs::store::InMemoryJobStore;
    use marketpulse_core::{JobStatus, ManualClock, NewJob, RetryPolicy};
    use std::time::Instant;

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryJobStore>, Reaper) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(
            clock.clone(),
            RetryPolicy::immediate(),
        ));
        let reaper = Reaper::new(
            store.clone(),
            ReaperConfig {
                stuck_after: Duration::from_secs(15 * 60),
                ..Default::default()
            },
        );
        (clock, store, reaper)
    }

    #[test]
    fn fresh_claims_are_left_alone() {
        let (clock, store, reaper) = setup();
        store.enqueue(NewJob::new("t", serde_json::json!({}))).unwrap();
        store.claim_next().unwrap().unwrap();

        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(reaper.run_once().unwrap(), ReapReport::default());
    }

    #[test]
    fn stuck_job_is_requeued_and_reclaimable() {
        let (clock, store, reaper) = setup();
        let id = store.enqueue(NewJob::new("t", serde_json::json!({}))).unwrap();
        store.claim_next().unwrap().unwrap();

        clock.advance(chrono::Duration::minutes(16));
        let report = reaper.run_once().unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.recovered(), 1);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retry);
        assert!(job.error_message.unwrap().starts_with("stuck in processing for 960s"));

        let again = store.claim_next().unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn stuck_job_on_last_attempt_fails() {
        let (clock, store, reaper) = setup();
        let id = store
            .enqueue(NewJob::new("t", serde_json::json!({})).with_max_attempts(1))
            .unwrap();
        store.claim_next().unwrap().unwrap();

        clock.advance(chrono::Duration::hours(1));
        let report = reaper.run_once().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn unreachable_stuck_threshold_reaps_nothing() {
        let (clock, store, _) = setup();
        store.enqueue(NewJob::new("t", serde_json::json!({}))).unwrap();
        store.claim_next().unwrap().unwrap();
        clock.advance(chrono::Duration::days(365));

        let reaper = Reaper::new(
            store.clone(),
            ReaperConfig {
                stuck_after: Duration::from_secs(u64::MAX),
                ..Default::default()
            },
        );
        assert_eq!(reaper.run_once().unwrap(), ReapReport::default());
        assert_eq!(store.stats(StatsWindow::default()).unwrap().processing, 1);
    }

    #[test]
    fn batch_size_limits_one_pass() {
        let (clock, store, _) = setup();
        for _ in 0..5 {
            store.enqueue(NewJob::new("t", serde_json::json!({}))).unwrap();
            store.claim_next().unwrap().unwrap();
        }
        clock.advance(chrono::Duration::hours(1));

        let reaper = Reaper::new(
            store.clone(),
            ReaperConfig {
                batch_size: 3,
                ..Default::default()
            },
        );
        assert_eq!(reaper.run_once().unwrap().retried, 3);
        assert_eq!(reaper.run_once().unwrap().retried, 2);
        assert_eq!(reaper.run_once().unwrap().examined, 0);
    }

    #[test]
    fn spawned_reaper_shuts_down() {
        let (_, _, reaper) = setup();
        let handle = Reaper::new(
            reaper.store.clone(),
            ReaperConfig {
                interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
        .spawn()
        .unwrap();
        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
