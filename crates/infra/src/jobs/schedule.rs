//! Recurring producers (cleanup, daily analysis).

use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use marketpulse_core::NewJob;

use super::queue::QueueClient;
use super::worker::wait_for_stop;

/// Enqueues a fixed set of jobs every `interval`.
///
/// The first batch goes out one full interval after `spawn`. Several
/// processes running the same producer enqueue duplicates; handlers are
/// idempotent so that is harmless.
#[derive(Debug)]
pub struct PeriodicProducer {
    name: String,
    queue: QueueClient,
    interval: Duration,
    jobs: Vec<NewJob>,
}

impl PeriodicProducer {
    pub fn new(name: impl Into<String>, queue: QueueClient, interval: Duration) -> Self {
        Self {
            name: name.into(),
            queue,
            interval,
            jobs: Vec::new(),
        }
    }

    pub fn with_job(mut self, job: NewJob) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue every configured job once. Returns how many were accepted.
    pub fn tick(&self) -> usize {
        let mut enqueued = 0;
        for job in &self.jobs {
            match self.queue.submit(job.clone()) {
                Ok(id) => {
                    debug!(producer = %self.name, job_id = %id, job_type = %job.job_type, "scheduled job enqueued");
                    enqueued += 1;
                }
                Err(e) => {
                    error!(producer = %self.name, job_type = %job.job_type, error = %e, "failed to enqueue scheduled job");
                }
            }
        }
        enqueued
    }

    pub fn spawn(self) -> io::Result<ProducerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                info!(
                    producer = %self.name,
                    interval_secs = self.interval.as_secs(),
                    jobs = self.jobs.len(),
                    "periodic producer started"
                );
                while !wait_for_stop(&shutdown_rx, self.interval) {
                    self.tick();
                }
                info!(producer = %self.name, "periodic producer stopped");
            })?;

        Ok(ProducerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

#[derive(Debug)]
pub struct ProducerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ProducerHandle {
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
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use marketpulse_core::{JobKind, JobStatus};
    use std::time::Instant;

    #[test]
    fn tick_enqueues_each_job() {
        let store = InMemoryJobStore::arc();
        let producer = PeriodicProducer::new(
            "nightly",
            QueueClient::new(store.clone()),
            Duration::from_secs(3600),
        )
        .with_job(NewJob::of_kind(JobKind::Cleanup, serde_json::json!({})))
        .with_job(NewJob::of_kind(JobKind::DailyAnalysis, serde_json::json!({})));

        assert_eq!(producer.tick(), 2);
        assert_eq!(producer.tick(), 2);

        let pending = store.list(Some(JobStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 4);
        assert_eq!(
            pending.iter().filter(|j| j.job_type == "cleanup").count(),
            2
        );
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let store = InMemoryJobStore::arc();
        let producer = PeriodicProducer::new("bad", QueueClient::new(store), Duration::from_secs(1))
            .with_job(NewJob::new("", serde_json::json!({})))
            .with_job(NewJob::new("ok", serde_json::json!({})));
        assert_eq!(producer.tick(), 1);
    }

    #[test]
    fn spawned_producer_fires_on_interval() {
        let store = InMemoryJobStore::arc();
        let handle = PeriodicProducer::new(
            "fast",
            QueueClient::new(store.clone()),
            Duration::from_millis(10),
        )
        .with_job(NewJob::new("tick", serde_json::json!({})))
        .spawn()
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.list(None, 10).unwrap().len() < 2 {
            assert!(Instant::now() < deadline, "producer never fired twice");
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
    }
}
