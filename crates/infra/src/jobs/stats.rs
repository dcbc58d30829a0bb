//! Read-only queue statistics and health diagnostics.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use marketpulse_core::JobStatus;

/// Parameters for the time-based parts of [`QueueStats`].
#[derive(Debug, Clone, Copy)]
pub struct StatsWindow {
    /// A `processing` job older than this counts as stuck.
    pub stuck_after: Duration,
    /// Window for the completed/failed throughput sample.
    pub throughput_window: Duration,
}

impl Default for StatsWindow {
    fn default() -> Self {
        Self {
            stuck_after: Duration::from_secs(15 * 60),
            throughput_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Snapshot of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retry: usize,
    /// `processing` jobs older than `StatsWindow::stuck_after`.
    pub stuck: usize,
    /// Longest time a due (`pending`/`retry`, `scheduled_at <= now`) job has been waiting.
    pub oldest_pending_age_secs: Option<i64>,
    /// Age of the oldest `processing` claim.
    pub oldest_processing_age_secs: Option<i64>,
    /// attempts -> number of jobs.
    pub attempts_distribution: BTreeMap<u32, usize>,
    /// Jobs completed within the throughput window.
    pub completed_recent: usize,
    /// Jobs that reached terminal `failed` within the throughput window.
    pub failed_recent: usize,
    pub throughput_window_secs: u64,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Retry => self.retry,
        }
    }

    pub(crate) fn count_mut(&mut self, status: JobStatus) -> &mut usize {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Retry => &mut self.retry,
        }
    }

    pub fn by_status(&self) -> BTreeMap<JobStatus, usize> {
        JobStatus::ALL.into_iter().map(|s| (s, self.count(s))).collect()
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL.into_iter().map(|s| self.count(s)).sum()
    }

    /// Completed jobs per minute over the throughput window.
    pub fn completed_per_minute(&self) -> f64 {
        if self.throughput_window_secs == 0 {
            return 0.0;
        }
        self.completed_recent as f64 * 60.0 / self.throughput_window_secs as f64
    }
}

/// Overall verdict of [`diagnose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Limits used by [`diagnose`].
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// More stuck jobs than this is unhealthy; any stuck job is degraded.
    pub max_stuck: usize,
    /// Oldest due job waiting longer than this is degraded.
    pub max_pending_age: Duration,
    /// More terminal failures within the throughput window than this is degraded.
    pub max_recent_failures: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_stuck: 5,
            max_pending_age: Duration::from_secs(30 * 60),
            max_recent_failures: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

impl HealthReport {
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }

    fn flag(&mut self, status: HealthStatus, issue: String) {
        self.status = self.status.max(status);
        self.issues.push(issue);
    }
}

/// Evaluate a stats snapshot against thresholds.
pub fn diagnose(stats: &QueueStats, thresholds: &HealthThresholds) -> HealthReport {
    let mut report = HealthReport {
        status: HealthStatus::Healthy,
        issues: Vec::new(),
    };

    if stats.stuck > thresholds.max_stuck {
        report.flag(
            HealthStatus::Unhealthy,
            format!(
                "{} jobs stuck in processing (limit {})",
                stats.stuck, thresholds.max_stuck
            ),
        );
    } else if stats.stuck > 0 {
        report.flag(
            HealthStatus::Degraded,
            format!("{} jobs stuck in processing", stats.stuck),
        );
    }

    if let Some(age) = stats.oldest_pending_age_secs {
        let limit = thresholds.max_pending_age.as_secs() as i64;
        if age > limit {
            report.flag(
                HealthStatus::Degraded,
                format!("oldest due job has waited {age}s (limit {limit}s)"),
            );
        }
    }

    if stats.failed_recent > thresholds.max_recent_failures {
        report.flag(
            HealthStatus::Degraded,
            format!(
                "{} jobs failed permanently in the last {}s (limit {})",
                stats.failed_recent, stats.throughput_window_secs, thresholds.max_recent_failures
            ),
        );
    }

    report
}
