use std::time::Duration;

use serde::{Deserialize, Serialize};

use marketpulse_core::{JobKind, NewJob, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY};
use marketpulse_infra::jobs::{HealthReport, QueueStats};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
    /// Defaults to the kind's priority for built-in types, otherwise 5.
    pub priority: Option<i32>,
    #[serde(default)]
    pub delay_secs: u64,
    pub max_attempts: Option<u32>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl EnqueueRequest {
    pub fn into_new_job(self) -> NewJob {
        let priority = self.priority.unwrap_or_else(|| {
            JobKind::parse(&self.job_type)
                .map(|k| k.default_priority())
                .unwrap_or(DEFAULT_PRIORITY)
        });
        NewJob::new(self.job_type, self.payload)
            .with_priority(priority)
            .delayed(Duration::from_secs(self.delay_secs))
            .with_max_attempts(self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub stats: QueueStats,
}
