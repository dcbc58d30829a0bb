//! Handlers that delegate to external collaborators (feed fetching, content
//! processing, analysis, prediction validation).
//!
//! The queue only parses the payload and maps the collaborator's answer onto
//! retry semantics; the actual work happens behind the traits below.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use marketpulse_core::{Job, JobKind};

use crate::jobs::{HandlerError, JobDispatcher, JobHandler, QueueClient};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Temporary; the job is retried.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request; retrying cannot help.
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

impl From<CollaboratorError> for HandlerError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Unavailable(_) => HandlerError::Transient(err.to_string()),
            CollaboratorError::Rejected(_) => HandlerError::Permanent(err.to_string()),
        }
    }
}

// Payloads

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFetchPayload {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// New content discovered by a feed fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub content_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentProcessPayload {
    pub content_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAnalysisPayload {
    /// Day to analyse; the collaborator picks "yesterday" when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionComparisonPayload {
    pub prediction_id: String,
}

// Collaborator boundary

pub trait FeedFetcher: Send + Sync {
    /// Fetch a source and return the items not seen before.
    fn fetch(&self, payload: &FeedFetchPayload) -> Result<Vec<ContentItem>, CollaboratorError>;
}

pub trait ContentProcessor: Send + Sync {
    fn process(&self, payload: &ContentProcessPayload) -> Result<(), CollaboratorError>;
}

pub trait AnalysisGenerator: Send + Sync {
    fn generate(&self, payload: &DailyAnalysisPayload) -> Result<(), CollaboratorError>;
}

pub trait PredictionValidator: Send + Sync {
    fn validate(&self, payload: &PredictionComparisonPayload) -> Result<(), CollaboratorError>;
}

fn parse<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, HandlerError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| HandlerError::bad_payload(job, e))
}

// Handlers

/// `feed_fetch`: fetch a source, then enqueue one `content_process` job per new item.
pub struct FeedFetchHandler {
    fetcher: Arc<dyn FeedFetcher>,
    queue: QueueClient,
}

impl FeedFetchHandler {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, queue: QueueClient) -> Self {
        Self { fetcher, queue }
    }
}

impl JobHandler for FeedFetchHandler {
    fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: FeedFetchPayload = parse(job)?;
        let items = self.fetcher.fetch(&payload)?;

        for item in &items {
            let follow_up = ContentProcessPayload {
                content_id: item.content_id.clone(),
                source_id: Some(payload.source_id.clone()),
            };
            // A failed enqueue retries the whole fetch; content processing
            // is idempotent per content_id so re-enqueued items are harmless.
            self.queue
                .enqueue_typed(JobKind::ContentProcess, &follow_up)
                .map_err(|e| HandlerError::transient(format!("failed to enqueue content job: {e}")))?;
        }

        info!(job_id = %job.id, source_id = %payload.source_id, new_items = items.len(), "feed fetched");
        Ok(())
    }
}

pub struct ContentProcessHandler {
    processor: Arc<dyn ContentProcessor>,
}

impl ContentProcessHandler {
    pub fn new(processor: Arc<dyn ContentProcessor>) -> Self {
        Self { processor }
    }
}

impl JobHandler for ContentProcessHandler {
    fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: ContentProcessPayload = parse(job)?;
        self.processor.process(&payload)?;
        debug!(job_id = %job.id, content_id = %payload.content_id, "content processed");
        Ok(())
    }
}

pub struct DailyAnalysisHandler {
    generator: Arc<dyn AnalysisGenerator>,
}

impl DailyAnalysisHandler {
    pub fn new(generator: Arc<dyn AnalysisGenerator>) -> Self {
        Self { generator }
    }
}

impl JobHandler for DailyAnalysisHandler {
    fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: DailyAnalysisPayload = parse(job)?;
        self.generator.generate(&payload)?;
        info!(job_id = %job.id, date = ?payload.date, "daily analysis generated");
        Ok(())
    }
}

pub struct PredictionComparisonHandler {
    validator: Arc<dyn PredictionValidator>,
}

impl PredictionComparisonHandler {
    pub fn new(validator: Arc<dyn PredictionValidator>) -> Self {
        Self { validator }
    }
}

impl JobHandler for PredictionComparisonHandler {
    fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: PredictionComparisonPayload = parse(job)?;
        self.validator.validate(&payload)?;
        debug!(job_id = %job.id, prediction_id = %payload.prediction_id, "prediction compared");
        Ok(())
    }
}

/// Anything that can serve every collaborator role.
pub trait Collaborator: FeedFetcher + ContentProcessor + AnalysisGenerator + PredictionValidator {}

impl<T> Collaborator for T where
    T: FeedFetcher + ContentProcessor + AnalysisGenerator + PredictionValidator
{
}

/// Register the four collaborator-backed handlers against one implementation.
pub fn register_collaborator_handlers<C>(
    dispatcher: &mut JobDispatcher,
    collaborator: Arc<C>,
    queue: QueueClient,
) where
    C: Collaborator + 'static,
{
    dispatcher
        .register_kind(
            JobKind::FeedFetch,
            FeedFetchHandler::new(collaborator.clone(), queue),
        )
        .register_kind(
            JobKind::ContentProcess,
            ContentProcessHandler::new(collaborator.clone()),
        )
        .register_kind(
            JobKind::DailyAnalysis,
            DailyAnalysisHandler::new(collaborator.clone()),
        )
        .register_kind(
            JobKind::PredictionComparison,
            PredictionComparisonHandler::new(collaborator),
        );
}
