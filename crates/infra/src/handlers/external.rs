//! HTTP client for the collaborator service.
//!
//! Every collaborator call is a `POST {base_url}/{job_type}` with the job
//! payload as JSON. Workers run on plain threads, so the blocking client is
//! used; it must not be built or dropped inside an async task.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use marketpulse_core::JobKind;

use super::collaborators::{
    AnalysisGenerator, CollaboratorError, ContentItem, ContentProcessPayload, ContentProcessor,
    DailyAnalysisPayload, FeedFetchPayload, FeedFetcher, PredictionComparisonPayload,
    PredictionValidator,
};

#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    client: Client,
    base_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct FeedFetchResponse {
    #[serde(default)]
    items: Vec<ContentItem>,
}

impl HttpCollaborator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Rejected(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, kind: JobKind) -> String {
        format!("{}/{}", self.base_url, kind.as_str())
    }

    fn post<P: Serialize>(&self, kind: JobKind, payload: &P) -> Result<String, CollaboratorError> {
        let url = self.url(kind);
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .map_err(|e| CollaboratorError::Unavailable(format!("{url}: {e}")))?;

        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        debug!(url = %url, status = status.as_u16(), "collaborator responded");
        classify(status, body)
    }
}

/// Map an HTTP response onto retry semantics.
fn classify(status: StatusCode, body: String) -> Result<String, CollaboratorError> {
    if status.is_success() {
        return Ok(body);
    }
    let msg = format!("{} {}", status.as_u16(), body.trim());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(CollaboratorError::Unavailable(msg))
    } else {
        Err(CollaboratorError::Rejected(msg))
    }
}

impl FeedFetcher for HttpCollaborator {
    fn fetch(&self, payload: &FeedFetchPayload) -> Result<Vec<ContentItem>, CollaboratorError> {
        let body = self.post(JobKind::FeedFetch, payload)?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: FeedFetchResponse = serde_json::from_str(&body)
            .map_err(|e| CollaboratorError::Unavailable(format!("unreadable feed_fetch response: {e}")))?;
        Ok(parsed.items)
    }
}

impl ContentProcessor for HttpCollaborator {
    fn process(&self, payload: &ContentProcessPayload) -> Result<(), CollaboratorError> {
        self.post(JobKind::ContentProcess, payload).map(|_| ())
    }
}

impl AnalysisGenerator for HttpCollaborator {
    fn generate(&self, payload: &DailyAnalysisPayload) -> Result<(), CollaboratorError> {
        self.post(JobKind::DailyAnalysis, payload).map(|_| ())
    }
}

impl PredictionValidator for HttpCollaborator {
    fn validate(&self, payload: &PredictionComparisonPayload) -> Result<(), CollaboratorError> {
        self.post(JobKind::PredictionComparison, payload).map(|_| ())
    }
}
