//! Built-in job handlers.
//!
//! - `cleanup` prunes the queue itself and is always registered
//! - the other built-ins delegate to a collaborator service, when one is configured

pub mod cleanup;
pub mod collaborators;
pub mod external;

use std::sync::Arc;
use std::time::Duration;

use marketpulse_core::JobKind;

use crate::jobs::{JobDispatcher, JobStore, QueueClient};

pub use cleanup::{CleanupHandler, CleanupPayload};
pub use collaborators::{
    register_collaborator_handlers, AnalysisGenerator, Collaborator, CollaboratorError,
    ContentItem, ContentProcessHandler, ContentProcessPayload, ContentProcessor,
    DailyAnalysisHandler, DailyAnalysisPayload, FeedFetchHandler, FeedFetchPayload, FeedFetcher,
    PredictionComparisonHandler, PredictionComparisonPayload, PredictionValidator,
};
pub use external::HttpCollaborator;

/// Dispatcher with every built-in handler that can run with what is configured.
pub fn builtin_dispatcher<C>(
    store: Arc<dyn JobStore>,
    cleanup_retention: Duration,
    collaborator: Option<Arc<C>>,
) -> JobDispatcher
where
    C: Collaborator + 'static,
{
    let mut dispatcher = JobDispatcher::new();
    dispatcher.register_kind(
        JobKind::Cleanup,
        CleanupHandler::new(store.clone(), cleanup_retention),
    );
    if let Some(collaborator) = collaborator {
        register_collaborator_handlers(&mut dispatcher, collaborator, QueueClient::new(store));
    }
    dispatcher
}
