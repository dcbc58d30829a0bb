use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;

use marketpulse_core::{JobKind, NewJob, RetryPolicy};
use marketpulse_infra::handlers::{builtin_dispatcher, HttpCollaborator};
use marketpulse_infra::jobs::{
    HealthThresholds, InMemoryJobStore, JobStore, PeriodicProducer, PostgresJobStore,
    ProducerHandle, QueueClient, Reaper, ReaperHandle, StatsWindow, WorkerPool,
};
use marketpulse_infra::AppConfig;

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub queue: QueueClient,
    pub stats_window: StatsWindow,
    pub thresholds: HealthThresholds,
}

impl AppServices {
    pub fn new(store: Arc<dyn JobStore>, stats_window: StatsWindow) -> Self {
        Self {
            queue: QueueClient::new(store.clone()),
            store,
            stats_window,
            thresholds: HealthThresholds::default(),
        }
    }

    /// In-memory services (dev/test).
    pub fn in_memory(retry: RetryPolicy) -> Self {
        Self::new(
            Arc::new(InMemoryJobStore::with_retry_policy(retry)),
            StatsWindow::default(),
        )
    }
}

/// Build services from configuration.
///
/// Must be called outside the async runtime: connecting to Postgres blocks on `runtime`.
pub fn build_services(config: &AppConfig, runtime: &Handle) -> anyhow::Result<AppServices> {
    let store: Arc<dyn JobStore> = if config.use_persistent_stores {
        build_persistent_store(config, runtime)?
    } else {
        tracing::info!("using in-memory job store");
        Arc::new(InMemoryJobStore::with_retry_policy(config.retry.clone()))
    };

    Ok(AppServices::new(store, config.stats_window()))
}

fn build_persistent_store(config: &AppConfig, runtime: &Handle) -> anyhow::Result<Arc<dyn JobStore>> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    // One connection per worker plus headroom for HTTP, reaper and producers.
    let max_connections = u32::try_from(config.worker_count + 4).unwrap_or(u32::MAX);
    let pool = runtime
        .block_on(
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url),
        )
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool, runtime.clone(), config.retry.clone());
    runtime
        .block_on(store.ensure_schema())
        .context("failed to ensure job_queue schema")?;

    tracing::info!("using Postgres job store");
    Ok(Arc::new(store))
}

/// Threads that run alongside the HTTP server.
#[derive(Debug)]
pub struct Background {
    workers: WorkerPool,
    reaper: ReaperHandle,
    producers: Vec<ProducerHandle>,
}

impl Background {
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Stop producers and the reaper, then give workers up to `grace` to finish.
    pub fn shutdown(self, grace: Duration) {
        for producer in self.producers {
            producer.shutdown();
        }
        self.reaper.shutdown();
        let detached = self.workers.shutdown(grace);
        if detached > 0 {
            tracing::warn!(detached, "workers detached at shutdown; their jobs will be reaped");
        }
    }
}

/// Register handlers and start workers, reaper and periodic producers.
pub fn spawn_background(config: &AppConfig, services: &AppServices) -> anyhow::Result<Background> {
    let collaborator = match &config.collaborator_url {
        Some(url) => Some(Arc::new(
            HttpCollaborator::new(url.clone(), config.collaborator_timeout)
                .context("failed to build collaborator client")?,
        )),
        None => {
            tracing::warn!("COLLABORATOR_URL not set; only the cleanup handler is registered");
            None
        }
    };

    let dispatcher = builtin_dispatcher(services.store.clone(), config.cleanup_retention, collaborator);
    tracing::info!(job_types = ?dispatcher.job_types(), "job handlers registered");

    let workers = WorkerPool::spawn(
        "job-worker",
        config.worker_count,
        services.store.clone(),
        Arc::new(dispatcher),
        config.worker.clone(),
    )
    .context("failed to spawn workers")?;

    let reaper = Reaper::new(services.store.clone(), config.reaper.clone())
        .spawn()
        .context("failed to spawn reaper")?;

    let mut producers = vec![PeriodicProducer::new(
        "cleanup-producer",
        services.queue.clone(),
        config.cleanup_interval,
    )
    .with_job(NewJob::of_kind(JobKind::Cleanup, serde_json::json!({})))
    .spawn()
    .context("failed to spawn cleanup producer")?];

    // Without a collaborator nothing could run the analysis.
    let daily = config
        .daily_analysis_interval
        .filter(|_| config.collaborator_url.is_some());
    if let Some(interval) = daily {
        producers.push(
            PeriodicProducer::new("daily-analysis-producer", services.queue.clone(), interval)
                .with_job(NewJob::of_kind(JobKind::DailyAnalysis, serde_json::json!({})))
                .spawn()
                .context("failed to spawn daily analysis producer")?,
        );
    }

    Ok(Background {
        workers,
        reaper,
        producers,
    })
}
