use anyhow::Context;

use marketpulse_api::app::{self, services};
use marketpulse_infra::AppConfig;

fn main() -> anyhow::Result<()> {
    marketpulse_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    // Built outside the runtime: the Postgres store and the collaborator
    // client block, and workers run on their own threads.
    let services = services::build_services(&config, runtime.handle())?;
    let background = services::spawn_background(&config, &services)?;

    let router = app::build_app(services);
    let served = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(config.http_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.http_addr))?;
        tracing::info!("listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("http server failed")
    });

    tracing::info!(grace_secs = config.shutdown_grace.as_secs(), "shutting down background workers");
    background.shutdown(config.shutdown_grace);
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
