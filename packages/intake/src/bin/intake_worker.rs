//! Intake Worker
//!
//! Runs a pool of job workers against the Postgres queue until Ctrl-C.
//! Each job renders a message's documents, extracts the referral, and
//! reconciles it into its case.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use intake_core::domains::cases::{CaseReconciler, PostgresCaseStore};
use intake_core::domains::extraction::OpenAiExtractionAdapter;
use intake_core::domains::ingestion::IngestionPipeline;
use intake_core::kernel::jobs::{PostgresJobQueue, PostgresWorkerRegistry, WorkerPool};
use intake_core::kernel::{ChunkedRenderer, PopplerRasterizer};
use intake_core::Config;
use openai_client::OpenAIClient;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,intake_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        worker = %config.worker_name,
        concurrency = config.worker_concurrency,
        model = %config.openai_model,
        render_policy = ?config.render.policy,
        "Starting intake worker"
    );

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections(config.worker_concurrency as u32 + 2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let queue = Arc::new(PostgresJobQueue::new(pool.clone(), config.queue.clone()));
    let registry = Arc::new(PostgresWorkerRegistry::new(pool.clone()));
    let reconciler = Arc::new(CaseReconciler::new(Arc::new(PostgresCaseStore::new(pool))));

    let renderer = ChunkedRenderer::new(
        PopplerRasterizer::new(&config.render),
        config.render.clone(),
    );
    let client = OpenAIClient::new(&config.openai_api_key)
        .with_timeout(std::time::Duration::from_secs(120))
        .context("Failed to build OpenAI client")?;
    let extractor = OpenAiExtractionAdapter::new(client)
        .with_model(&config.openai_model)
        .with_detail(config.vision_image_detail);

    let pipeline = IngestionPipeline::new(Arc::new(renderer), Arc::new(extractor), reconciler)
        .with_pdf_conversion(config.pdf_conversion_enabled);

    let mut workers = WorkerPool::start(
        config.worker_concurrency,
        queue,
        registry,
        Arc::new(pipeline),
        config.worker_config(),
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                tracing::info!("Shutdown requested, finishing in-flight jobs");
                break;
            }
            exit = workers.join_next() => {
                let Some(exit) = exit else {
                    bail!("all workers exited");
                };
                match exit.result {
                    Ok(stats) => tracing::info!(worker_id = %exit.worker_id, ?stats, "worker stopped"),
                    Err(e) => tracing::error!(worker_id = %exit.worker_id, error = %e, "worker failed"),
                }
                if workers.is_empty() {
                    bail!("all workers exited");
                }
            }
        }
    }

    for exit in workers.shutdown().await {
        if let Ok(stats) = exit.result {
            tracing::info!(worker_id = %exit.worker_id, ?stats, "worker stopped");
        }
    }
    Ok(())
}
