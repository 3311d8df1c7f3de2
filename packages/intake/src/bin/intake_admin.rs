//! Operator CLI for the intake queue
//!
//! Inspects and repairs queue state. Output is JSON on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intake_core::common::JobId;
use intake_core::domains::cases::PostgresCaseStore;
use intake_core::domains::ingestion::{InboundMessage, IntakeService};
use intake_core::kernel::jobs::{PostgresJobQueue, PostgresWorkerRegistry, QueueConfig};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;

#[derive(Parser)]
#[command(name = "intake_admin")]
#[command(about = "Inspect and repair the intake job queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Job counts by state and registered workers
    Status,

    /// List failed jobs with their last error
    Failed,

    /// Re-queue one failed job
    Retry {
        id: JobId,
        /// Start the attempt count over
        #[arg(long)]
        reset: bool,
    },

    /// Re-queue every failed job
    RetryAll,

    /// Remove all worker registrations (only when no worker is running)
    ClearWorkers,

    /// Submit a message from a JSON file
    Submit { file: PathBuf },

    /// Show a case by case number
    Case { case_number: String },
}

#[derive(Serialize)]
struct FailedJob {
    id: JobId,
    job_type: String,
    attempt_count: i32,
    max_attempts: i32,
    last_error: Option<String>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn output<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let service = service().await?;

    match cli.command {
        Commands::Status => output(&service.status().await?),
        Commands::Failed => {
            let failed: Vec<FailedJob> = service
                .failed_jobs()
                .await?
                .into_iter()
                .map(|job| FailedJob {
                    id: job.id,
                    job_type: job.job_type,
                    attempt_count: job.attempt_count,
                    max_attempts: job.max_attempts,
                    last_error: job.last_error,
                    finished_at: job.finished_at,
                })
                .collect();
            output(&failed)
        }
        Commands::Retry { id, reset } => {
            service.retry_job(id, reset).await?;
            output(&json!({ "retried": id, "reset_attempts": reset }))
        }
        Commands::RetryAll => output(&json!({ "retried": service.retry_all_failed().await? })),
        Commands::ClearWorkers => output(&json!({
            "cleared": service.clear_worker_registrations().await?
        })),
        Commands::Submit { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let message: InboundMessage =
                serde_json::from_str(&raw).context("Message file is not a valid message")?;
            output(&json!({ "job_id": service.submit(message).await? }))
        }
        Commands::Case { case_number } => output(&service.case(&case_number).await?),
    }
}

async fn service() -> Result<IntakeService> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("Failed to connect to database")?;

    Ok(IntakeService::new(
        Arc::new(PostgresJobQueue::new(pool.clone(), QueueConfig::default())),
        Arc::new(PostgresWorkerRegistry::new(pool.clone())),
        Arc::new(PostgresCaseStore::new(pool)),
    ))
}
