use anyhow::Result;
use clap::{Parser, Subcommand};
use postline::clock::SystemClock;
use postline::{admin, config, db};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Maintenance tasks for the scheduling database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    task: Task,
}

#[derive(Debug, Subcommand)]
enum Task {
    /// PUBLISHED posts whose publish date is still in the future
    FuturePublished {
        /// Soft-delete the offending posts instead of just listing them
        #[arg(long)]
        delete: bool,
    },
    /// Scheduled posts with an empty media list
    MissingMedia {
        /// Soft-delete the offending posts instead of just listing them
        #[arg(long)]
        delete: bool,
    },
    /// Queued posts sitting on time slots no longer configured
    InvalidSlots,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/postline.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let clock = SystemClock;
    match args.task {
        Task::FuturePublished { delete: true } => {
            admin::cleanup_future_published(&pool, &clock).await?;
        }
        Task::FuturePublished { delete: false } => {
            admin::list_future_published(&pool, &clock).await?;
        }
        Task::MissingMedia { delete: true } => {
            admin::cleanup_missing_media(&pool, &clock).await?;
        }
        Task::MissingMedia { delete: false } => {
            admin::list_missing_media(&pool).await?;
        }
        Task::InvalidSlots => {
            admin::list_invalid_slots(&pool, &clock).await?;
        }
    }
    Ok(())
}
