use anyhow::Result;
use clap::Parser;
use postline::clock::SystemClock;
use postline::notify::{NoopNotifier, Notifier, WebhookNotifier};
use postline::queue::OutboxQueue;
use postline::{config, db, sweeps};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let clock = Arc::new(SystemClock);
    let queue = Arc::new(OutboxQueue::new(pool.clone(), clock.clone()));
    let notifier: Arc<dyn Notifier> = if cfg.notify.webhook_url.is_empty() {
        Arc::new(NoopNotifier)
    } else {
        Arc::new(WebhookNotifier::new(&cfg.notify.webhook_url)?)
    };

    let handles = sweeps::spawn_all(sweeps::SweepContext {
        pool,
        clock,
        queue,
        notifier,
        sweeps: cfg.sweeps.clone(),
        scheduling: cfg.scheduling.clone(),
    });
    info!(tasks = handles.len(), "scheduling sweeps running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}
