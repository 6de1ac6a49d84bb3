//! Background sweep scheduling.
//!
//! Each sweep runs in its own spawned task on a fixed cadence:
//! duplicate resolution and the missing-queue check on the hour, the
//! invalid-slot check five minutes before it so freshly moved posts land on
//! valid slots before the duplicate pass, and the pending-post check on a
//! short fixed interval. A one-shot startup pass repairs whatever
//! accumulated while the process was down.

use crate::clock::Clock;
use crate::config;
use crate::db::Pool;
use crate::notify::Notifier;
use crate::queue::DeliveryQueue;
use crate::reconciler::Reconciler;
use chrono::{Duration as ChronoDuration, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct SweepContext {
    pub pool: Pool,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub notifier: Arc<dyn Notifier>,
    pub sweeps: config::Sweeps,
    pub scheduling: config::Scheduling,
}

impl SweepContext {
    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(
            &self.pool,
            self.clock.as_ref(),
            self.queue.as_ref(),
            self.notifier.as_ref(),
            self.scheduling.lookahead_days,
            self.scheduling.sync_horizon_days,
        )
    }
}

/// Sleep until the wall clock next reads `minute` past the hour.
async fn wait_until_minute(clock: &dyn Clock, minute: u32) {
    let now = clock.now();
    let next = now
        .with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0));
    let Some(mut next) = next else {
        // Config validation keeps minute < 60; fall back to a plain hour.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return;
    };
    if next <= now {
        next += ChronoDuration::hours(1);
    }
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(wait).await;
}

/// Spawn all periodic sweeps plus the startup one-shot. The returned handles
/// run until the process exits.
pub fn spawn_all(ctx: SweepContext) -> Vec<JoinHandle<()>> {
    let ctx = Arc::new(ctx);
    let mut handles = Vec::new();

    {
        let ctx = Arc::clone(&ctx);
        let delay = Duration::from_secs(ctx.sweeps.startup_delay_seconds);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_startup_pass(&ctx).await;
        }));
    }

    {
        let ctx = Arc::clone(&ctx);
        let minute = ctx.sweeps.duplicate_minute;
        handles.push(tokio::spawn(async move {
            loop {
                wait_until_minute(ctx.clock.as_ref(), minute).await;
                match ctx.reconciler().resolve_duplicates().await {
                    Ok(outcome) => info!(?outcome, "duplicate sweep finished"),
                    Err(err) => error!(?err, "duplicate sweep failed"),
                }
            }
        }));
    }

    {
        let ctx = Arc::clone(&ctx);
        let minute = ctx.sweeps.invalid_slot_minute;
        handles.push(tokio::spawn(async move {
            loop {
                wait_until_minute(ctx.clock.as_ref(), minute).await;
                match ctx.reconciler().resolve_invalid_slots().await {
                    Ok(outcome) => info!(?outcome, "invalid-slot sweep finished"),
                    Err(err) => error!(?err, "invalid-slot sweep failed"),
                }
            }
        }));
    }

    {
        let ctx = Arc::clone(&ctx);
        let minute = ctx.sweeps.missing_queue_minute;
        handles.push(tokio::spawn(async move {
            loop {
                wait_until_minute(ctx.clock.as_ref(), minute).await;
                match ctx.reconciler().check_missing_queues().await {
                    Ok(outcome) => info!(?outcome, "missing-queue sweep finished"),
                    Err(err) => error!(?err, "missing-queue sweep failed"),
                }
            }
        }));
    }

    {
        let ctx = Arc::clone(&ctx);
        let period = Duration::from_secs(ctx.sweeps.pending_interval_minutes * 60);
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match ctx.reconciler().check_pending_posts().await {
                    Ok(outcome) => info!(?outcome, "pending-post sweep finished"),
                    Err(err) => error!(?err, "pending-post sweep failed"),
                }
            }
        }));
    }

    handles
}

/// Startup repair: duplicates first so every post owns a unique minute, then
/// missed posts, then a full queue sync so jobs match the repaired schedule.
async fn run_startup_pass(ctx: &SweepContext) {
    info!("running startup reconciliation pass");
    let reconciler = ctx.reconciler();
    if let Err(err) = reconciler.resolve_duplicates().await {
        error!(?err, "startup duplicate resolution failed");
    }
    if let Err(err) = reconciler.reschedule_all_missed().await {
        error!(?err, "startup missed-post reschedule failed");
    }
    if let Err(err) = reconciler.sync_queue_jobs().await {
        error!(?err, "startup queue sync failed");
    }
    info!("startup reconciliation pass finished");
}
