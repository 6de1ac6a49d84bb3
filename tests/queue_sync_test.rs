use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use postline::clock::FixedClock;
use postline::db::{self, NewChannel, NewPost};
use postline::model::{JobState, PostState};
use postline::notify::NoopNotifier;
use postline::queue::{DeliveryQueue, OutboxQueue};
use postline::reconciler::Reconciler;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct RecordingQueue {
    jobs: Arc<Mutex<HashMap<String, (i64, Value)>>>,
}

impl RecordingQueue {
    async fn delay_of(&self, job_key: &str) -> Option<i64> {
        self.jobs.lock().await.get(job_key).map(|(delay, _)| *delay)
    }
}

#[async_trait]
impl DeliveryQueue for RecordingQueue {
    async fn enqueue(&self, job_key: &str, delay_ms: i64, payload: Value) -> Result<()> {
        self.jobs
            .lock()
            .await
            .insert(job_key.to_string(), (delay_ms, payload));
        Ok(())
    }

    async fn delete_job(&self, job_key: &str) -> Result<()> {
        self.jobs.lock().await.remove(job_key);
        Ok(())
    }

    async fn job_state(&self, job_key: &str) -> Result<JobState> {
        Ok(match self.jobs.lock().await.get(job_key) {
            Some((delay, _)) if *delay > 0 => JobState::Delayed,
            Some(_) => JobState::Waiting,
            None => JobState::Missing,
        })
    }
}

async fn insert_channel(pool: &sqlx::SqlitePool, id: &str) {
    db::insert_channel(
        pool,
        &NewChannel {
            id: id.into(),
            organization_id: "org-1".into(),
            name: format!("channel {id}"),
            provider: "mastodon".into(),
            timezone_offset: 0,
            posting_times: vec![540],
        },
    )
    .await
    .unwrap();
}

async fn insert_queue_post(
    pool: &sqlx::SqlitePool,
    id: &str,
    channel_id: &str,
    publish: DateTime<Utc>,
) {
    db::insert_post(
        pool,
        &NewPost {
            id: id.into(),
            channel_id: channel_id.into(),
            organization_id: "org-1".into(),
            state: PostState::Queue,
            publish_date: publish,
            parent_post_id: None,
            content: format!("post {id}"),
            media: vec!["img.png".into()],
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn sync_recreates_missing_jobs_and_leaves_pending_ones_alone() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1").await;
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap();
    let clock = FixedClock(now);
    let queue = RecordingQueue::default();
    let notifier = NoopNotifier;

    insert_queue_post(&pool, "p-1", "ch-1", now + Duration::days(1)).await;
    insert_queue_post(&pool, "p-2", "ch-1", now + Duration::days(2)).await;
    // Beyond the 30-day horizon; sync must not touch it.
    insert_queue_post(&pool, "p-far", "ch-1", now + Duration::days(40)).await;

    let reconciler = Reconciler::new(&pool, &clock, &queue, &notifier, 90, 30);
    let outcome = reconciler.sync_queue_jobs().await.unwrap();

    assert_eq!(outcome.checked, 2);
    assert_eq!(outcome.rescheduled, 2);
    assert_eq!(queue.delay_of("p-1").await, Some(86_400_000));
    assert_eq!(queue.delay_of("p-2").await, Some(172_800_000));
    assert!(queue.delay_of("p-far").await.is_none());

    // Second pass sees pending jobs everywhere and changes nothing.
    let again = reconciler.sync_queue_jobs().await.unwrap();
    assert_eq!(again.rescheduled, 0);
    assert_eq!(again.skipped, 2);
}

#[tokio::test]
async fn pending_sweep_pushes_overdue_posts_immediately() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1").await;
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap();
    let clock = FixedClock(now);
    let queue = RecordingQueue::default();
    let notifier = NoopNotifier;

    // In the 15-30 minute lookback window with no job left.
    insert_queue_post(&pool, "p-stuck", "ch-1", now - Duration::minutes(20)).await;
    // Too recent for the sweep; the worker may still pick it up.
    insert_queue_post(&pool, "p-fresh", "ch-1", now - Duration::minutes(5)).await;
    // Too old; the missed-post flow owns it.
    insert_queue_post(&pool, "p-ancient", "ch-1", now - Duration::minutes(45)).await;

    let reconciler = Reconciler::new(&pool, &clock, &queue, &notifier, 90, 30);
    let outcome = reconciler.check_pending_posts().await.unwrap();

    assert_eq!(outcome.checked, 1);
    assert_eq!(outcome.rescheduled, 1);
    // Immediate delivery, not a delay back to the original publish time.
    assert_eq!(queue.delay_of("p-stuck").await, Some(0));
    assert!(queue.delay_of("p-fresh").await.is_none());
    assert!(queue.delay_of("p-ancient").await.is_none());
}

#[tokio::test]
async fn missing_queue_sweep_restores_upcoming_jobs_with_their_delay() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1").await;
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap();
    let clock = FixedClock(now);
    let queue = RecordingQueue::default();
    let notifier = NoopNotifier;

    insert_queue_post(&pool, "p-soon", "ch-1", now + Duration::hours(2)).await;
    insert_queue_post(&pool, "p-covered", "ch-1", now + Duration::hours(1)).await;
    // Outside the three-hour window.
    insert_queue_post(&pool, "p-later", "ch-1", now + Duration::hours(5)).await;
    queue
        .enqueue("p-covered", 3_600_000, json!({"id": "p-covered"}))
        .await
        .unwrap();

    let reconciler = Reconciler::new(&pool, &clock, &queue, &notifier, 90, 30);
    let outcome = reconciler.check_missing_queues().await.unwrap();

    assert_eq!(outcome.checked, 2);
    assert_eq!(outcome.rescheduled, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(queue.delay_of("p-soon").await, Some(7_200_000));
    assert_eq!(queue.delay_of("p-covered").await, Some(3_600_000));
    assert!(queue.delay_of("p-later").await.is_none());
}

#[tokio::test]
async fn missing_queue_sweep_ignores_disabled_channels() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1").await;
    db::set_channel_flags(&pool, "ch-1", true, false, false)
        .await
        .unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap();
    let clock = FixedClock(now);
    let queue = RecordingQueue::default();
    let notifier = NoopNotifier;

    insert_queue_post(&pool, "p-1", "ch-1", now + Duration::hours(1)).await;

    let reconciler = Reconciler::new(&pool, &clock, &queue, &notifier, 90, 30);
    let outcome = reconciler.check_missing_queues().await.unwrap();

    assert_eq!(outcome.checked, 0);
    assert!(queue.delay_of("p-1").await.is_none());
}

#[tokio::test]
async fn outbox_queue_hands_due_jobs_to_the_worker_in_order() {
    let pool = setup_pool().await;
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap();
    let clock = Arc::new(FixedClock(now));
    let outbox = OutboxQueue::new(pool.clone(), clock);

    outbox.enqueue("j-due", 0, json!({"id": "j-due"})).await.unwrap();
    outbox
        .enqueue("j-later", 600_000, json!({"id": "j-later"}))
        .await
        .unwrap();

    assert_eq!(outbox.job_state("j-due").await.unwrap(), JobState::Waiting);
    assert_eq!(outbox.job_state("j-later").await.unwrap(), JobState::Delayed);
    assert_eq!(outbox.job_state("j-gone").await.unwrap(), JobState::Missing);

    let due = outbox.due_jobs(10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, "j-due");
    assert_eq!(due[0].1, json!({"id": "j-due"}));
}
