//! Delivery queue bridge.
//!
//! The scheduling core never talks to a concrete transport; it depends on the
//! [`DeliveryQueue`] trait only. Jobs are derived state: the post row is the
//! source of truth and any job can be safely deleted and recreated from it,
//! which is why enqueueing is delete-then-insert.

use crate::clock::Clock;
use crate::db::Pool;
use crate::model::JobState;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;
use tracing::instrument;

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Schedule a job to run after `delay_ms`. Replaces any job with the
    /// same key.
    async fn enqueue(&self, job_key: &str, delay_ms: i64, payload: Value) -> Result<()>;

    async fn delete_job(&self, job_key: &str) -> Result<()>;

    async fn job_state(&self, job_key: &str) -> Result<JobState>;
}

/// SQLite-backed queue over the `outbox_jobs` table.
#[derive(Clone)]
pub struct OutboxQueue {
    pool: Pool,
    clock: Arc<dyn Clock>,
}

impl OutboxQueue {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Jobs whose due time has passed, oldest first. Consumed by the
    /// external delivery worker.
    pub async fn due_jobs(&self, limit: i64) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            "SELECT job_key, payload FROM outbox_jobs \
             WHERE datetime(due_at) <= datetime(?) \
             ORDER BY datetime(due_at) ASC LIMIT ?",
        )
        .bind(self.clock.now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let raw: String = row.get("payload");
                Ok((row.get("job_key"), serde_json::from_str(&raw)?))
            })
            .collect()
    }
}

#[async_trait]
impl DeliveryQueue for OutboxQueue {
    #[instrument(skip_all)]
    async fn enqueue(&self, job_key: &str, delay_ms: i64, payload: Value) -> Result<()> {
        let due_at: DateTime<Utc> = self.clock.now() + Duration::milliseconds(delay_ms.max(0));
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM outbox_jobs WHERE job_key = ?")
            .bind(job_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO outbox_jobs (job_key, payload, due_at) VALUES (?, ?, ?)")
            .bind(job_key)
            .bind(payload.to_string())
            .bind(due_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn delete_job(&self, job_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM outbox_jobs WHERE job_key = ?")
            .bind(job_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn job_state(&self, job_key: &str) -> Result<JobState> {
        let due_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT due_at FROM outbox_jobs WHERE job_key = ?",
        )
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match due_at {
            None => JobState::Missing,
            Some(due) if due <= self.clock.now() => JobState::Waiting,
            Some(_) => JobState::Delayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    async fn setup_queue() -> OutboxQueue {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        OutboxQueue::new(pool, Arc::new(FixedClock(now)))
    }

    #[tokio::test]
    async fn enqueue_replaces_and_states_follow_due_time() {
        let queue = setup_queue().await;

        assert_eq!(queue.job_state("p-1").await.unwrap(), JobState::Missing);

        queue
            .enqueue("p-1", 60_000, json!({"id": "p-1"}))
            .await
            .unwrap();
        assert_eq!(queue.job_state("p-1").await.unwrap(), JobState::Delayed);

        // Re-enqueue with zero delay: single job, now runnable.
        queue.enqueue("p-1", 0, json!({"id": "p-1"})).await.unwrap();
        assert_eq!(queue.job_state("p-1").await.unwrap(), JobState::Waiting);

        let due = queue.due_jobs(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "p-1");

        queue.delete_job("p-1").await.unwrap();
        assert_eq!(queue.job_state("p-1").await.unwrap(), JobState::Missing);
    }

    #[tokio::test]
    async fn negative_delay_is_clamped_to_immediate() {
        let queue = setup_queue().await;
        queue
            .enqueue("p-late", -5_000, json!({"id": "p-late"}))
            .await
            .unwrap();
        assert_eq!(queue.job_state("p-late").await.unwrap(), JobState::Waiting);
    }
}
