//! Conflict detection: duplicate schedules, posts sitting on slots that are
//! no longer configured, missed posts, and posts missing their delivery job.
//!
//! Each scan is read-only; resolution lives in the reconciler.

use crate::clock::Clock;
use crate::db::{self, DuePost, Pool, QueuedPostWithTimes, ScheduledPost};
use crate::slots;
use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Two or more posts on one channel sharing a UTC minute. Members are in
/// creation order, so `members[0]` is the authoritative survivor.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub channel_id: String,
    pub minute: DateTime<Utc>,
    pub members: Vec<ScheduledPost>,
}

/// A queued post whose publish time no longer maps to any of its channel's
/// configured posting times.
#[derive(Debug, Clone)]
pub struct InvalidSlotPost {
    pub post: QueuedPostWithTimes,
    /// The stale time-of-day offset the post currently sits on.
    pub actual_offset: i64,
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &now.date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists"),
    )
}

/// Group scheduled posts by `(channel, UTC minute)` and report every group
/// with more than one member, annotated with lifecycle state.
///
/// Scans from the start of the current UTC day onward; duplicates that are
/// already fully in the past are stale history and intentionally ignored.
pub async fn find_duplicate_groups(pool: &Pool, clock: &dyn Clock) -> Result<Vec<DuplicateGroup>> {
    let start = start_of_utc_day(clock.now());
    let posts = db::scheduled_posts_from(pool, start).await?;
    let total = posts.len();

    // BTreeMap keeps groups in a stable (channel, minute) order; members keep
    // the repository's creation order.
    let mut grouped: BTreeMap<(String, i64), Vec<ScheduledPost>> = BTreeMap::new();
    for post in posts {
        let minute = slots::minute_floor(post.publish_date);
        grouped
            .entry((post.channel_id.clone(), minute.timestamp()))
            .or_default()
            .push(post);
    }

    let groups: Vec<DuplicateGroup> = grouped
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|((channel_id, minute), members)| DuplicateGroup {
            channel_id,
            minute: Utc
                .timestamp_opt(minute, 0)
                .single()
                .expect("minute timestamp in range"),
            members,
        })
        .collect();

    debug!(
        scanned = total,
        groups = groups.len(),
        "duplicate scan finished"
    );
    Ok(groups)
}

/// Queued future posts whose publish minute, projected back through the
/// owner's timezone, is not one of the channel's current posting times.
///
/// Channels with zero configured posting times are skipped entirely: that is
/// a missing-configuration condition, not a slot anomaly, and there is no
/// valid set to validate against.
pub async fn find_invalid_slot_posts(pool: &Pool, clock: &dyn Clock) -> Result<Vec<InvalidSlotPost>> {
    let candidates = db::queued_posts_with_times(pool, clock.now()).await?;
    let mut invalid = Vec::new();
    for post in candidates {
        if post.posting_times.is_empty() {
            continue;
        }
        let actual_offset = slots::offset_of(post.publish_date, post.timezone_offset);
        if !post.posting_times.contains(&actual_offset) {
            invalid.push(InvalidSlotPost {
                post,
                actual_offset,
            });
        }
    }
    debug!(found = invalid.len(), "invalid-slot scan finished");
    Ok(invalid)
}

/// Queued posts on this channel already past their publish time, oldest
/// first.
pub async fn missed_posts(
    pool: &Pool,
    clock: &dyn Clock,
    channel_id: &str,
) -> Result<Vec<ScheduledPost>> {
    db::missed_posts_for_channel(pool, channel_id, clock.now()).await
}

/// Queued posts that came due 15-30 minutes ago. If their delivery job is
/// gone they were never enqueued (or the enqueue was lost) and must be
/// pushed immediately.
pub async fn pending_posts_15m_back(pool: &Pool, clock: &dyn Clock) -> Result<Vec<DuePost>> {
    let now = clock.now();
    db::queued_posts_in_window(pool, now - Duration::minutes(30), now - Duration::minutes(15)).await
}

/// Queued posts on healthy channels due within the next three hours; the
/// missing-queue sweep cross-checks each against the delivery queue.
pub async fn upcoming_posts_3h(pool: &Pool, clock: &dyn Clock) -> Result<Vec<DuePost>> {
    let now = clock.now();
    db::queued_posts_in_window_active(pool, now, now + Duration::hours(3)).await
}

/// Queued posts due between now and the sync horizon, for the full queue/DB
/// reconciliation pass.
pub async fn posts_within_sync_horizon(
    pool: &Pool,
    clock: &dyn Clock,
    horizon_days: i64,
) -> Result<Vec<DuePost>> {
    let now = clock.now();
    db::queued_posts_in_window(pool, now, now + Duration::days(horizon_days)).await
}
