use super::model::{
    DuePost, NewChannel, NewPost, PostSummary, QueuedPostWithTimes, ScheduledPost,
};
use crate::model::{Channel, Post, PostState};
use crate::slots;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    let id: String = row.get("id");
    let times_raw: String = row.get("posting_times");
    let posting_times: Vec<i64> = serde_json::from_str(&times_raw)
        .with_context(|| format!("channel {} has malformed posting_times", id))?;
    Ok(Channel {
        id,
        organization_id: row.get("organization_id"),
        name: row.get("name"),
        provider: row.get("provider"),
        disabled: row.get("disabled"),
        in_setup: row.get("in_setup"),
        refresh_needed: row.get("refresh_needed"),
        timezone_offset: row.get("timezone_offset"),
        posting_times,
        created_at: row.get("created_at"),
    })
}

fn parse_post_state(id: &str, raw: &str) -> Result<PostState> {
    PostState::parse_state(raw).ok_or_else(|| anyhow!("post {} has unknown state {}", id, raw))
}

#[instrument(skip_all)]
pub async fn insert_channel(pool: &Pool, channel: &NewChannel) -> Result<()> {
    sqlx::query(
        "INSERT INTO channels (id, organization_id, name, provider, timezone_offset, posting_times) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&channel.id)
    .bind(&channel.organization_id)
    .bind(&channel.name)
    .bind(&channel.provider)
    .bind(channel.timezone_offset)
    .bind(serde_json::to_string(&channel.posting_times)?)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_posting_times(pool: &Pool, channel_id: &str, times: &[i64]) -> Result<()> {
    sqlx::query("UPDATE channels SET posting_times = ? WHERE id = ?")
        .bind(serde_json::to_string(times)?)
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_channel_flags(
    pool: &Pool,
    channel_id: &str,
    disabled: bool,
    in_setup: bool,
    refresh_needed: bool,
) -> Result<()> {
    sqlx::query("UPDATE channels SET disabled = ?, in_setup = ?, refresh_needed = ? WHERE id = ?")
        .bind(disabled)
        .bind(in_setup)
        .bind(refresh_needed)
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn channel_by_id(pool: &Pool, channel_id: &str) -> Result<Option<Channel>> {
    let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(channel_from_row).transpose()
}

/// Channels eligible for reconciliation: connected, fully set up, token valid.
#[instrument(skip_all)]
pub async fn active_channels(pool: &Pool) -> Result<Vec<Channel>> {
    let rows = sqlx::query(
        "SELECT * FROM channels \
         WHERE disabled = 0 AND in_setup = 0 AND refresh_needed = 0 \
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(channel_from_row).collect()
}

#[instrument(skip_all)]
pub async fn insert_post(pool: &Pool, post: &NewPost) -> Result<()> {
    sqlx::query(
        "INSERT INTO posts (id, channel_id, organization_id, state, publish_date, \
         parent_post_id, content, media, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&post.id)
    .bind(&post.channel_id)
    .bind(&post.organization_id)
    .bind(post.state.as_str())
    .bind(slots::minute_floor(post.publish_date))
    .bind(&post.parent_post_id)
    .bind(&post.content)
    .bind(serde_json::to_string(&post.media)?)
    .bind(post.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn post_by_id(pool: &Pool, post_id: &str) -> Result<Option<Post>> {
    let row = sqlx::query("SELECT * FROM posts WHERE id = ?")
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let id: String = row.get("id");
    let state_raw: String = row.get("state");
    let state = parse_post_state(&id, &state_raw)?;
    let media_raw: String = row.get("media");
    let media: Vec<String> = serde_json::from_str(&media_raw)
        .with_context(|| format!("post {} has malformed media", id))?;
    Ok(Some(Post {
        id,
        channel_id: row.get("channel_id"),
        organization_id: row.get("organization_id"),
        state,
        publish_date: row.get("publish_date"),
        parent_post_id: row.get("parent_post_id"),
        content: row.get("content"),
        media,
        created_at: row.get("created_at"),
        deleted_at: row.get("deleted_at"),
    }))
}

/// Publish time of the channel's latest scheduled post, if any. Drives the
/// from-end slot search mode.
#[instrument(skip_all)]
pub async fn latest_scheduled_at(
    pool: &Pool,
    channel_id: &str,
    org_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let at = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT publish_date FROM posts \
         WHERE channel_id = ? AND organization_id = ? AND state = 'QUEUE' AND deleted_at IS NULL \
         AND parent_post_id IS NULL \
         ORDER BY datetime(publish_date) DESC LIMIT 1",
    )
    .bind(channel_id)
    .bind(org_id)
    .fetch_optional(pool)
    .await?;
    Ok(at)
}

/// Whether a non-deleted post in one of `states` occupies the UTC minute of
/// `instant` on this channel. `exclude_id` lets a post check a target minute
/// without colliding with itself.
#[instrument(skip_all)]
pub async fn post_at_minute(
    pool: &Pool,
    channel_id: &str,
    org_id: &str,
    instant: DateTime<Utc>,
    states: &[PostState],
    exclude_id: Option<&str>,
) -> Result<Option<String>> {
    if states.is_empty() {
        return Ok(None);
    }
    let (start, end) = slots::minute_window(instant);
    let placeholders = vec!["?"; states.len()].join(", ");
    let mut sql = format!(
        "SELECT id FROM posts \
         WHERE channel_id = ? AND organization_id = ? AND deleted_at IS NULL \
         AND parent_post_id IS NULL \
         AND datetime(publish_date) >= datetime(?) AND datetime(publish_date) < datetime(?) \
         AND state IN ({placeholders})"
    );
    if exclude_id.is_some() {
        sql.push_str(" AND id <> ?");
    }
    sql.push_str(" LIMIT 1");

    let mut query = sqlx::query_scalar::<_, String>(&sql)
        .bind(channel_id)
        .bind(org_id)
        .bind(start)
        .bind(end);
    for state in states {
        query = query.bind(state.as_str());
    }
    if let Some(exclude) = exclude_id {
        query = query.bind(exclude);
    }
    Ok(query.fetch_optional(pool).await?)
}

fn scheduled_from_row(row: &SqliteRow) -> Result<ScheduledPost> {
    let id: String = row.get("id");
    let state_raw: String = row.get("state");
    let state = parse_post_state(&id, &state_raw)?;
    Ok(ScheduledPost {
        id,
        channel_id: row.get("channel_id"),
        organization_id: row.get("organization_id"),
        state,
        publish_date: row.get("publish_date"),
        created_at: row.get("created_at"),
    })
}

/// All non-deleted lead posts scheduled at or after `start`, creation order.
/// Source data for the duplicate scan; DRAFT posts are not scheduled and are
/// excluded.
#[instrument(skip_all)]
pub async fn scheduled_posts_from(pool: &Pool, start: DateTime<Utc>) -> Result<Vec<ScheduledPost>> {
    let rows = sqlx::query(
        "SELECT id, channel_id, organization_id, state, publish_date, created_at FROM posts \
         WHERE deleted_at IS NULL AND state IN ('QUEUE', 'PUBLISHED', 'ERROR') \
         AND parent_post_id IS NULL \
         AND datetime(publish_date) >= datetime(?) \
         ORDER BY datetime(created_at) ASC, id ASC",
    )
    .bind(start)
    .fetch_all(pool)
    .await?;
    rows.iter().map(scheduled_from_row).collect()
}

/// Future queued lead posts joined with their channel's current posting times
/// and timezone. Source data for the invalid-slot scan.
#[instrument(skip_all)]
pub async fn queued_posts_with_times(
    pool: &Pool,
    from: DateTime<Utc>,
) -> Result<Vec<QueuedPostWithTimes>> {
    let rows = sqlx::query(
        "SELECT p.id, p.channel_id, p.organization_id, p.publish_date, \
                c.posting_times, c.timezone_offset, c.name AS channel_name \
         FROM posts p JOIN channels c ON c.id = p.channel_id \
         WHERE p.state = 'QUEUE' AND p.deleted_at IS NULL AND p.parent_post_id IS NULL \
         AND datetime(p.publish_date) >= datetime(?) \
         ORDER BY p.channel_id, datetime(p.publish_date)",
    )
    .bind(from)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let times_raw: String = row.get("posting_times");
            let posting_times: Vec<i64> = serde_json::from_str(&times_raw)
                .with_context(|| format!("channel of post {} has malformed posting_times", id))?;
            Ok(QueuedPostWithTimes {
                id,
                channel_id: row.get("channel_id"),
                organization_id: row.get("organization_id"),
                publish_date: row.get("publish_date"),
                posting_times,
                timezone_offset: row.get("timezone_offset"),
                channel_name: row.get("channel_name"),
            })
        })
        .collect()
}

/// Queued lead posts on this channel whose publish time has already passed,
/// oldest first.
#[instrument(skip_all)]
pub async fn missed_posts_for_channel(
    pool: &Pool,
    channel_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ScheduledPost>> {
    let rows = sqlx::query(
        "SELECT id, channel_id, organization_id, state, publish_date, created_at FROM posts \
         WHERE channel_id = ? AND state = 'QUEUE' AND deleted_at IS NULL \
         AND parent_post_id IS NULL AND datetime(publish_date) < datetime(?) \
         ORDER BY datetime(publish_date) ASC",
    )
    .bind(channel_id)
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(scheduled_from_row).collect()
}

/// Queued lead posts due inside `[from, to)`. Used by the pending check
/// (15-30 minutes back) to spot enqueue failures.
#[instrument(skip_all)]
pub async fn queued_posts_in_window(
    pool: &Pool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<DuePost>> {
    let rows = sqlx::query(
        "SELECT id, publish_date FROM posts \
         WHERE state = 'QUEUE' AND deleted_at IS NULL AND parent_post_id IS NULL \
         AND datetime(publish_date) >= datetime(?) AND datetime(publish_date) < datetime(?) \
         ORDER BY datetime(publish_date) ASC",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| DuePost {
            id: row.get("id"),
            publish_date: row.get("publish_date"),
        })
        .collect())
}

/// Same window query, restricted to posts whose channel is healthy (not
/// disabled, not mid-setup, token valid). Used by the missing-queue sweep.
#[instrument(skip_all)]
pub async fn queued_posts_in_window_active(
    pool: &Pool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<DuePost>> {
    let rows = sqlx::query(
        "SELECT p.id, p.publish_date FROM posts p \
         JOIN channels c ON c.id = p.channel_id \
         WHERE c.disabled = 0 AND c.in_setup = 0 AND c.refresh_needed = 0 \
         AND p.state = 'QUEUE' AND p.deleted_at IS NULL AND p.parent_post_id IS NULL \
         AND datetime(p.publish_date) >= datetime(?) AND datetime(p.publish_date) < datetime(?) \
         ORDER BY datetime(p.publish_date) ASC",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| DuePost {
            id: row.get("id"),
            publish_date: row.get("publish_date"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn update_publish_date(pool: &Pool, post_id: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE posts SET publish_date = ? WHERE id = ?")
        .bind(slots::minute_floor(at))
        .bind(post_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to move post {}", post_id))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn change_state(
    pool: &Pool,
    post_id: &str,
    state: PostState,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE posts SET state = ?, error = COALESCE(?, error) WHERE id = ?")
        .bind(state.as_str())
        .bind(error)
        .bind(post_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Soft-delete posts by id.
#[instrument(skip_all)]
pub async fn mark_deleted(pool: &Pool, post_ids: &[String], now: DateTime<Utc>) -> Result<()> {
    if post_ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; post_ids.len()].join(", ");
    let sql = format!("UPDATE posts SET deleted_at = ? WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql).bind(now);
    for id in post_ids {
        query = query.bind(id);
    }
    query.execute(pool).await?;
    Ok(())
}

fn summary_from_row(row: &SqliteRow) -> Result<PostSummary> {
    let id: String = row.get("id");
    let state_raw: String = row.get("state");
    let state = parse_post_state(&id, &state_raw)?;
    Ok(PostSummary {
        id,
        channel_name: row.get("channel_name"),
        provider: row.get("provider"),
        state,
        publish_date: row.get("publish_date"),
    })
}

/// PUBLISHED posts still carrying a future publish date. These are delivery
/// anomalies; reported and (on request) deleted by the admin commands, never
/// touched by reconciliation.
#[instrument(skip_all)]
pub async fn future_published_posts(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<PostSummary>> {
    let rows = sqlx::query(
        "SELECT p.id, p.state, p.publish_date, c.name AS channel_name, c.provider \
         FROM posts p JOIN channels c ON c.id = p.channel_id \
         WHERE p.state = 'PUBLISHED' AND p.deleted_at IS NULL \
         AND datetime(p.publish_date) > datetime(?) \
         ORDER BY datetime(p.publish_date) ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(summary_from_row).collect()
}

/// Scheduled posts with an empty media list.
#[instrument(skip_all)]
pub async fn queued_posts_missing_media(pool: &Pool) -> Result<Vec<PostSummary>> {
    let rows = sqlx::query(
        "SELECT p.id, p.state, p.publish_date, c.name AS channel_name, c.provider \
         FROM posts p JOIN channels c ON c.id = p.channel_id \
         WHERE p.state = 'QUEUE' AND p.deleted_at IS NULL \
         AND (p.media = '[]' OR p.media = '') \
         ORDER BY datetime(p.publish_date) ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(summary_from_row).collect()
}
