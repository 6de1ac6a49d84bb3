//! Operator maintenance tasks, exposed through the `admin` binary.
//!
//! Listing variants only print what they find; cleanup variants soft-delete.
//! Deletion is always a `deleted_at` mark, never a row removal, so the posts
//! stay auditable.

use crate::clock::Clock;
use crate::db::{self, Pool, PostSummary};
use anyhow::Result;
use tracing::info;

fn print_summaries(posts: &[PostSummary]) {
    for post in posts {
        println!(
            "  - {} ({})\n    scheduled: {}\n    state: {}\n    post id: {}\n",
            post.channel_name,
            post.provider,
            post.publish_date,
            post.state.as_str(),
            post.id,
        );
    }
}

/// PUBLISHED posts whose publish date is still in the future. These are
/// bookkeeping bugs: a post cannot have been delivered at a time that has
/// not happened yet.
pub async fn list_future_published(pool: &Pool, clock: &dyn Clock) -> Result<usize> {
    let posts = db::future_published_posts(pool, clock.now()).await?;
    if posts.is_empty() {
        println!("no future-dated PUBLISHED posts found, schedule is clean");
        return Ok(0);
    }
    println!("found {} PUBLISHED posts with future dates:\n", posts.len());
    print_summaries(&posts);
    println!("run `admin future-published --delete` to remove them");
    Ok(posts.len())
}

pub async fn cleanup_future_published(pool: &Pool, clock: &dyn Clock) -> Result<usize> {
    let now = clock.now();
    let posts = db::future_published_posts(pool, now).await?;
    if posts.is_empty() {
        println!("no future-dated PUBLISHED posts found, nothing to delete");
        return Ok(0);
    }
    let ids: Vec<String> = posts.iter().map(|p| p.id.clone()).collect();
    db::mark_deleted(pool, &ids, now).await?;
    info!(deleted = posts.len(), "removed future-dated published posts");
    println!("cleanup complete, {} posts removed:\n", posts.len());
    print_summaries(&posts);
    Ok(posts.len())
}

/// Queued posts with an empty media list. Providers that require an
/// attachment will reject these at publish time.
pub async fn list_missing_media(pool: &Pool) -> Result<usize> {
    let posts = db::queued_posts_missing_media(pool).await?;
    if posts.is_empty() {
        println!("no scheduled posts without media found");
        return Ok(0);
    }
    println!("found {} scheduled posts without media:\n", posts.len());
    print_summaries(&posts);
    println!("run `admin missing-media --delete` to remove them");
    Ok(posts.len())
}

pub async fn cleanup_missing_media(pool: &Pool, clock: &dyn Clock) -> Result<usize> {
    let posts = db::queued_posts_missing_media(pool).await?;
    if posts.is_empty() {
        println!("no scheduled posts without media found, nothing to delete");
        return Ok(0);
    }
    let now = clock.now();
    let ids: Vec<String> = posts.iter().map(|p| p.id.clone()).collect();
    db::mark_deleted(pool, &ids, now).await?;
    info!(deleted = posts.len(), "removed posts without media");
    println!("cleanup complete, {} posts removed:\n", posts.len());
    print_summaries(&posts);
    Ok(posts.len())
}

/// Queued posts sitting on time slots their channel no longer has
/// configured. Read-only: the :55 sweep (or a service restart) moves them.
pub async fn list_invalid_slots(pool: &Pool, clock: &dyn Clock) -> Result<usize> {
    let invalid = crate::detector::find_invalid_slot_posts(pool, clock).await?;
    if invalid.is_empty() {
        println!("all scheduled posts sit on configured time slots");
        return Ok(0);
    }
    println!("found {} posts on invalid slots:\n", invalid.len());
    for finding in &invalid {
        println!(
            "  - {} on channel {}\n    scheduled: {} (offset {} min, configured: {:?})\n",
            finding.post.id,
            finding.post.channel_name,
            finding.post.publish_date,
            finding.actual_offset,
            finding.post.posting_times,
        );
    }
    println!("the invalid-slot sweep will reschedule these automatically");
    Ok(invalid.len())
}
