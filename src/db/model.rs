//! Database view models returned by repository queries.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::PostState;
use chrono::{DateTime, Utc};

/// Post slice used by the duplicate scan and by reschedule flows.
#[derive(Debug, Clone)]
pub struct ScheduledPost {
    pub id: String,
    pub channel_id: String,
    pub organization_id: String,
    pub state: PostState,
    pub publish_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Queued post joined with its channel's current slot configuration, used
/// by the invalid-slot scan.
#[derive(Debug, Clone)]
pub struct QueuedPostWithTimes {
    pub id: String,
    pub channel_id: String,
    pub organization_id: String,
    pub publish_date: DateTime<Utc>,
    pub posting_times: Vec<i64>,
    pub timezone_offset: i64,
    pub channel_name: String,
}

/// Minimal slice for queue-sync and pending checks.
#[derive(Debug, Clone)]
pub struct DuePost {
    pub id: String,
    pub publish_date: DateTime<Utc>,
}

/// Post slice shown by the administrative list/cleanup commands.
#[derive(Debug, Clone)]
pub struct PostSummary {
    pub id: String,
    pub channel_name: String,
    pub provider: String,
    pub state: PostState,
    pub publish_date: DateTime<Utc>,
}

/// Fields for inserting a channel. Reconciliation never creates channels;
/// this exists for the provisioning path and for tests.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub provider: String,
    pub timezone_offset: i64,
    pub posting_times: Vec<i64>,
}

/// Fields for inserting a post.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: String,
    pub channel_id: String,
    pub organization_id: String,
    pub state: PostState,
    pub publish_date: DateTime<Utc>,
    pub parent_post_id: Option<String>,
    pub content: String,
    pub media: Vec<String>,
    pub created_at: DateTime<Utc>,
}
