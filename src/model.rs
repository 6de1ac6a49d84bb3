use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a post.
///
/// DRAFT -> QUEUE on scheduling, QUEUE -> PUBLISHED/ERROR on delivery.
/// Reconciliation only ever moves QUEUE posts; PUBLISHED and ERROR are
/// terminal and never rescheduled or deleted by anomaly cleanup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PostState {
    Draft,
    Queue,
    Published,
    Error,
}

impl PostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostState::Draft => "DRAFT",
            PostState::Queue => "QUEUE",
            PostState::Published => "PUBLISHED",
            PostState::Error => "ERROR",
        }
    }

    pub fn parse_state(s: &str) -> Option<PostState> {
        match s {
            "DRAFT" => Some(PostState::Draft),
            "QUEUE" => Some(PostState::Queue),
            "PUBLISHED" => Some(PostState::Published),
            "ERROR" => Some(PostState::Error),
            _ => None,
        }
    }
}

/// State of a job in the delivery queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Missing,
}

impl JobState {
    /// A job that is still going to run. Posts due soon must have a job in
    /// one of these states or the queue sync re-enqueues them.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub provider: String,
    pub disabled: bool,
    pub in_setup: bool,
    pub refresh_needed: bool,
    pub timezone_offset: i64,
    pub posting_times: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub channel_id: String,
    pub organization_id: String,
    pub state: PostState,
    pub publish_date: DateTime<Utc>,
    pub parent_post_id: Option<String>,
    pub content: String,
    pub media: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
