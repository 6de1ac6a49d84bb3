//! Slot finder: walks a channel's recurring posting times forward through
//! the calendar and returns the next free UTC instants.

use crate::clock::Clock;
use crate::db::{self, Pool};
use crate::model::PostState;
use crate::slots;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::debug;

/// Where a slot search starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Scan forward from the current instant.
    FromNow,
    /// Scan from the day after the channel's latest scheduled post, so the
    /// returned slots never collide with the existing forward schedule.
    /// Falls back to `FromNow` when nothing is scheduled.
    FromEnd,
}

/// Parameters for one slot search.
#[derive(Debug, Clone)]
pub struct SlotQuery<'a> {
    pub channel_id: &'a str,
    pub org_id: &'a str,
    pub count: usize,
    /// Minutes since local midnight, in the channel's configured order.
    pub posting_times: &'a [i64],
    pub mode: SearchMode,
    /// Owner's timezone, minutes east of UTC.
    pub timezone_offset: i64,
    /// Which lifecycle states block a slot. Callers choose whether PUBLISHED
    /// posts count as occupancy; QUEUE should always be included.
    pub occupied_by: &'a [PostState],
    /// Maximum days scanned forward; bounds the search on full channels.
    pub lookahead_days: i64,
}

/// Slots already claimed within one reconciliation run. Threaded explicitly
/// through the batch so independent finder calls in the same run never hand
/// out the same minute twice.
#[derive(Debug, Default)]
pub struct UsedSlots(HashSet<i64>);

impl UsedSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.0.contains(&slots::minute_floor(at).timestamp())
    }

    /// Claim a minute; returns false if it was already taken in this run.
    pub fn claim(&mut self, at: DateTime<Utc>) -> bool {
        self.0.insert(slots::minute_floor(at).timestamp())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Find up to `query.count` free future slots for a channel.
///
/// A slot is accepted only if its UTC minute is in the future, not claimed in
/// `used`, and unoccupied per a live database read. Returns a strictly
/// increasing, pairwise-distinct list; fewer than `count` results means the
/// lookahead window ran out of capacity and is not an error. An empty
/// posting-time list returns an empty list immediately.
pub async fn find_available_slots(
    pool: &Pool,
    clock: &dyn Clock,
    query: &SlotQuery<'_>,
    used: &mut UsedSlots,
) -> Result<Vec<DateTime<Utc>>> {
    if query.posting_times.is_empty() {
        debug!(
            channel_id = query.channel_id,
            "no posting times configured, nothing to allocate"
        );
        return Ok(Vec::new());
    }

    let now = clock.now();
    // Candidates at or before this instant are rejected. In FromEnd mode the
    // bound also covers the latest scheduled post: a positive timezone offset
    // shifts projected slots earlier in UTC, so starting on the next calendar
    // day alone is not enough to stay past the existing schedule.
    let (start_day, not_before) = match query.mode {
        SearchMode::FromNow => (now.date_naive(), now),
        SearchMode::FromEnd => {
            match db::latest_scheduled_at(pool, query.channel_id, query.org_id).await? {
                Some(last) => (last.date_naive() + Duration::days(1), last.max(now)),
                None => (now.date_naive(), now),
            }
        }
    };
    debug!(
        channel_id = query.channel_id,
        ?query.mode,
        %start_day,
        count = query.count,
        "searching for free slots"
    );

    let mut found: Vec<DateTime<Utc>> = Vec::new();
    let mut days_checked = 0i64;
    while found.len() < query.count && days_checked < query.lookahead_days {
        let day = start_day + Duration::days(days_checked);
        for &offset in query.posting_times {
            if found.len() >= query.count {
                break;
            }
            let candidate = slots::project(offset, day, query.timezone_offset);
            if candidate <= not_before {
                continue;
            }
            if used.contains(candidate) {
                continue;
            }
            let occupant = db::post_at_minute(
                pool,
                query.channel_id,
                query.org_id,
                candidate,
                query.occupied_by,
                None,
            )
            .await?;
            if occupant.is_none() {
                used.claim(candidate);
                found.push(candidate);
                debug!(channel_id = query.channel_id, slot = %candidate, "found free slot");
            }
        }
        days_checked += 1;
    }

    // Posting times are applied in configured order, which within a day need
    // not be chronological.
    found.sort_unstable();

    debug!(
        channel_id = query.channel_id,
        found = found.len(),
        days_checked,
        "slot search finished"
    );
    Ok(found)
}
