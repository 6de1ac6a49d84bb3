//! Reconciliation: turns detector findings back into a consistent schedule.
//!
//! Every resolution flow has the same shape: detect, pick survivors,
//! allocate replacement slots from the end of the schedule, persist the new
//! publish date, and re-synchronize the delivery queue. Batches always run
//! one post at a time so the used-slot accumulator stays correct, and they
//! log-and-continue past per-item failures rather than aborting the sweep.

use crate::clock::Clock;
use crate::db::{self, Pool};
use crate::detector;
use crate::finder::{find_available_slots, SearchMode, SlotQuery, UsedSlots};
use crate::model::{Channel, PostState};
use crate::notify::Notifier;
use crate::queue::DeliveryQueue;
use crate::slots;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, instrument, warn};

/// Running tallies returned to the sweep caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Items the sweep looked at.
    pub checked: usize,
    /// Posts moved to a new slot or (re)enqueued.
    pub rescheduled: usize,
    /// Items intentionally left alone (missing configuration, terminal
    /// state, already consistent).
    pub skipped: usize,
    /// Items that errored; they stay put and the next sweep retries.
    pub failed: usize,
}

impl SweepOutcome {
    pub fn merge(&mut self, other: SweepOutcome) {
        self.checked += other.checked;
        self.rescheduled += other.rescheduled;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Occupancy set used by all reconciliation allocations: only QUEUE posts
/// block a slot. PUBLISHED history does not reserve future minutes.
const RESCHEDULE_OCCUPANCY: &[PostState] = &[PostState::Queue];

pub struct Reconciler<'a> {
    pool: &'a Pool,
    clock: &'a dyn Clock,
    queue: &'a dyn DeliveryQueue,
    notifier: &'a dyn Notifier,
    lookahead_days: i64,
    sync_horizon_days: i64,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        pool: &'a Pool,
        clock: &'a dyn Clock,
        queue: &'a dyn DeliveryQueue,
        notifier: &'a dyn Notifier,
        lookahead_days: i64,
        sync_horizon_days: i64,
    ) -> Self {
        Self {
            pool,
            clock,
            queue,
            notifier,
            lookahead_days,
            sync_horizon_days,
        }
    }

    fn slot_query<'q>(&self, channel: &'q Channel, mode: SearchMode) -> SlotQuery<'q> {
        SlotQuery {
            channel_id: &channel.id,
            org_id: &channel.organization_id,
            count: 1,
            posting_times: &channel.posting_times,
            mode,
            timezone_offset: channel.timezone_offset,
            occupied_by: RESCHEDULE_OCCUPANCY,
            lookahead_days: self.lookahead_days,
        }
    }

    /// Move a post to `target`, re-checking the target minute immediately
    /// before the write. A conflicting occupant is not an error: the write is
    /// redirected to a freshly allocated slot at the end of the schedule,
    /// which resolves races between overlapping reschedule operations.
    /// Returns the instant the post actually landed on.
    #[instrument(skip_all)]
    pub async fn reschedule_post_guarded(
        &self,
        post_id: &str,
        channel: &Channel,
        target: DateTime<Utc>,
        used: &mut UsedSlots,
    ) -> Result<DateTime<Utc>> {
        let mut target = slots::minute_floor(target);
        let conflict = db::post_at_minute(
            self.pool,
            &channel.id,
            &channel.organization_id,
            target,
            RESCHEDULE_OCCUPANCY,
            Some(post_id),
        )
        .await?;
        if let Some(occupant) = conflict {
            let replacement = find_available_slots(
                self.pool,
                self.clock,
                &self.slot_query(channel, SearchMode::FromEnd),
                used,
            )
            .await?;
            let Some(&redirected) = replacement.first() else {
                return Err(anyhow!(
                    "minute {} already taken by {} and no free slot to redirect to",
                    target,
                    occupant
                ));
            };
            info!(
                post_id,
                occupant,
                requested = %target,
                redirected = %redirected,
                "target minute taken, redirecting to end of schedule"
            );
            target = redirected;
        }

        db::update_publish_date(self.pool, post_id, target).await?;
        used.claim(target);

        let delay_ms = (target - self.clock.now()).num_milliseconds().max(0);
        self.queue.delete_job(post_id).await?;
        self.queue
            .enqueue(post_id, delay_ms, json!({ "id": post_id }))
            .await?;
        Ok(target)
    }

    /// Manual "change date" entry point; same write guard as reconciliation.
    pub async fn change_post_date(
        &self,
        org_id: &str,
        post_id: &str,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let post = db::post_by_id(self.pool, post_id)
            .await?
            .filter(|p| p.organization_id == org_id && p.deleted_at.is_none())
            .ok_or_else(|| anyhow!("post {} not found", post_id))?;
        if post.state != PostState::Queue {
            return Err(anyhow!(
                "post {} is {} and cannot be rescheduled",
                post_id,
                post.state.as_str()
            ));
        }
        let channel = db::channel_by_id(self.pool, &post.channel_id)
            .await?
            .ok_or_else(|| anyhow!("channel {} not found", post.channel_id))?;
        let mut used = UsedSlots::new();
        self.reschedule_post_guarded(post_id, &channel, at, &mut used)
            .await
    }

    /// Resolve duplicate-schedule groups: within each group the member with
    /// the earliest creation time keeps its slot; every later QUEUE member is
    /// moved to a fresh slot at the end of the schedule. PUBLISHED and ERROR
    /// members are reported but never touched. Running this twice over the
    /// same data converges: the second pass finds no groups.
    #[instrument(skip_all)]
    pub async fn resolve_duplicates(&self) -> Result<SweepOutcome> {
        let groups = detector::find_duplicate_groups(self.pool, self.clock).await?;
        let mut outcome = SweepOutcome::default();
        if groups.is_empty() {
            info!("no duplicate schedules found");
            return Ok(outcome);
        }
        info!(groups = groups.len(), "resolving duplicate schedules");

        // One accumulator per channel so two duplicates on the same channel
        // never land on the same replacement slot, while channels stay
        // independent of each other.
        let mut used_by_channel: HashMap<String, UsedSlots> = HashMap::new();

        for group in groups {
            outcome.checked += group.members.len();

            let survivor = &group.members[0];
            let movers: Vec<_> = group
                .members
                .iter()
                .skip(1)
                .filter(|m| m.state == PostState::Queue)
                .collect();
            let untouchable = group.members.len() - 1 - movers.len();
            if untouchable > 0 {
                info!(
                    channel_id = group.channel_id,
                    minute = %group.minute,
                    untouchable,
                    "duplicate group contains terminal-state members, leaving them in place"
                );
                outcome.skipped += untouchable;
            }
            if movers.is_empty() {
                continue;
            }

            let channel = match db::channel_by_id(self.pool, &group.channel_id).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    warn!(channel_id = group.channel_id, "channel not found, skipping group");
                    outcome.failed += movers.len();
                    continue;
                }
                Err(err) => {
                    warn!(?err, channel_id = group.channel_id, "failed to load channel");
                    outcome.failed += movers.len();
                    continue;
                }
            };
            if channel.posting_times.is_empty() {
                warn!(
                    channel_id = channel.id,
                    "no posting times configured, cannot reschedule duplicates"
                );
                outcome.skipped += movers.len();
                continue;
            }

            let used = used_by_channel.entry(channel.id.clone()).or_default();
            for post in movers {
                let slot = match find_available_slots(
                    self.pool,
                    self.clock,
                    &self.slot_query(&channel, SearchMode::FromEnd),
                    used,
                )
                .await
                {
                    Ok(slots) => slots.into_iter().next(),
                    Err(err) => {
                        warn!(?err, post_id = post.id, "slot search failed");
                        outcome.failed += 1;
                        continue;
                    }
                };
                let Some(slot) = slot else {
                    warn!(post_id = post.id, "no available slot for duplicate post");
                    outcome.failed += 1;
                    continue;
                };
                match self
                    .reschedule_post_guarded(&post.id, &channel, slot, used)
                    .await
                {
                    Ok(landed) => {
                        info!(
                            post_id = post.id,
                            survivor = survivor.id,
                            from = %group.minute,
                            to = %landed,
                            "rescheduled duplicate post"
                        );
                        outcome.rescheduled += 1;
                    }
                    Err(err) => {
                        warn!(?err, post_id = post.id, "failed to reschedule duplicate post");
                        outcome.failed += 1;
                    }
                }
            }
        }

        info!(
            rescheduled = outcome.rescheduled,
            failed = outcome.failed,
            "duplicate resolution finished"
        );
        Ok(outcome)
    }

    /// Move queued posts off time-of-day slots the channel no longer has
    /// configured, using the channel's current posting times.
    #[instrument(skip_all)]
    pub async fn resolve_invalid_slots(&self) -> Result<SweepOutcome> {
        let invalid = detector::find_invalid_slot_posts(self.pool, self.clock).await?;
        let mut outcome = SweepOutcome::default();
        outcome.checked = invalid.len();
        if invalid.is_empty() {
            info!("all posts sit on configured time slots");
            return Ok(outcome);
        }
        info!(found = invalid.len(), "rescheduling posts on invalid slots");

        let mut by_channel: BTreeMap<String, Vec<detector::InvalidSlotPost>> = BTreeMap::new();
        for finding in invalid {
            by_channel
                .entry(finding.post.channel_id.clone())
                .or_default()
                .push(finding);
        }

        for (channel_id, findings) in by_channel {
            let channel = match db::channel_by_id(self.pool, &channel_id).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    warn!(channel_id, "channel not found, skipping invalid-slot posts");
                    outcome.failed += findings.len();
                    continue;
                }
                Err(err) => {
                    warn!(?err, channel_id, "failed to load channel");
                    outcome.failed += findings.len();
                    continue;
                }
            };

            let mut used = UsedSlots::new();
            for finding in findings {
                let post = &finding.post;
                let slot = match find_available_slots(
                    self.pool,
                    self.clock,
                    &self.slot_query(&channel, SearchMode::FromEnd),
                    &mut used,
                )
                .await
                {
                    Ok(slots) => slots.into_iter().next(),
                    Err(err) => {
                        warn!(?err, post_id = post.id, "slot search failed");
                        outcome.failed += 1;
                        continue;
                    }
                };
                let Some(slot) = slot else {
                    warn!(post_id = post.id, "no available slot for invalid-slot post");
                    outcome.failed += 1;
                    continue;
                };
                match self
                    .reschedule_post_guarded(&post.id, &channel, slot, &mut used)
                    .await
                {
                    Ok(landed) => {
                        info!(
                            post_id = post.id,
                            stale_offset = finding.actual_offset,
                            from = %post.publish_date,
                            to = %landed,
                            "moved post off invalid slot"
                        );
                        outcome.rescheduled += 1;
                    }
                    Err(err) => {
                        warn!(?err, post_id = post.id, "failed to move invalid-slot post");
                        outcome.failed += 1;
                    }
                }
            }
        }

        info!(
            rescheduled = outcome.rescheduled,
            failed = outcome.failed,
            "invalid-slot resolution finished"
        );
        Ok(outcome)
    }

    /// Reschedule every missed post on one channel to the end of its
    /// schedule, oldest first, and notify the owner once for the whole batch.
    #[instrument(skip_all, fields(channel_id = channel.id))]
    pub async fn reschedule_missed_for_channel(&self, channel: &Channel) -> Result<SweepOutcome> {
        let missed = detector::missed_posts(self.pool, self.clock, &channel.id).await?;
        let mut outcome = SweepOutcome::default();
        outcome.checked = missed.len();
        if missed.is_empty() {
            return Ok(outcome);
        }

        if channel.posting_times.is_empty() {
            // Never invent a fallback time; the posts stay put.
            warn!(
                channel_id = channel.id,
                missed = missed.len(),
                "no posting times configured, cannot reschedule missed posts"
            );
            outcome.skipped = missed.len();
            return Ok(outcome);
        }

        info!(missed = missed.len(), "rescheduling missed posts");
        let mut used = UsedSlots::new();
        let mut remaining = missed.len();
        for post in &missed {
            let slot = match find_available_slots(
                self.pool,
                self.clock,
                &self.slot_query(channel, SearchMode::FromEnd),
                &mut used,
            )
            .await
            {
                Ok(slots) => slots.into_iter().next(),
                Err(err) => {
                    warn!(?err, post_id = post.id, "slot search failed");
                    outcome.failed += 1;
                    remaining -= 1;
                    continue;
                }
            };
            let Some(slot) = slot else {
                // Capacity exhausted; leave the rest for the next sweep.
                warn!(
                    post_id = post.id,
                    abandoned = remaining,
                    "no available slot, stopping missed-post reschedule"
                );
                outcome.skipped += remaining;
                break;
            };
            match self
                .reschedule_post_guarded(&post.id, channel, slot, &mut used)
                .await
            {
                Ok(landed) => {
                    info!(
                        post_id = post.id,
                        from = %post.publish_date,
                        to = %landed,
                        "rescheduled missed post"
                    );
                    outcome.rescheduled += 1;
                }
                Err(err) => {
                    warn!(?err, post_id = post.id, "failed to reschedule missed post");
                    outcome.failed += 1;
                }
            }
            remaining -= 1;
        }

        if outcome.rescheduled > 0 {
            let summary = format!(
                "{} missed {} been rescheduled for {} ({}) to the next available {}.",
                outcome.rescheduled,
                if outcome.rescheduled == 1 {
                    "post has"
                } else {
                    "posts have"
                },
                channel.name,
                channel.provider,
                if outcome.rescheduled == 1 {
                    "slot"
                } else {
                    "slots"
                },
            );
            if let Err(err) = self
                .notifier
                .notify_owner(&channel.organization_id, &summary)
                .await
            {
                warn!(?err, org_id = channel.organization_id, "owner notification failed");
            }
        }

        Ok(outcome)
    }

    /// Run the missed-post reschedule over every active channel, one channel
    /// at a time to bound load. A failing channel is logged and skipped.
    #[instrument(skip_all)]
    pub async fn reschedule_all_missed(&self) -> Result<SweepOutcome> {
        let channels = db::active_channels(self.pool).await?;
        let mut outcome = SweepOutcome::default();
        info!(channels = channels.len(), "checking channels for missed posts");
        for channel in &channels {
            match self.reschedule_missed_for_channel(channel).await {
                Ok(partial) => outcome.merge(partial),
                Err(err) => {
                    warn!(?err, channel_id = channel.id, "missed-post check failed for channel");
                    outcome.failed += 1;
                }
            }
        }
        info!(
            rescheduled = outcome.rescheduled,
            failed = outcome.failed,
            "missed-post reschedule finished"
        );
        Ok(outcome)
    }

    /// Ensure every queued post due within the sync horizon has a pending
    /// delivery job with the right delay. Delete-then-insert keeps this
    /// idempotent: running it twice changes nothing.
    #[instrument(skip_all)]
    pub async fn sync_queue_jobs(&self) -> Result<SweepOutcome> {
        let posts =
            detector::posts_within_sync_horizon(self.pool, self.clock, self.sync_horizon_days)
                .await?;
        let mut outcome = SweepOutcome::default();
        outcome.checked = posts.len();
        info!(posts = posts.len(), "syncing delivery jobs with database");

        for post in &posts {
            match self.ensure_enqueued(post.id.as_str(), post.publish_date).await {
                Ok(true) => outcome.rescheduled += 1,
                Ok(false) => outcome.skipped += 1,
                Err(err) => {
                    warn!(?err, post_id = post.id, "failed to sync delivery job");
                    outcome.failed += 1;
                }
            }
        }

        info!(
            synced = outcome.rescheduled,
            already_pending = outcome.skipped,
            failed = outcome.failed,
            "queue sync finished"
        );
        Ok(outcome)
    }

    /// Re-enqueue queued posts due within the next three hours whose
    /// delivery job has gone missing.
    #[instrument(skip_all)]
    pub async fn check_missing_queues(&self) -> Result<SweepOutcome> {
        let posts = detector::upcoming_posts_3h(self.pool, self.clock).await?;
        self.requeue_missing(&posts, false).await
    }

    /// Posts that came due 15-30 minutes ago with no job left: enqueue them
    /// immediately (delay 0).
    #[instrument(skip_all)]
    pub async fn check_pending_posts(&self) -> Result<SweepOutcome> {
        let posts = detector::pending_posts_15m_back(self.pool, self.clock).await?;
        self.requeue_missing(&posts, true).await
    }

    async fn requeue_missing(
        &self,
        posts: &[db::DuePost],
        immediate: bool,
    ) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();
        outcome.checked = posts.len();
        for post in posts {
            let state = match self.queue.job_state(&post.id).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(?err, post_id = post.id, "failed to query job state");
                    outcome.failed += 1;
                    continue;
                }
            };
            if state.is_pending() {
                outcome.skipped += 1;
                continue;
            }
            let at = if immediate {
                self.clock.now()
            } else {
                post.publish_date
            };
            match self.ensure_enqueued_at(&post.id, at).await {
                Ok(()) => {
                    info!(post_id = post.id, publish = %post.publish_date, "re-enqueued missing delivery job");
                    outcome.rescheduled += 1;
                }
                Err(err) => {
                    warn!(?err, post_id = post.id, "failed to enqueue delivery job");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Returns true if a job had to be (re)created.
    async fn ensure_enqueued(&self, post_id: &str, publish: DateTime<Utc>) -> Result<bool> {
        if self.queue.job_state(post_id).await?.is_pending() {
            return Ok(false);
        }
        self.ensure_enqueued_at(post_id, publish).await?;
        Ok(true)
    }

    async fn ensure_enqueued_at(&self, post_id: &str, at: DateTime<Utc>) -> Result<()> {
        let delay_ms = (at - self.clock.now()).num_milliseconds().max(0);
        self.queue.delete_job(post_id).await?;
        self.queue
            .enqueue(post_id, delay_ms, json!({ "id": post_id }))
            .await
    }
}
