use chrono::{DateTime, TimeZone, Utc};
use postline::clock::FixedClock;
use postline::db::{self, NewChannel, NewPost};
use postline::finder::{find_available_slots, SearchMode, SlotQuery, UsedSlots};
use postline::model::PostState;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn insert_channel(pool: &sqlx::SqlitePool, id: &str, tz: i64, times: Vec<i64>) {
    db::insert_channel(
        pool,
        &NewChannel {
            id: id.into(),
            organization_id: "org-1".into(),
            name: format!("channel {id}"),
            provider: "mastodon".into(),
            timezone_offset: tz,
            posting_times: times,
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

fn query<'a>(channel_id: &'a str, count: usize, times: &'a [i64], mode: SearchMode) -> SlotQuery<'a> {
    SlotQuery {
        channel_id,
        org_id: "org-1",
        count,
        posting_times: times,
        mode,
        timezone_offset: 0,
        occupied_by: &[PostState::Queue],
        lookahead_days: 90,
    }
}

#[tokio::test]
async fn skips_past_offsets_and_walks_days_in_order() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1", 0, vec![540, 720]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());

    let times = [540, 720];
    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query("ch-1", 3, &times, SearchMode::FromNow), &mut used)
        .await
        .unwrap();

    // 09:00 today is already gone; the walk resumes at 12:00 and rolls over.
    assert_eq!(
        slots,
        vec![
            Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 16, 12, 0, 0).unwrap(),
        ]
    );
    assert!(slots.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn occupied_minutes_are_not_offered() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1", 0, vec![540, 720]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
    insert_queue_post(
        &pool,
        "p-1",
        "ch-1",
        Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
    )
    .await;

    let times = [540, 720];
    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query("ch-1", 1, &times, SearchMode::FromNow), &mut used)
        .await
        .unwrap();

    assert_eq!(
        slots,
        vec![Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap()]
    );
}

#[tokio::test]
async fn used_slots_are_never_reissued_within_a_run() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1", 0, vec![540]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());

    let times = [540];
    let mut used = UsedSlots::new();
    let first = find_available_slots(&pool, &clock, &query("ch-1", 1, &times, SearchMode::FromNow), &mut used)
        .await
        .unwrap();
    let second = find_available_slots(&pool, &clock, &query("ch-1", 1, &times, SearchMode::FromNow), &mut used)
        .await
        .unwrap();

    assert_eq!(first, vec![Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()]);
    assert_eq!(second, vec![Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap()]);
    assert_eq!(used.len(), 2);
}

#[tokio::test]
async fn from_end_starts_the_day_after_the_latest_queued_post() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1", 0, vec![540]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());
    insert_queue_post(
        &pool,
        "p-1",
        "ch-1",
        Utc.with_ymd_and_hms(2026, 1, 20, 9, 0, 0).unwrap(),
    )
    .await;

    let times = [540];
    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query("ch-1", 1, &times, SearchMode::FromEnd), &mut used)
        .await
        .unwrap();

    assert_eq!(
        slots,
        vec![Utc.with_ymd_and_hms(2026, 1, 21, 9, 0, 0).unwrap()]
    );
}

#[tokio::test]
async fn from_end_stays_past_the_schedule_on_positive_offsets() {
    let pool = setup_pool().await;
    // UTC+3 channel posting at 01:00 local, which is 22:00 UTC the day
    // before. Starting the scan on the next calendar day would still land
    // before a late-evening UTC post.
    insert_channel(&pool, "ch-1", 180, vec![60]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());
    let latest = Utc.with_ymd_and_hms(2026, 1, 20, 23, 0, 0).unwrap();
    insert_queue_post(&pool, "p-1", "ch-1", latest).await;

    let times = [60];
    let mut query = query("ch-1", 2, &times, SearchMode::FromEnd);
    query.timezone_offset = 180;
    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query, &mut used)
        .await
        .unwrap();

    assert_eq!(
        slots,
        vec![
            Utc.with_ymd_and_hms(2026, 1, 21, 22, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 22, 22, 0, 0).unwrap(),
        ]
    );
    assert!(slots.iter().all(|&s| s > latest));
}

#[tokio::test]
async fn from_end_falls_back_to_now_on_an_empty_schedule() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1", 0, vec![540]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());

    let times = [540];
    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query("ch-1", 1, &times, SearchMode::FromEnd), &mut used)
        .await
        .unwrap();

    assert_eq!(
        slots,
        vec![Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()]
    );
}

#[tokio::test]
async fn timezone_offset_shifts_slots_into_utc() {
    let pool = setup_pool().await;
    // UTC-5 channel posting at 10:00 local, which is 15:00 UTC.
    insert_channel(&pool, "ch-1", -300, vec![600]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());

    let times = [600];
    let mut query = query("ch-1", 1, &times, SearchMode::FromNow);
    query.timezone_offset = -300;
    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query, &mut used)
        .await
        .unwrap();

    assert_eq!(
        slots,
        vec![Utc.with_ymd_and_hms(2026, 1, 15, 15, 0, 0).unwrap()]
    );
}

#[tokio::test]
async fn exhausted_lookahead_returns_fewer_slots_than_requested() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1", 0, vec![540]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());

    let times = [540];
    let mut query = query("ch-1", 5, &times, SearchMode::FromNow);
    query.lookahead_days = 2;
    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query, &mut used)
        .await
        .unwrap();

    assert_eq!(slots.len(), 2);
}

#[tokio::test]
async fn no_posting_times_means_no_slots() {
    let pool = setup_pool().await;
    insert_channel(&pool, "ch-1", 0, vec![]).await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());

    let mut used = UsedSlots::new();
    let slots = find_available_slots(&pool, &clock, &query("ch-1", 3, &[], SearchMode::FromNow), &mut used)
        .await
        .unwrap();

    assert!(slots.is_empty());
    assert!(used.is_empty());
}
