//! Pure slot arithmetic: converting between a channel's recurring
//! time-of-day posting offsets and concrete UTC instants.
//!
//! Both the slot finder and the conflict detector go through these functions
//! so their notions of "a slot" never diverge.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};

pub const MINUTES_PER_DAY: i64 = 24 * 60;

/// Project a posting offset (minutes since local midnight) onto a calendar
/// day, yielding the concrete UTC instant. `timezone_offset` is the owning
/// user's offset in minutes east of UTC.
pub fn project(offset_minutes: i64, day: NaiveDate, timezone_offset: i64) -> DateTime<Utc> {
    let midnight = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).expect("midnight exists"));
    midnight + Duration::minutes(offset_minutes - timezone_offset)
}

/// Inverse projection: the posting offset (minutes since local midnight)
/// an instant corresponds to for a user at `timezone_offset`.
pub fn offset_of(instant: DateTime<Utc>, timezone_offset: i64) -> i64 {
    let minutes_utc = i64::from(instant.hour()) * 60 + i64::from(instant.minute());
    (minutes_utc + timezone_offset).rem_euclid(MINUTES_PER_DAY)
}

/// Truncate an instant to its UTC minute. All persisted publish dates and
/// all occupancy checks work at this precision.
pub fn minute_floor(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("second/nanosecond truncation is always valid")
}

/// The half-open one-minute window `[floor, floor + 1m)` around an instant,
/// used for minute-level occupancy queries.
pub fn minute_window(instant: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = minute_floor(instant);
    (start, start + Duration::minutes(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn project_utc_user() {
        // 09:00 local for a UTC user is 09:00 UTC.
        let at = project(9 * 60, day(2025, 3, 10), 0);
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn project_respects_timezone_offset() {
        // 09:00 local at UTC+2 is 07:00 UTC.
        let at = project(9 * 60, day(2025, 3, 10), 120);
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap());

        // 01:00 local at UTC+3 crosses into the previous UTC day.
        let at = project(60, day(2025, 3, 10), 180);
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 3, 9, 22, 0, 0).unwrap());
    }

    #[test]
    fn offset_of_is_inverse_of_project() {
        for tz in [-480, -120, 0, 60, 330, 540] {
            for offset in [0, 1, 9 * 60, 15 * 60 + 30, MINUTES_PER_DAY - 1] {
                let at = project(offset, day(2025, 7, 1), tz);
                assert_eq!(offset_of(at, tz), offset, "tz={tz} offset={offset}");
            }
        }
    }

    #[test]
    fn minute_floor_drops_seconds() {
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 42).unwrap();
        assert_eq!(
            minute_floor(at),
            Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn minute_window_is_half_open() {
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 42).unwrap();
        let (start, end) = minute_window(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 3, 10, 9, 1, 0).unwrap());
    }
}
