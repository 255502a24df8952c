//! Hourly history rollup. Buckets are wall-clock hours in the
//! configured local time zone.

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::db::Db;

/// Reported timestamps are accepted only when they land within 24h of
/// "now"; anything further off (dead RTC battery, 1970 epochs) falls
/// back to the current hour. Do not change the threshold without
/// checking controller firmware first.
const DRIFT_WINDOW_SECS: i64 = 24 * 3600;

fn truncate(dt: DateTime<Tz>) -> NaiveDateTime {
    dt.naive_local()
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing sub-hour fields cannot overflow")
}

/// The local wall-clock hour for a reported UNIX timestamp, or the
/// current hour when no timestamp is given or it is too far from now.
pub(crate) fn current_hour(tz: Tz, unix: Option<i64>) -> NaiveDateTime {
    current_hour_at(tz, Utc::now(), unix)
}

fn current_hour_at(tz: Tz, now: DateTime<Utc>, unix: Option<i64>) -> NaiveDateTime {
    let now_local = now.with_timezone(&tz);

    if let Some(secs) = unix {
        if let chrono::LocalResult::Single(input) = Utc.timestamp_opt(secs, 0) {
            if (input - now).num_seconds().abs() <= DRIFT_WINDOW_SECS {
                return truncate(input.with_timezone(&tz));
            }
        }
    }

    truncate(now_local)
}

/// Fold one observation into the device's bucket for the reported
/// hour. Best-effort from the reconciler's point of view; the caller
/// logs failures without failing the state upsert.
pub(crate) async fn record(
    db: &Db,
    tz: Tz,
    device_id: i64,
    value: f64,
    reported_unix: Option<i64>,
) -> Result<()> {
    let hour = current_hour(tz, reported_unix);
    db.upsert_history(device_id, hour, value).await
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono_tz::Europe::Moscow;

    // 2025-04-06 19:37:28 UTC == 22:37:28 MSK (UTC+3)
    const TEST_UNIX_TIME: i64 = 1743968248;

    fn msk_hour(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        // one hour after the test timestamp
        Utc.timestamp_opt(TEST_UNIX_TIME + 3600, 0).unwrap()
    }

    #[test]
    fn none_truncates_now() {
        let hour = current_hour_at(Moscow, fixed_now(), None);
        assert_eq!(hour, msk_hour(2025, 4, 6, 23));
    }

    #[test]
    fn recent_unix_time_truncates_to_its_own_local_hour() {
        let hour = current_hour_at(Moscow, fixed_now(), Some(TEST_UNIX_TIME));
        assert_eq!(hour, msk_hour(2025, 4, 6, 22));
    }

    #[test]
    fn unix_time_just_inside_window_accepted() {
        let now = fixed_now();
        let hour = current_hour_at(Moscow, now, Some(now.timestamp() - DRIFT_WINDOW_SECS + 60));
        assert_eq!(hour, msk_hour(2025, 4, 5, 23));
    }

    #[test]
    fn stale_unix_time_falls_back_to_current_hour() {
        // a week old — outside the 24h window
        let stale = TEST_UNIX_TIME - 7 * 24 * 3600;
        let hour = current_hour_at(Moscow, fixed_now(), Some(stale));
        assert_eq!(hour, msk_hour(2025, 4, 6, 23));
    }

    #[test]
    fn future_unix_time_outside_window_falls_back() {
        let future = TEST_UNIX_TIME + 3 * 24 * 3600;
        let hour = current_hour_at(Moscow, fixed_now(), Some(future));
        assert_eq!(hour, msk_hour(2025, 4, 6, 23));
    }

    #[test]
    fn sub_hour_fields_always_zeroed() {
        let hour = current_hour_at(Moscow, fixed_now(), Some(TEST_UNIX_TIME));
        assert_eq!(hour.minute(), 0);
        assert_eq!(hour.second(), 0);
        assert_eq!(hour.nanosecond(), 0);
    }
}
