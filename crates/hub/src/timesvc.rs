//! Replies to `<topic>/gettime` queries with a localized timestamp
//! object on the rewritten `<topic>/set/time` command topic.

use chrono::{DateTime, Datelike, Offset, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::mqtt::GETTIME_SUFFIX;

#[derive(Debug, Serialize)]
pub(crate) struct TimePayload {
    pub abbreviation: String,
    pub client_ip: String,
    pub datetime: String,
    pub day_of_week: String,
    pub day_of_year: String,
    pub dst: bool,
    pub dst_from: Option<String>,
    pub dst_offset: i32,
    pub dst_until: Option<String>,
    pub raw_offset: i32,
    pub timezone: String,
    pub unixtime: i64,
    pub utc_datetime: String,
    pub utc_offset: String,
    pub week_number: String,
}

/// "flat/room/ctrl/gettime" -> "flat/room/ctrl/set/time"
pub(crate) fn reply_topic(topic: &str) -> String {
    format!("{}/set/time", topic.trim_end_matches(GETTIME_SUFFIX))
}

pub(crate) fn build_time_payload(tz: Tz, now: DateTime<Utc>) -> TimePayload {
    let local = now.with_timezone(&tz);
    let offset_secs = local.offset().fix().local_minus_utc();
    let (sign, abs) = if offset_secs < 0 {
        ('-', -offset_secs)
    } else {
        ('+', offset_secs)
    };

    TimePayload {
        abbreviation: format!("{}", local.offset()),
        client_ip: "0.0.0.0".to_string(),
        datetime: local.to_rfc3339(),
        day_of_week: local.weekday().number_from_monday().to_string(),
        day_of_year: local.ordinal().to_string(),
        dst: false,
        dst_from: None,
        dst_offset: 0,
        dst_until: None,
        raw_offset: offset_secs,
        timezone: tz.name().to_string(),
        unixtime: local.timestamp(),
        utc_datetime: now.to_rfc3339(),
        utc_offset: format!("{sign}{:02}:{:02}", abs / 3600, (abs % 3600) / 60),
        week_number: local.iso_week().week().to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Moscow;

    // 2025-04-06 19:37:28 UTC == 22:37:28 MSK
    const TEST_UNIX_TIME: i64 = 1743968248;

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_opt(TEST_UNIX_TIME, 0).unwrap()
    }

    #[test]
    fn reply_topic_rewrites_suffix() {
        assert_eq!(
            reply_topic("flat/room/ctrl/gettime"),
            "flat/room/ctrl/set/time"
        );
    }

    #[test]
    fn payload_carries_local_fields() {
        let p = build_time_payload(Moscow, fixed_now());
        assert_eq!(p.abbreviation, "MSK");
        assert_eq!(p.timezone, "Europe/Moscow");
        assert_eq!(p.unixtime, TEST_UNIX_TIME);
        assert_eq!(p.utc_offset, "+03:00");
        assert_eq!(p.raw_offset, 3 * 3600);
        // 2025-04-06 is a Sunday
        assert_eq!(p.day_of_week, "7");
        assert_eq!(p.day_of_year, "96");
        assert_eq!(p.week_number, "14");
        assert!(p.datetime.starts_with("2025-04-06T22:37:28"));
        assert!(p.utc_datetime.starts_with("2025-04-06T19:37:28"));
    }

    #[test]
    fn payload_serializes_to_expected_keys() {
        let v = serde_json::to_value(build_time_payload(Moscow, fixed_now())).unwrap();
        for key in [
            "abbreviation",
            "datetime",
            "day_of_week",
            "day_of_year",
            "raw_offset",
            "timezone",
            "unixtime",
            "utc_datetime",
            "utc_offset",
            "week_number",
        ] {
            assert!(v.get(key).is_some(), "missing key {key}");
        }
    }
}
