//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as fixed-width RFC3339 UTC strings
//! (`YYYY-MM-DDTHH:MM:SSZ`) so that SQL string comparison matches time order.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Format a timestamp in the storage format.
#[inline]
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current time in the storage format.
#[inline]
pub fn now_str() -> String {
    format_ts(Utc::now())
}

/// Cutoff timestamp `minutes` before `now`, in the storage format.
/// Saturates at the Unix epoch when the offset is out of range.
pub fn minutes_ago(now: DateTime<Utc>, minutes: i64) -> String {
    let cutoff = Duration::try_minutes(minutes.max(0))
        .and_then(|offset| now.checked_sub_signed(offset))
        .unwrap_or(DateTime::UNIX_EPOCH)
        .max(DateTime::UNIX_EPOCH);
    format_ts(cutoff)
}

/// Parse a stored timestamp. Accepts any RFC3339 value plus the legacy
/// `YYYY-MM-DD HH:MM:SS` form written by older deployments.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        assert_eq!(format_ts(dt), "2024-03-09T04:05:06Z");
    }

    #[test]
    fn test_string_order_matches_time_order() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 9, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert!(format_ts(earlier) < format_ts(later));
        assert_eq!(minutes_ago(later, 1), "2024-01-01T09:59:00Z");
    }

    #[test]
    fn test_minutes_ago_saturates() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(minutes_ago(now, i64::MAX), "1970-01-01T00:00:00Z");
        assert_eq!(minutes_ago(now, 60 * 24 * 365 * 100), "1970-01-01T00:00:00Z");
        assert_eq!(minutes_ago(now, -5), "2024-01-01T10:00:00Z");
    }

    #[test]
    fn test_parse_legacy_format() {
        let parsed = parse_ts("2024-05-01 12:30:00").unwrap();
        assert_eq!(format_ts(parsed), "2024-05-01T12:30:00Z");
        assert!(parse_ts("yesterday").is_none());
    }
}
