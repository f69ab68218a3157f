use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};
use serde_json::json;

use crate::warnings::WarningReport;

const FUTURE_EVENT_HOURS_CUTOFF_MILLIS: i64 = 23 * 3600 * 1000; // 23 hours

/// Derive the canonical event timestamp from untrusted client clocks.
///
/// Rules, in order:
/// 1. `timestamp` and `sent_at` both present: `now + (timestamp - sent_at)`,
///    correcting client clock skew. An unparseable `timestamp` falls through.
/// 2. `timestamp` present alone: the parsed timestamp.
/// 3. `offset` present (milliseconds): `now - offset`.
/// 4. Otherwise `now`.
///
/// Results more than 23 hours in the future clamp to `now`; results outside
/// year 0..=9999 collapse to the epoch. Every adjustment the client would not
/// expect is returned as a warning for the caller to report to the error sink.
pub fn parse_event_timestamp(
    timestamp: Option<&str>,
    offset: Option<i64>,
    sent_at: Option<DateTime<Utc>>,
    ignore_sent_at: bool,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Vec<WarningReport>) {
    let mut warnings = Vec::new();
    let effective_sent_at = if ignore_sent_at { None } else { sent_at };

    let mut parsed_ts = handle_timestamp(timestamp, offset, effective_sent_at, now, &mut warnings);

    // Clamp future events to now
    let now_diff = parsed_ts.signed_duration_since(now).num_milliseconds();
    if now_diff > FUTURE_EVENT_HOURS_CUTOFF_MILLIS {
        warnings.push(WarningReport {
            warning_type: "event_timestamp_in_future",
            details: HashMap::from([
                ("timestamp".to_string(), json!(timestamp)),
                ("sentAt".to_string(), json!(sent_at.map(|d| d.to_rfc3339()))),
                ("offset".to_string(), json!(offset)),
                ("now".to_string(), json!(now.to_rfc3339())),
                ("result".to_string(), json!(parsed_ts.to_rfc3339())),
            ]),
        });
        parsed_ts = now;
    }

    if parsed_ts.year() < 0 || parsed_ts.year() > 9999 {
        warnings.push(WarningReport {
            warning_type: "ignored_invalid_timestamp",
            details: HashMap::from([
                ("timestamp".to_string(), json!(timestamp)),
                ("reason".to_string(), json!("out_of_bounds")),
            ]),
        });
        parsed_ts = DateTime::UNIX_EPOCH;
    }

    (parsed_ts, warnings)
}

fn handle_timestamp(
    timestamp: Option<&str>,
    offset: Option<i64>,
    sent_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    warnings: &mut Vec<WarningReport>,
) -> DateTime<Utc> {
    if let Some(timestamp_str) = timestamp {
        match parse_date(timestamp_str) {
            Some(parsed) => {
                if let Some(sent_at) = sent_at {
                    // skew = sent_at - now, so now + (timestamp - sent_at)
                    // lands the event where the client meant it.
                    return now + parsed.signed_duration_since(sent_at);
                }
                return parsed;
            }
            None => {
                warnings.push(WarningReport {
                    warning_type: "ignored_invalid_timestamp",
                    details: HashMap::from([
                        ("timestamp".to_string(), json!(timestamp_str)),
                        ("reason".to_string(), json!("unparseable")),
                    ]),
                });
            }
        }
    }

    if let Some(offset_ms) = offset {
        return now - Duration::milliseconds(offset_ms);
    }

    now
}

/// Parse an ISO-8601 timestamp, also accepting the civil
/// `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` forms (assumed UTC).
fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    // Civil datetime with T but no timezone, e.g. "2023-01-01T12:00:00"
    if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_no_inputs_returns_now() {
        let now = utc("2023-01-01T12:00:00Z");
        let (result, warnings) = parse_event_timestamp(None, None, None, false, now);
        assert_eq!(result, now);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_clock_skew_correction() {
        // now + (timestamp - sent_at): client clock is 5s ahead of server
        let now = utc("2024-01-01T00:00:05Z");
        let sent_at = utc("2023-12-31T23:59:55Z");
        let (result, warnings) = parse_event_timestamp(
            Some("2023-12-31T23:59:50Z"),
            None,
            Some(sent_at),
            false,
            now,
        );
        assert_eq!(result, utc("2024-01-01T00:00:00Z"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_timestamp_without_sent_at_used_directly() {
        let now = utc("2021-10-30T01:44:00Z");
        let (result, _) =
            parse_event_timestamp(Some("2021-10-30T03:02:00.000Z"), None, None, false, now);
        assert_eq!(result, utc("2021-10-30T03:02:00Z"));
    }

    #[test]
    fn test_ignore_sent_at() {
        let now = utc("2021-11-29T01:44:00Z");
        let sent_at = utc("2021-10-30T03:12:00Z");
        let (result, _) = parse_event_timestamp(
            Some("2021-10-30T03:02:00.000Z"),
            None,
            Some(sent_at),
            true,
            now,
        );
        assert_eq!(result, utc("2021-10-30T03:02:00Z"));
    }

    #[test]
    fn test_offset_subtracted_from_now() {
        let now = utc("2021-10-29T01:44:00Z");
        let (result, _) = parse_event_timestamp(None, Some(6000), None, false, now);
        assert_eq!(result, utc("2021-10-29T01:43:54Z"));
    }

    #[test]
    fn test_timestamp_takes_precedence_over_offset() {
        let now = utc("2021-10-29T01:44:00Z");
        let (result, _) =
            parse_event_timestamp(Some("2021-10-29T01:00:00Z"), Some(6000), None, false, now);
        assert_eq!(result, utc("2021-10-29T01:00:00Z"));
    }

    #[test]
    fn test_unparseable_timestamp_falls_through_to_offset() {
        let now = utc("2020-08-12T01:02:00Z");
        let (result, warnings) = parse_event_timestamp(Some("notISO"), Some(6000), None, false, now);
        assert_eq!(result, now - Duration::milliseconds(6000));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, "ignored_invalid_timestamp");
    }

    #[test]
    fn test_unparseable_timestamp_falls_back_to_now() {
        let now = utc("2020-08-12T01:02:00Z");
        let (result, warnings) = parse_event_timestamp(Some("notISO"), None, None, false, now);
        assert_eq!(result, now);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_future_event_clamps_to_now() {
        let now = utc("2023-01-01T12:00:00Z");
        let (result, warnings) =
            parse_event_timestamp(Some("2023-01-02T12:00:00Z"), None, None, false, now);
        assert_eq!(result, now);
        assert_eq!(warnings[0].warning_type, "event_timestamp_in_future");
    }

    #[test]
    fn test_negative_offset_future_clamps_to_now() {
        let now = utc("2021-10-29T01:00:00Z");
        let (result, warnings) = parse_event_timestamp(None, Some(-82_860_000), None, false, now);
        assert_eq!(result, now);
        assert_eq!(warnings[0].warning_type, "event_timestamp_in_future");
    }

    #[test]
    fn test_extreme_offset_collapses_to_epoch() {
        let now = utc("2021-10-28T01:10:00Z");
        let (result, _) = parse_event_timestamp(None, Some(600_000_000_000_000), None, false, now);
        assert_eq!(result.year(), 1970);
    }

    #[test]
    fn test_idempotent_for_same_inputs() {
        let now = utc("2023-06-15T08:30:00Z");
        let sent_at = utc("2023-06-15T08:30:02Z");
        let first = parse_event_timestamp(
            Some("2023-06-15T08:29:58Z"),
            None,
            Some(sent_at),
            false,
            now,
        );
        let second = parse_event_timestamp(
            Some("2023-06-15T08:29:58Z"),
            None,
            Some(sent_at),
            false,
            now,
        );
        assert_eq!(first.0, second.0);
    }

    #[test]
    fn test_parse_date_variants() {
        for input in [
            "2021-10-29",
            "2021-10-29 00:00:00",
            "2021-10-29 00:00:00.000000",
            "2021-10-29T00:00:00.000Z",
            "2021-10-29T00:00:00.000+00:00",
            "2021-10-29T00:00:00.000",
        ] {
            let parsed = parse_date(input).unwrap_or_else(|| panic!("failed to parse {input}"));
            assert_eq!(parsed.year(), 2021);
            assert_eq!(parsed.month(), 10);
            assert_eq!(parsed.day(), 29);
        }
        assert!(parse_date("invalid-date").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn test_timezone_conversion() {
        let parsed = parse_date("2023-01-01T12:00:00+03:00").unwrap();
        assert_eq!(
            parsed,
            Utc.with_ymd_and_hms(2023, 1, 1, 9, 0, 0).unwrap()
        );
    }
}
