// Timestamp wire formats. The log sink and the mirror messages carry
// ClickHouse-style civil datetimes at microsecond precision; the row sink
// binds `DateTime<Utc>` directly and lets postgres render ISO-8601.
use chrono::{DateTime, NaiveDateTime, ParseError, Utc};
use serde::Serializer;

pub const CH_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn format_ch_datetime(ts: DateTime<Utc>) -> String {
    ts.format(CH_FORMAT).to_string()
}

pub fn parse_ch_datetime(input: &str) -> Result<DateTime<Utc>, ParseError> {
    NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S%.f").map(|d| d.and_utc())
}

pub fn serialize_ch_datetime<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_ch_datetime(*ts))
}
