//! The canonical-event wire format for the log sink: a length-delimited
//! protobuf message carrying sink-formatted timestamps.

use prost::Message;

use crate::error::SinkError;
use crate::formats::{format_ch_datetime, parse_ch_datetime};
use crate::types::CanonicalEvent;

#[derive(Clone, PartialEq, Message)]
pub struct WireEvent {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub event: String,
    /// JSON-serialized properties.
    #[prost(string, tag = "3")]
    pub properties: String,
    /// `YYYY-MM-DD HH:MM:SS.ffffff`
    #[prost(string, tag = "4")]
    pub timestamp: String,
    #[prost(int64, tag = "5")]
    pub team_id: i64,
    #[prost(string, tag = "6")]
    pub distinct_id: String,
    #[prost(string, tag = "7")]
    pub elements_chain: String,
    /// Same format as `timestamp`.
    #[prost(string, tag = "8")]
    pub created_at: String,
}

impl From<&CanonicalEvent> for WireEvent {
    fn from(event: &CanonicalEvent) -> Self {
        WireEvent {
            uuid: event.uuid.to_string(),
            event: event.event.clone(),
            properties: event.properties.clone(),
            timestamp: format_ch_datetime(event.timestamp),
            team_id: event.team_id as i64,
            distinct_id: event.distinct_id.clone(),
            elements_chain: event.elements_chain.clone(),
            created_at: format_ch_datetime(event.created_at),
        }
    }
}

pub fn encode_event(event: &CanonicalEvent) -> Vec<u8> {
    WireEvent::from(event).encode_to_vec()
}

pub fn decode_event(bytes: &[u8]) -> Result<CanonicalEvent, SinkError> {
    let wire = WireEvent::decode(bytes).map_err(|e| SinkError::Wire(format!("decode: {e}")))?;
    let uuid = wire
        .uuid
        .parse()
        .map_err(|e| SinkError::Wire(format!("uuid: {e}")))?;
    let timestamp = parse_ch_datetime(&wire.timestamp)
        .map_err(|e| SinkError::Wire(format!("timestamp: {e}")))?;
    let created_at = parse_ch_datetime(&wire.created_at)
        .map_err(|e| SinkError::Wire(format!("created_at: {e}")))?;
    Ok(CanonicalEvent {
        uuid,
        event: wire.event,
        properties: wire.properties,
        timestamp,
        team_id: wire.team_id as crate::types::TeamId,
        distinct_id: wire.distinct_id,
        elements_chain: wire.elements_chain,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn sample_event() -> CanonicalEvent {
        CanonicalEvent {
            uuid: Uuid::now_v7(),
            event: "pageview".to_string(),
            properties: r#"{"$browser":"Firefox"}"#.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::microseconds(654_321),
            team_id: 2,
            distinct_id: "d1".to_string(),
            elements_chain: "a:nth-child=\"1\"nth-of-type=\"0\"".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap(),
        }
    }

    #[test]
    fn test_wire_round_trip_is_lossless_to_microseconds() {
        let event = sample_event();
        let decoded = decode_event(&encode_event(&event)).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.timestamp.timestamp_subsec_micros(), 654_321);
    }

    #[test]
    fn test_wire_timestamp_format() {
        let wire = WireEvent::from(&sample_event());
        assert_eq!(wire.timestamp, "2024-01-01 00:00:00.654321");
        assert_eq!(wire.created_at, "2024-01-01 00:00:05.000000");
        assert_eq!(wire.team_id, 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_event(&[0xff, 0xff, 0xff]).is_err());
    }
}
