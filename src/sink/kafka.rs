use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::elements::Element;
use crate::error::SinkError;
use crate::formats::serialize_ch_datetime;
use crate::metrics_consts::{EVENTS_EMITTED, SNAPSHOTS_EMITTED};
use crate::producer::{LogMessage, MessageProducer};
use crate::sink::{wire, EventSink};
use crate::types::{CanonicalEvent, SessionRecordingEvent, TeamId};

/// The log sink: canonical events as protobuf on the events topic, session
/// recordings as JSON on their own topic, both keyed by event uuid so
/// per-event ordering rides on the partitioner.
pub struct KafkaEventSink {
    producer: Arc<dyn MessageProducer>,
    events_topic: String,
    recordings_topic: String,
}

#[derive(Serialize)]
struct SnapshotMessage<'a> {
    uuid: String,
    team_id: TeamId,
    distinct_id: &'a str,
    session_id: &'a str,
    snapshot_data: &'a str,
    #[serde(serialize_with = "serialize_ch_datetime")]
    timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(serialize_with = "serialize_ch_datetime")]
    created_at: chrono::DateTime<chrono::Utc>,
}

impl KafkaEventSink {
    pub fn new(producer: Arc<dyn MessageProducer>, config: &Config) -> Self {
        Self {
            producer,
            events_topic: config.events_topic.clone(),
            recordings_topic: config.session_recording_events_topic.clone(),
        }
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn emit_event(
        &self,
        event: &CanonicalEvent,
        _elements: &[Element],
    ) -> Result<Option<i64>, SinkError> {
        debug!(team_id = event.team_id, event = %event.event, "emitting event");
        let payload = wire::encode_event(event);
        self.producer
            .queue(
                &self.events_topic,
                vec![LogMessage::new(Some(event.uuid.to_string()), payload)],
            )
            .await?;
        metrics::counter!(EVENTS_EMITTED, "sink" => "log").increment(1);
        Ok(None)
    }

    async fn emit_snapshot(&self, snapshot: &SessionRecordingEvent) -> Result<(), SinkError> {
        let message = SnapshotMessage {
            uuid: snapshot.uuid.to_string(),
            team_id: snapshot.team_id,
            distinct_id: &snapshot.distinct_id,
            session_id: &snapshot.session_id,
            snapshot_data: &snapshot.snapshot_data,
            timestamp: snapshot.timestamp,
            created_at: snapshot.created_at,
        };
        let payload = serde_json::to_vec(&message)?;
        self.producer
            .queue(
                &self.recordings_topic,
                vec![LogMessage::new(Some(snapshot.uuid.to_string()), payload)],
            )
            .await?;
        metrics::counter!(SNAPSHOTS_EMITTED, "sink" => "log").increment(1);
        Ok(())
    }
}
