mod kafka;
mod postgres;
pub mod wire;

pub use kafka::KafkaEventSink;
pub use postgres::PostgresEventSink;

use async_trait::async_trait;

use crate::elements::Element;
use crate::error::SinkError;
use crate::types::{CanonicalEvent, SessionRecordingEvent};

/// Where canonicalized events land: the partitioned message log or, in its
/// absence, the relational row store. Mutually exclusive per deployment.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one canonical event. The row sink returns the inserted row id;
    /// the log sink has no row to speak of.
    async fn emit_event(
        &self,
        event: &CanonicalEvent,
        elements: &[Element],
    ) -> Result<Option<i64>, SinkError>;

    /// Publish one session-recording snapshot, verbatim.
    async fn emit_snapshot(&self, snapshot: &SessionRecordingEvent) -> Result<(), SinkError>;
}
