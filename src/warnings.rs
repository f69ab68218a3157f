//! The error sink. Swallowed errors and suspicious inputs are reported here
//! with the offending event attached, so they are observable downstream
//! without failing the event.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::formats::serialize_ch_datetime;
use crate::metrics_consts::INGESTION_WARNINGS;
use crate::producer::{LogMessage, MessageProducer};
use crate::types::TeamId;

#[derive(Debug, Clone, Serialize)]
pub struct IngestionWarning {
    pub team_id: TeamId,
    pub source: String,
    #[serde(rename = "type")]
    pub warning_type: String,
    pub details: String,
    #[serde(serialize_with = "serialize_ch_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl IngestionWarning {
    pub fn new(
        team_id: TeamId,
        source: String,
        warning_type: String,
        details: HashMap<String, Value>,
    ) -> Self {
        let details = serde_json::to_string(&details).unwrap_or_else(|_| "{}".to_string());
        Self {
            team_id,
            source,
            warning_type,
            details,
            timestamp: Utc::now(),
        }
    }
}

/// A warning captured by a pure computation (e.g. the timestamp reconciler),
/// reported afterwards by a caller that holds the producer.
#[derive(Debug, Clone)]
pub struct WarningReport {
    pub warning_type: &'static str,
    pub details: HashMap<String, Value>,
}

/// Queue a warning to the error sink. Reporting is strictly best-effort: with
/// no producer configured, or on a produce failure, the warning is logged and
/// dropped.
pub async fn report_ingestion_warning(
    producer: Option<&Arc<dyn MessageProducer>>,
    topic: &str,
    team_id: TeamId,
    source: &str,
    warning_type: &str,
    details: HashMap<String, Value>,
) {
    metrics::counter!(INGESTION_WARNINGS, "type" => warning_type.to_string()).increment(1);

    let warning = IngestionWarning::new(
        team_id,
        source.to_string(),
        warning_type.to_string(),
        details,
    );

    let Some(producer) = producer else {
        warn!(
            team_id = team_id,
            warning_type = warning_type,
            details = %warning.details,
            "ingestion warning (no producer configured)"
        );
        return;
    };

    let payload = match serde_json::to_vec(&warning) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("failed to serialize ingestion warning: {e}");
            return;
        }
    };

    if let Err(e) = producer
        .queue(topic, vec![LogMessage::new(None, payload)])
        .await
    {
        warn!(
            team_id = team_id,
            warning_type = warning_type,
            "failed to queue ingestion warning: {e}"
        );
    }
}
