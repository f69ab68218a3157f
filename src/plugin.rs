//! The seam to user-supplied transformation code. The core treats the plugin
//! VM as an opaque `transform(event) -> event | null` with a timeout; each
//! worker owns its own VM instance.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::error::PluginError;
use crate::formats::serialize_ch_datetime;
use crate::producer::{LogMessage, MessageProducer};
use crate::types::{PluginEvent, TeamId};

#[async_trait]
pub trait EventTransformer: Send {
    /// Returns the transformed event, or `None` to drop it.
    async fn transform(&mut self, event: PluginEvent) -> Result<Option<PluginEvent>, PluginError>;
}

/// Builds one VM instance per worker. Instances are never shared or migrated
/// across workers.
pub trait EventTransformerFactory: Send + Sync {
    fn create(&self) -> Box<dyn EventTransformer>;
}

/// Pass-through transformer for deployments without plugin code.
pub struct NoopTransformer;

#[async_trait]
impl EventTransformer for NoopTransformer {
    async fn transform(&mut self, event: PluginEvent) -> Result<Option<PluginEvent>, PluginError> {
        Ok(Some(event))
    }
}

impl EventTransformerFactory for NoopTransformer {
    fn create(&self) -> Box<dyn EventTransformer> {
        Box::new(NoopTransformer)
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub enum PluginLogEntrySource {
    #[serde(rename = "SYSTEM")]
    System,
    #[serde(rename = "PLUGIN")]
    Plugin,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub enum PluginLogEntryType {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "ERROR")]
    Error,
}

/// One line of the plugin log pipeline, written when a VM invocation fails.
#[derive(Clone, Debug, Serialize)]
pub struct PluginLogEntry {
    pub id: Uuid,
    pub team_id: TeamId,
    pub plugin_id: Option<i64>,
    pub plugin_config_id: Option<i64>,
    #[serde(serialize_with = "serialize_ch_datetime")]
    pub timestamp: DateTime<Utc>,
    pub source: PluginLogEntrySource,
    #[serde(rename = "type")]
    pub entry_type: PluginLogEntryType,
    pub message: String,
    pub instance_id: Uuid,
}

impl PluginLogEntry {
    pub fn error(team_id: TeamId, instance_id: Uuid, message: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            team_id,
            plugin_id: None,
            plugin_config_id: None,
            timestamp: Utc::now(),
            source: PluginLogEntrySource::Plugin,
            entry_type: PluginLogEntryType::Error,
            message,
            instance_id,
        }
    }
}

/// Best-effort publication of a plugin log entry; never fails the task.
pub async fn record_plugin_log_entry(
    producer: Option<&Arc<dyn MessageProducer>>,
    topic: &str,
    entry: PluginLogEntry,
) {
    let Some(producer) = producer else {
        error!(
            team_id = entry.team_id,
            "plugin log entry (no producer configured): {}", entry.message
        );
        return;
    };
    let Ok(payload) = serde_json::to_vec(&entry) else {
        error!("failed to serialize plugin log entry");
        return;
    };
    if let Err(e) = producer
        .queue(topic, vec![LogMessage::new(Some(entry.id.to_string()), payload)])
        .await
    {
        error!("failed to queue plugin log entry: {e}");
    }
}
