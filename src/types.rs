use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type TeamId = i32;

/// Input properties are an open, untrusted map. No per-team schema is
/// enforced; values round-trip through JSON.
pub type Properties = serde_json::Map<String, Value>;

/// The raw event shape handed to the worker pool and the processor, as
/// produced by client SDKs and (optionally) rewritten by plugin code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginEvent {
    pub distinct_id: String,
    pub ip: Option<String>,
    pub site_url: String,
    pub team_id: TeamId,
    pub now: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub event: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(rename = "$set", skip_serializing_if = "Option::is_none")]
    pub set: Option<Properties>,
    #[serde(rename = "$set_once", skip_serializing_if = "Option::is_none")]
    pub set_once: Option<Properties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// The post-processing event representation written to a sink.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalEvent {
    pub uuid: Uuid,
    pub event: String,
    /// JSON-serialized properties, exactly as published.
    pub properties: String,
    pub timestamp: DateTime<Utc>,
    pub team_id: TeamId,
    pub distinct_id: String,
    pub elements_chain: String,
    pub created_at: DateTime<Utc>,
}

/// A session-recording payload. Not action-matched; emitted verbatim.
#[derive(Clone, Debug)]
pub struct SessionRecordingEvent {
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub distinct_id: String,
    pub session_id: String,
    /// JSON-serialized snapshot payload.
    pub snapshot_data: String,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// The canonical identity a set of distinct ids collapses to.
#[derive(Clone, Debug)]
pub struct Person {
    pub id: i64,
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    pub is_identified: bool,
    pub is_user_id: Option<i32>,
}

/// Per-team configuration, read-only from the core's perspective.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: TeamId,
    pub project_id: Option<i64>,
    pub organization_id: Uuid,
    pub uuid: Uuid,
    pub name: String,
    pub api_token: String,
    pub anonymize_ips: bool,
    pub session_recording_opt_in: bool,
}

impl Team {
    pub fn project_id(&self) -> i64 {
        // Payloads from before projects existed carry no project id; the
        // team id doubles as one.
        self.project_id.unwrap_or(self.id as i64)
    }
}

/// Read-only organization record; consulted for feature gating only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub available_product_features: Option<Value>,
}

impl Organization {
    pub fn has_feature(&self, key: &str) -> bool {
        let Some(Value::Array(features)) = &self.available_product_features else {
            return false;
        };
        features.iter().any(|f| match f {
            Value::String(s) => s == key,
            Value::Object(o) => o.get("key").and_then(Value::as_str) == Some(key),
            _ => false,
        })
    }
}
