//! Canonicalizes event payloads and publishes them to the configured sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::definitions::DefinitionsManager;
use crate::elements::{elements_to_string, extract_elements, Element};
use crate::error::{IngestionError, StoreError};
use crate::metrics_consts::PERSON_CREATE_RACES;
use crate::person::{PersonManager, PersonStore};
use crate::sink::EventSink;
use crate::team_manager::TeamManager;
use crate::types::{CanonicalEvent, Properties, SessionRecordingEvent, Team, TeamId};

const MAX_EVENT_NAME_LENGTH: usize = 200;

/// Event properties promoted into `$initial_*` first-touch person properties.
const FIRST_TOUCH_PROPERTIES: [&str; 10] = [
    "$browser",
    "$browser_version",
    "$device_type",
    "$current_url",
    "$pathname",
    "$os",
    "$referrer",
    "$referring_domain",
    "$gclid",
    "$fbclid",
];

pub struct EventEmitter {
    team_manager: Arc<TeamManager>,
    definitions: Arc<DefinitionsManager>,
    person_store: Arc<PersonStore>,
    person_manager: Arc<PersonManager>,
    sink: Arc<dyn EventSink>,
}

/// What `capture` produced: the canonical event as published, the row id when
/// the row sink was used, and the extracted elements.
pub struct CaptureOutcome {
    pub event: CanonicalEvent,
    pub row_id: Option<i64>,
    pub elements: Vec<Element>,
}

impl EventEmitter {
    pub fn new(
        team_manager: Arc<TeamManager>,
        definitions: Arc<DefinitionsManager>,
        person_store: Arc<PersonStore>,
        person_manager: Arc<PersonManager>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            team_manager,
            definitions,
            person_store,
            person_manager,
            sink,
        }
    }

    /// Canonicalize and publish one analytics event.
    #[allow(clippy::too_many_arguments)]
    pub async fn capture(
        &self,
        event_uuid: Uuid,
        person_uuid: Uuid,
        ip: Option<&str>,
        team_id: TeamId,
        event_name: &str,
        distinct_id: &str,
        mut properties: Properties,
        timestamp: DateTime<Utc>,
    ) -> Result<CaptureOutcome, IngestionError> {
        let event_name = sanitize_event_name(event_name);

        let elements = match properties.remove("$elements") {
            Some(Value::Array(raw)) => extract_elements(&raw),
            _ => Vec::new(),
        };

        let team = self.fetch_team(team_id).await?;
        apply_ip_rule(&mut properties, ip, &team);

        self.definitions
            .register_event(&team, &event_name, &properties)
            .await?;

        self.ensure_person(team_id, distinct_id, person_uuid, timestamp)
            .await?;

        inject_first_touch_properties(&mut properties);

        let set = object_prop(&properties, "$set");
        let set_once = object_prop(&properties, "$set_once");
        let increments = object_prop(&properties, "$increment");
        if !set.is_empty() || !set_once.is_empty() || !increments.is_empty() {
            self.person_store
                .update_person_properties(
                    team_id,
                    distinct_id,
                    person_uuid,
                    timestamp,
                    &set,
                    &set_once,
                    &increments,
                )
                .await?;
        }

        let event = CanonicalEvent {
            uuid: event_uuid,
            event: event_name,
            properties: Value::Object(properties).to_string(),
            timestamp,
            team_id,
            distinct_id: distinct_id.to_string(),
            elements_chain: elements_to_string(&elements),
            created_at: Utc::now(),
        };

        let row_id = self.sink.emit_event(&event, &elements).await?;

        Ok(CaptureOutcome {
            event,
            row_id,
            elements,
        })
    }

    /// Publish one `$snapshot` event. No element extraction, no definition
    /// updates; the payload goes out verbatim.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_snapshot(
        &self,
        event_uuid: Uuid,
        person_uuid: Uuid,
        ip: Option<&str>,
        team_id: TeamId,
        distinct_id: &str,
        mut properties: Properties,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestionError> {
        let team = self.fetch_team(team_id).await?;
        // Recordings follow the same IP rule as capture events.
        apply_ip_rule(&mut properties, ip, &team);

        self.ensure_person(team_id, distinct_id, person_uuid, timestamp)
            .await?;

        let session_id = properties
            .get("$session_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let snapshot_data = properties
            .get("$snapshot_data")
            .cloned()
            .unwrap_or(Value::Null);

        let snapshot = SessionRecordingEvent {
            uuid: event_uuid,
            team_id,
            distinct_id: distinct_id.to_string(),
            session_id,
            snapshot_data: snapshot_data.to_string(),
            timestamp,
            created_at: Utc::now(),
        };

        self.sink.emit_snapshot(&snapshot).await?;
        Ok(())
    }

    async fn fetch_team(&self, team_id: TeamId) -> Result<Arc<Team>, IngestionError> {
        self.team_manager
            .get_team(team_id)
            .await?
            .ok_or(IngestionError::UnknownTeam(team_id))
    }

    /// Make sure a person exists for this distinct id, creating one lazily.
    /// Losing the creation race to a peer worker is fine.
    async fn ensure_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        person_uuid: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestionError> {
        if !self
            .person_manager
            .is_new_person(team_id, distinct_id)
            .await?
        {
            return Ok(());
        }

        match self
            .person_store
            .create(
                timestamp,
                Properties::new(),
                team_id,
                None,
                false,
                person_uuid,
                &[distinct_id.to_string()],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::RaceCondition(_)) => {
                metrics::counter!(PERSON_CREATE_RACES).increment(1);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn sanitize_event_name(event_name: &str) -> String {
    event_name
        .replace('\u{0000}', "\u{FFFD}")
        .chars()
        .take(MAX_EVENT_NAME_LENGTH)
        .collect()
}

fn apply_ip_rule(properties: &mut Properties, ip: Option<&str>, team: &Team) {
    if let Some(ip) = ip {
        if !team.anonymize_ips && !properties.contains_key("$ip") {
            properties.insert("$ip".to_string(), json!(ip));
        }
    }
}

/// Copy first-touch properties into `$set_once` as `$initial_*`, without
/// overwriting anything the client sent.
fn inject_first_touch_properties(properties: &mut Properties) {
    let mut initial: Vec<(String, Value)> = Vec::new();
    for (key, value) in properties.iter() {
        let eligible =
            FIRST_TOUCH_PROPERTIES.contains(&key.as_str()) || key.starts_with("utm_");
        if eligible {
            let name = format!("$initial_{}", key.trim_start_matches('$'));
            initial.push((name, value.clone()));
        }
    }
    if initial.is_empty() {
        return;
    }

    let set_once = properties
        .entry("$set_once".to_string())
        .or_insert_with(|| Value::Object(Properties::new()));
    if let Value::Object(set_once) = set_once {
        for (key, value) in initial {
            set_once.entry(key).or_insert(value);
        }
    }
}

fn object_prop(properties: &Properties, key: &str) -> Properties {
    match properties.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Properties::new(),
    }
}
