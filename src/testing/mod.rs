//! In-memory fakes for the storage, producer and sink seams. They honor the
//! same constraints as postgres (unique distinct ids, foreign keys on
//! delete) so the retry protocols can be exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::definitions::{DefinitionsRepository, PropertyDefinitionUpsert};
use crate::elements::Element;
use crate::error::{SinkError, StoreError};
use crate::person::{PersonPatch, PersonRepository, PersonStore};
use crate::producer::{LogMessage, MessageProducer};
use crate::sink::EventSink;
use crate::team_manager::TeamRepository;
use crate::types::{
    CanonicalEvent, Organization, Person, Properties, SessionRecordingEvent, Team, TeamId,
};

// ============================================================
// Person repository
// ============================================================

#[derive(Default)]
struct PersonState {
    next_id: i64,
    persons: HashMap<i64, Person>,
    // (team_id, distinct_id) -> person row id
    distinct_ids: HashMap<(TeamId, String), i64>,
    // (person_id, cohort_id)
    cohort_memberships: Vec<(i64, i64)>,
}

/// In-memory `PersonRepository` with postgres-like constraint behavior.
#[derive(Default)]
pub struct MemoryPersonRepository {
    state: Mutex<PersonState>,
    // One-shot: a distinct id a "peer worker" commits onto the person being
    // deleted, landing between the delete's sweep and the person-row delete.
    inject_on_delete: Mutex<Option<String>>,
}

impl MemoryPersonRepository {
    /// Arrange for a peer to attach `distinct_id` to the next person that
    /// `delete_person` is called on, inside the delete's race window.
    pub fn add_distinct_id_during_next_delete(&self, distinct_id: &str) {
        *self.inject_on_delete.lock().unwrap() = Some(distinct_id.to_string());
    }

    pub fn person_count(&self) -> usize {
        self.state.lock().unwrap().persons.len()
    }

    pub fn distinct_ids_of(&self, team_id: TeamId) -> Vec<(String, i64)> {
        self.state
            .lock()
            .unwrap()
            .distinct_ids
            .iter()
            .filter(|((team, _), _)| *team == team_id)
            .map(|((_, distinct_id), person_id)| (distinct_id.clone(), *person_id))
            .collect()
    }

    pub fn add_cohort_membership(&self, person_id: i64, cohort_id: i64) {
        self.state
            .lock()
            .unwrap()
            .cohort_memberships
            .push((person_id, cohort_id));
    }

    pub fn cohort_memberships(&self) -> Vec<(i64, i64)> {
        self.state.lock().unwrap().cohort_memberships.clone()
    }
}

#[async_trait]
impl PersonRepository for MemoryPersonRepository {
    async fn fetch_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .distinct_ids
            .get(&(team_id, distinct_id.to_string()))
            .and_then(|person_id| state.persons.get(person_id))
            .cloned())
    }

    async fn distinct_id_exists(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .distinct_ids
            .contains_key(&(team_id, distinct_id.to_string())))
    }

    async fn create_person(
        &self,
        created_at: DateTime<Utc>,
        properties: Properties,
        team_id: TeamId,
        is_user_id: Option<i32>,
        is_identified: bool,
        uuid: Uuid,
        distinct_ids: &[String],
    ) -> Result<Person, StoreError> {
        let mut state = self.state.lock().unwrap();

        for distinct_id in distinct_ids {
            if state
                .distinct_ids
                .contains_key(&(team_id, distinct_id.clone()))
            {
                return Err(StoreError::RaceCondition(format!(
                    "duplicate key value violates unique constraint: ({team_id}, {distinct_id})"
                )));
            }
        }
        if state
            .persons
            .values()
            .any(|p| p.team_id == team_id && p.uuid == uuid)
        {
            return Err(StoreError::RaceCondition(format!(
                "duplicate key value violates unique constraint: ({team_id}, {uuid})"
            )));
        }

        state.next_id += 1;
        let person = Person {
            id: state.next_id,
            uuid,
            team_id,
            properties,
            created_at,
            is_identified,
            is_user_id,
        };
        state.persons.insert(person.id, person.clone());
        for distinct_id in distinct_ids {
            state
                .distinct_ids
                .insert((team_id, distinct_id.clone()), person.id);
        }
        Ok(person)
    }

    async fn update_person(
        &self,
        person: &Person,
        patch: PersonPatch,
    ) -> Result<Person, StoreError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .persons
            .get_mut(&person.id)
            .ok_or(StoreError::NotFound)?;
        if let Some(properties) = patch.properties {
            stored.properties = properties;
        }
        if let Some(created_at) = patch.created_at {
            stored.created_at = created_at;
        }
        if let Some(is_identified) = patch.is_identified {
            stored.is_identified = is_identified;
        }
        Ok(stored.clone())
    }

    async fn delete_person(&self, person: &Person) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        // Sweep the person's distinct ids, as the transaction would.
        let swept: Vec<(TeamId, String)> = state
            .distinct_ids
            .iter()
            .filter(|(_, person_id)| **person_id == person.id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &swept {
            state.distinct_ids.remove(key);
        }

        // A peer's insert can commit inside the statement gap.
        if let Some(distinct_id) = self.inject_on_delete.lock().unwrap().take() {
            state
                .distinct_ids
                .insert((person.team_id, distinct_id), person.id);
        }

        let remaining = state
            .distinct_ids
            .values()
            .any(|person_id| *person_id == person.id);
        if remaining {
            // Rolled back: the swept rows come back.
            for key in swept {
                state.distinct_ids.insert(key, person.id);
            }
            return Err(StoreError::ForeignKeyViolation(format!(
                "update or delete on posthog_person id {} violates foreign key constraint",
                person.id
            )));
        }

        state
            .cohort_memberships
            .retain(|(person_id, _)| *person_id != person.id);
        state.persons.remove(&person.id);
        Ok(())
    }

    async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = (person.team_id, distinct_id.to_string());
        if state.distinct_ids.contains_key(&key) {
            return Err(StoreError::RaceCondition(format!(
                "duplicate key value violates unique constraint: ({}, {distinct_id})",
                person.team_id
            )));
        }
        state.distinct_ids.insert(key, person.id);
        Ok(())
    }

    async fn move_distinct_ids(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.persons.contains_key(&to.id) {
            return Err(StoreError::RaceCondition(
                "target person no longer exists".to_string(),
            ));
        }
        let mut moved = Vec::new();
        for ((_, distinct_id), person_id) in state.distinct_ids.iter_mut() {
            if *person_id == from.id {
                *person_id = to.id;
                moved.push(distinct_id.clone());
            }
        }
        Ok(moved)
    }

    async fn apply_increments(
        &self,
        person: &Person,
        increments: &[(String, i64)],
    ) -> Result<Option<Properties>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.persons.get_mut(&person.id) else {
            return Ok(None);
        };
        for (key, amount) in increments {
            let next = match stored.properties.get(key).and_then(Value::as_i64) {
                Some(current) => current + amount,
                None => *amount,
            };
            stored.properties.insert(key.clone(), Value::from(next));
        }
        Ok(Some(stored.properties.clone()))
    }

    async fn reassign_cohorts(&self, from: &Person, to: &Person) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut seen: Vec<(i64, i64)> = Vec::new();
        for (person_id, cohort_id) in state.cohort_memberships.iter_mut() {
            if *person_id == from.id {
                *person_id = to.id;
            }
            if seen.contains(&(*person_id, *cohort_id)) {
                // Flag duplicates for removal below.
                *person_id = -1;
            } else {
                seen.push((*person_id, *cohort_id));
            }
        }
        state
            .cohort_memberships
            .retain(|(person_id, _)| *person_id != -1);
        Ok(())
    }
}

/// A person store wired to the in-memory repository, with no columnar client
/// and the default topics.
pub fn memory_person_store(
    repository: Arc<MemoryPersonRepository>,
    producer: Option<Arc<RecordingProducer>>,
) -> PersonStore {
    PersonStore::new(
        repository,
        producer.map(|p| p as Arc<dyn MessageProducer>),
        None,
        "clickhouse_person".to_string(),
        "clickhouse_person_distinct_id".to_string(),
    )
}

// ============================================================
// Team repository
// ============================================================

#[derive(Default)]
pub struct MemoryTeamRepository {
    teams: Mutex<HashMap<TeamId, Team>>,
    organizations: Mutex<HashMap<Uuid, Organization>>,
    fetches: AtomicUsize,
}

impl MemoryTeamRepository {
    pub fn insert_team(&self, team: Team) {
        self.teams.lock().unwrap().insert(team.id, team);
    }

    pub fn insert_organization(&self, organization: Organization) {
        self.organizations
            .lock()
            .unwrap()
            .insert(organization.id, organization);
    }

    pub fn team_fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TeamRepository for MemoryTeamRepository {
    async fn fetch_team(&self, team_id: TeamId) -> Result<Option<Team>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.teams.lock().unwrap().get(&team_id).cloned())
    }

    async fn fetch_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Organization>, StoreError> {
        Ok(self
            .organizations
            .lock()
            .unwrap()
            .get(&organization_id)
            .cloned())
    }
}

// ============================================================
// Definitions repository
// ============================================================

#[derive(Default)]
pub struct MemoryDefinitionsRepository {
    events: Mutex<Vec<String>>,
    properties: Mutex<Vec<PropertyDefinitionUpsert>>,
    event_properties: Mutex<Vec<(TeamId, String, String)>>,
}

impl MemoryDefinitionsRepository {
    pub fn event_definitions(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn property_definitions(&self) -> Vec<PropertyDefinitionUpsert> {
        self.properties.lock().unwrap().clone()
    }

    pub fn event_property_count(&self) -> usize {
        self.event_properties.lock().unwrap().len()
    }
}

#[async_trait]
impl DefinitionsRepository for MemoryDefinitionsRepository {
    async fn upsert_event_definition(
        &self,
        _team_id: TeamId,
        _project_id: i64,
        name: &str,
        _last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn upsert_property_definition(
        &self,
        def: &PropertyDefinitionUpsert,
    ) -> Result<(), StoreError> {
        self.properties.lock().unwrap().push(def.clone());
        Ok(())
    }

    async fn upsert_event_property(
        &self,
        team_id: TeamId,
        _project_id: i64,
        event: &str,
        property: &str,
    ) -> Result<(), StoreError> {
        self.event_properties
            .lock()
            .unwrap()
            .push((team_id, event.to_string(), property.to_string()));
        Ok(())
    }
}

// ============================================================
// Producer and sink
// ============================================================

/// Captures queued messages per topic.
#[derive(Default)]
pub struct RecordingProducer {
    messages: Mutex<Vec<(String, LogMessage)>>,
}

impl RecordingProducer {
    pub fn messages_for(&self, topic: &str) -> Vec<LogMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.messages_for(topic).len()
    }
}

#[async_trait]
impl MessageProducer for RecordingProducer {
    async fn queue(&self, topic: &str, messages: Vec<LogMessage>) -> Result<(), crate::error::ProducerError> {
        let mut stored = self.messages.lock().unwrap();
        for message in messages {
            stored.push((topic.to_string(), message));
        }
        Ok(())
    }
}

/// Captures emitted canonical events and snapshots, handing out sequential
/// row ids like the row sink would.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(CanonicalEvent, Vec<Element>)>>,
    snapshots: Mutex<Vec<SessionRecordingEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<CanonicalEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn elements_of_last_event(&self) -> Vec<Element> {
        self.events
            .lock()
            .unwrap()
            .last()
            .map(|(_, elements)| elements.clone())
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<SessionRecordingEvent> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit_event(
        &self,
        event: &CanonicalEvent,
        elements: &[Element],
    ) -> Result<Option<i64>, SinkError> {
        let mut events = self.events.lock().unwrap();
        events.push((event.clone(), elements.to_vec()));
        Ok(Some(events.len() as i64))
    }

    async fn emit_snapshot(&self, snapshot: &SessionRecordingEvent) -> Result<(), SinkError> {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

/// Records tombstone DDL issued against the columnar store.
#[derive(Default)]
pub struct RecordingColumnarClient {
    queries: Mutex<Vec<String>>,
}

impl RecordingColumnarClient {
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::person::ColumnarClient for RecordingColumnarClient {
    async fn execute(&self, query: &str) -> Result<(), StoreError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(())
    }
}
